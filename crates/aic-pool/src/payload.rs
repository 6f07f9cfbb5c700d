//! Statistics payload stored in pool slots.
//!
//! A payload references the statistics bytes produced by the hardware
//! statistics stage together with the optional per-frame metadata the
//! driver attaches (illumination, flash stage, sensor gains).
//!
//! # Design
//!
//! - **No payload copy**: `data` is a [`bytes::Bytes`] handle, so filling a
//!   slot only bumps a reference count on the caller's buffer
//! - **Inline metadata**: small `Copy` fields, no boxing
//! - **O(1) reset**: dropping the handle releases the caller's memory

use bytes::Bytes;

/// Opaque frame statistics plus driver-supplied metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsPayload {
    /// Raw statistics as written by the statistics terminals.
    pub data: Bytes,

    /// Whether the frame was illuminated (flash or IR emitter active).
    pub illuminated: bool,

    /// Flash stage reported by the driver (0 = no flash).
    pub flash_stage: u32,

    /// Sensor analog gain applied to the frame, if known.
    pub analog_gain: Option<f32>,

    /// Sensor digital gain applied to the frame, if known.
    pub digital_gain: Option<f32>,
}

impl StatsPayload {
    /// Wrap a statistics blob without metadata.
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Attach sensor gains.
    #[must_use]
    pub fn with_gains(mut self, analog: f32, digital: f32) -> Self {
        self.analog_gain = Some(analog);
        self.digital_gain = Some(digital);
        self
    }

    /// Attach illumination metadata.
    #[must_use]
    pub fn with_illumination(mut self, illuminated: bool, flash_stage: u32) -> Self {
        self.illuminated = illuminated;
        self.flash_stage = flash_stage;
        self
    }

    /// Number of statistics bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no statistics bytes are attached.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
