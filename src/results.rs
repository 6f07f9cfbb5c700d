//! Per-frame algorithm results.
//!
//! A [`ResultBundle`] aggregates the outputs of the image-quality algorithms
//! for one frame. Every sub-result is optional and independently owned
//! through an `Arc`, so a bundle can be cloned cheaply and a sub-result can
//! be shared between the producing algorithm and the cache. The contents are
//! opaque to this crate; only their presence and lifetime are managed here.
//!
//! Presence is reported as a [`ResultModules`] bitmap, computed from the
//! fields themselves so the two can never disagree.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

bitflags! {
    /// Presence bitmap, one bit per result module.
    ///
    /// Bit 8 is unassigned.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct ResultModules: u32 {
        const EXPOSURE = 1;
        const FOCUS = 1 << 1;
        const WHITE_BALANCE = 1 << 2;
        const COLOR = 1 << 3;
        const SHADING = 1 << 4;
        const TONE_MAP = 1 << 5;
        const LOCAL_TONE_MAP = 1 << 6;
        const STABILIZATION = 1 << 7;
        const BIT_COMPRESSION = 1 << 9;
    }
}

/// Auto exposure output for the next frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureResult {
    pub exposure_time_us: u32,
    pub analog_gain: f32,
    pub digital_gain: f32,
    /// Total target exposure (time x gain) in microseconds.
    pub total_target_exposure: u32,
    pub lux_level_estimate: f32,
    pub converged: bool,
}

impl Default for ExposureResult {
    fn default() -> Self {
        Self {
            exposure_time_us: 33_000,
            analog_gain: 1.0,
            digital_gain: 1.0,
            total_target_exposure: 33_000,
            lux_level_estimate: 0.0,
            converged: false,
        }
    }
}

/// Auto white balance output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhiteBalanceResult {
    pub accurate_r_per_g: f32,
    pub accurate_b_per_g: f32,
    pub final_r_per_g: f32,
    pub final_b_per_g: f32,
    /// Correlated color temperature in kelvin.
    pub cct: u32,
    pub distance_from_convergence: f32,
}

impl Default for WhiteBalanceResult {
    fn default() -> Self {
        Self {
            accurate_r_per_g: 1.0,
            accurate_b_per_g: 1.0,
            final_r_per_g: 1.0,
            final_b_per_g: 1.0,
            cct: 5000,
            distance_from_convergence: 0.0,
        }
    }
}

/// Auto focus output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FocusResult {
    pub next_lens_position: i32,
    pub lens_driver_action: bool,
    pub final_lens_position_reached: bool,
    pub focus_distance_mm: u32,
}

/// Parameter adaptor output: color gains and correction matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorResult {
    /// R, Gr, Gb, B gains.
    pub color_gains: [f32; 4],
    pub color_conversion_matrix: [[f32; 3]; 3],
    /// Black level per Bayer channel.
    pub black_level: [f32; 4],
    pub saturation_factor: f32,
}

impl Default for ColorResult {
    fn default() -> Self {
        Self {
            color_gains: [1.0; 4],
            color_conversion_matrix: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            black_level: [0.0; 4],
            saturation_factor: 1.0,
        }
    }
}

/// Global tone map and gamma.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ToneMapResult {
    pub gamma_lut: Vec<u16>,
    pub tone_map_lut: Vec<u16>,
    pub ev_shift: f32,
}

impl Clone for ToneMapResult {
    fn clone(&self) -> Self {
        Self {
            gamma_lut: self.gamma_lut.clone(),
            tone_map_lut: self.tone_map_lut.clone(),
            ev_shift: self.ev_shift,
        }
    }

    fn clone_from(&mut self, source: &Self) {
        self.gamma_lut.clone_from(&source.gamma_lut);
        self.tone_map_lut.clone_from(&source.tone_map_lut);
        self.ev_shift = source.ev_shift;
    }
}

impl Default for ToneMapResult {
    fn default() -> Self {
        // Identity curves, 33 knee points over 0..=4096
        let identity: Vec<u16> = (0..33u16).map(|i| i * 128).collect();
        Self {
            gamma_lut: identity.clone(),
            tone_map_lut: identity,
            ev_shift: 0.0,
        }
    }
}

/// Lens shading correction tables.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ShadingResult {
    pub grid_width: u16,
    pub grid_height: u16,
    /// Gains for the four Bayer channels, channel-interleaved, Q8.8.
    pub gains: Vec<u16>,
    pub lsc_update: bool,
}

impl Clone for ShadingResult {
    fn clone(&self) -> Self {
        Self {
            grid_width: self.grid_width,
            grid_height: self.grid_height,
            gains: self.gains.clone(),
            lsc_update: self.lsc_update,
        }
    }

    fn clone_from(&mut self, source: &Self) {
        self.grid_width = source.grid_width;
        self.grid_height = source.grid_height;
        self.gains.clone_from(&source.gains);
        self.lsc_update = source.lsc_update;
    }
}

impl Default for ShadingResult {
    fn default() -> Self {
        let (w, h) = (8u16, 6u16);
        Self {
            grid_width: w,
            grid_height: h,
            gains: vec![256; usize::from(w) * usize::from(h) * 4],
            lsc_update: false,
        }
    }
}

/// Local tone map output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalToneMapResult {
    pub ltm_gain: f32,
    pub dynamic_range_ratio: f32,
    pub enabled: bool,
}

impl Default for LocalToneMapResult {
    fn default() -> Self {
        Self {
            ltm_gain: 1.0,
            dynamic_range_ratio: 1.0,
            enabled: false,
        }
    }
}

/// Digital video stabilization output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilizationResult {
    pub zoom_ratio: f32,
    pub offset_x: i32,
    pub offset_y: i32,
}

impl Default for StabilizationResult {
    fn default() -> Self {
        Self {
            zoom_ratio: 1.0,
            offset_x: 0,
            offset_y: 0,
        }
    }
}

/// Bit compression (companding) curve.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct BitCompressionResult {
    pub input_bits: u8,
    pub output_bits: u8,
    pub lut: Vec<u32>,
}

impl Clone for BitCompressionResult {
    fn clone(&self) -> Self {
        Self {
            input_bits: self.input_bits,
            output_bits: self.output_bits,
            lut: self.lut.clone(),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        self.input_bits = source.input_bits;
        self.output_bits = source.output_bits;
        self.lut.clone_from(&source.lut);
    }
}

impl Default for BitCompressionResult {
    fn default() -> Self {
        Self {
            input_bits: 12,
            output_bits: 12,
            lut: Vec::new(),
        }
    }
}

/// Results of every algorithm for one frame.
///
/// Cloning a bundle clones `Arc`s, never the records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultBundle {
    pub exposure: Option<Arc<ExposureResult>>,
    pub white_balance: Option<Arc<WhiteBalanceResult>>,
    pub focus: Option<Arc<FocusResult>>,
    pub color: Option<Arc<ColorResult>>,
    pub tone_map: Option<Arc<ToneMapResult>>,
    pub shading: Option<Arc<ShadingResult>>,
    pub local_tone_map: Option<Arc<LocalToneMapResult>>,
    pub stabilization: Option<Arc<StabilizationResult>>,
    pub bit_compression: Option<Arc<BitCompressionResult>>,
}

/// Applies `$m!(field, MODULE)` to every bundle field.
macro_rules! for_each_module {
    ($m:ident) => {
        $m!(exposure, EXPOSURE);
        $m!(white_balance, WHITE_BALANCE);
        $m!(focus, FOCUS);
        $m!(color, COLOR);
        $m!(tone_map, TONE_MAP);
        $m!(shading, SHADING);
        $m!(local_tone_map, LOCAL_TONE_MAP);
        $m!(stabilization, STABILIZATION);
        $m!(bit_compression, BIT_COMPRESSION);
    };
}

impl ResultBundle {
    /// Empty bundle, no module present.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle with every module set to its built-in default.
    #[must_use]
    pub fn defaults() -> Self {
        Self {
            exposure: Some(Arc::default()),
            white_balance: Some(Arc::default()),
            focus: Some(Arc::default()),
            color: Some(Arc::default()),
            tone_map: Some(Arc::default()),
            shading: Some(Arc::default()),
            local_tone_map: Some(Arc::default()),
            stabilization: Some(Arc::default()),
            bit_compression: Some(Arc::default()),
        }
    }

    /// Presence bitmap.
    #[must_use]
    pub fn modules(&self) -> ResultModules {
        let mut modules = ResultModules::empty();
        macro_rules! mark {
            ($field:ident, $bit:ident) => {
                if self.$field.is_some() {
                    modules |= ResultModules::$bit;
                }
            };
        }
        for_each_module!(mark);
        modules
    }

    /// True when every module is present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.modules().is_all()
    }

    /// Copy of the bundle with freshly allocated records, sharing nothing
    /// with `self`.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        let mut copy = Self::default();
        copy.copy_from(self);
        copy
    }

    /// Make `self` an independent copy of `source`, reusing the records
    /// `self` already owns.
    ///
    /// A record is overwritten in place only when no one else holds it;
    /// shared records are replaced by a fresh copy, so clones handed out
    /// earlier keep their contents. With the same modules present on both
    /// sides and nothing shared, no memory is allocated.
    pub fn copy_from(&mut self, source: &Self) {
        macro_rules! copy_field {
            ($field:ident, $bit:ident) => {
                match (&mut self.$field, &source.$field) {
                    (Some(own), Some(theirs)) => Arc::make_mut(own).clone_from(&**theirs),
                    (slot, theirs) => *slot = theirs.as_deref().cloned().map(Arc::new),
                }
            };
        }
        for_each_module!(copy_field);
    }

    /// Bundle where every module absent here is taken from `fallback`.
    #[must_use]
    pub fn filled_from(&self, fallback: &Self) -> Self {
        let mut filled = self.clone();
        macro_rules! fill_field {
            ($field:ident, $bit:ident) => {
                if filled.$field.is_none() {
                    filled.$field = fallback.$field.clone();
                }
            };
        }
        for_each_module!(fill_field);
        filled
    }

    /// Drop the modules selected by `modules`.
    pub fn clear_modules(&mut self, modules: ResultModules) {
        macro_rules! clear_field {
            ($field:ident, $bit:ident) => {
                if modules.contains(ResultModules::$bit) {
                    self.$field = None;
                }
            };
        }
        for_each_module!(clear_field);
    }

    #[must_use]
    pub fn with_exposure(mut self, result: ExposureResult) -> Self {
        self.exposure = Some(Arc::new(result));
        self
    }

    #[must_use]
    pub fn with_white_balance(mut self, result: WhiteBalanceResult) -> Self {
        self.white_balance = Some(Arc::new(result));
        self
    }

    #[must_use]
    pub fn with_focus(mut self, result: FocusResult) -> Self {
        self.focus = Some(Arc::new(result));
        self
    }

    #[must_use]
    pub fn with_color(mut self, result: ColorResult) -> Self {
        self.color = Some(Arc::new(result));
        self
    }

    #[must_use]
    pub fn with_tone_map(mut self, result: ToneMapResult) -> Self {
        self.tone_map = Some(Arc::new(result));
        self
    }

    #[must_use]
    pub fn with_shading(mut self, result: ShadingResult) -> Self {
        self.shading = Some(Arc::new(result));
        self
    }

    #[must_use]
    pub fn with_local_tone_map(mut self, result: LocalToneMapResult) -> Self {
        self.local_tone_map = Some(Arc::new(result));
        self
    }

    #[must_use]
    pub fn with_stabilization(mut self, result: StabilizationResult) -> Self {
        self.stabilization = Some(Arc::new(result));
        self
    }

    #[must_use]
    pub fn with_bit_compression(mut self, result: BitCompressionResult) -> Self {
        self.bit_compression = Some(Arc::new(result));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modules_follow_fields() {
        let bundle = ResultBundle::new()
            .with_exposure(ExposureResult::default())
            .with_focus(FocusResult::default());
        assert_eq!(
            bundle.modules(),
            ResultModules::EXPOSURE | ResultModules::FOCUS
        );
        assert_eq!(bundle.modules().bits().count_ones(), 2);
        assert!(!bundle.is_complete());
        assert!(ResultBundle::defaults().is_complete());
    }

    #[test]
    fn test_module_bits_match_hardware_bitmap() {
        assert_eq!(ResultModules::EXPOSURE.bits(), 1);
        assert_eq!(ResultModules::WHITE_BALANCE.bits(), 4);
        assert_eq!(ResultModules::BIT_COMPRESSION.bits(), 512);
        assert_eq!(ResultModules::from_bits_truncate(u32::MAX), ResultModules::all());
        assert!(!ResultModules::all().contains(ResultModules::from_bits_retain(1 << 8)));
    }

    #[test]
    fn test_deep_copy_shares_nothing() {
        let bundle = ResultBundle::new().with_shading(ShadingResult::default());
        let copy = bundle.deep_copy();

        assert_eq!(copy, bundle);
        let (a, b) = (bundle.shading.unwrap(), copy.shading.unwrap());
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_copy_from_reuses_unshared_records() {
        let mut target = ResultBundle::defaults();
        let tone_map = Arc::as_ptr(target.tone_map.as_ref().unwrap());
        let lut = target.shading.as_ref().unwrap().gains.as_ptr();

        let mut shading = ShadingResult::default();
        shading.gains.fill(300);
        let source = ResultBundle::defaults().with_shading(shading);
        target.copy_from(&source);

        assert_eq!(target, source);
        assert_eq!(Arc::as_ptr(target.tone_map.as_ref().unwrap()), tone_map);
        assert_eq!(target.shading.as_ref().unwrap().gains.as_ptr(), lut);
        assert!(!Arc::ptr_eq(
            target.shading.as_ref().unwrap(),
            source.shading.as_ref().unwrap()
        ));
    }

    #[test]
    fn test_copy_from_leaves_outstanding_clones_alone() {
        let mut target = ResultBundle::defaults();
        let handed_out = target.clone();

        let source = ResultBundle::new().with_exposure(ExposureResult {
            exposure_time_us: 1_234,
            ..ExposureResult::default()
        });
        target.copy_from(&source);

        assert_eq!(target.modules(), ResultModules::EXPOSURE);
        assert_eq!(target.exposure.as_ref().unwrap().exposure_time_us, 1_234);
        assert_eq!(handed_out, ResultBundle::defaults());
    }

    #[test]
    fn test_clone_shares_records() {
        let bundle = ResultBundle::new().with_tone_map(ToneMapResult::default());
        let clone = bundle.clone();
        assert!(Arc::ptr_eq(
            bundle.tone_map.as_ref().unwrap(),
            clone.tone_map.as_ref().unwrap()
        ));
    }

    #[test]
    fn test_filled_from_only_fills_gaps() {
        let own = ExposureResult {
            exposure_time_us: 10_000,
            ..ExposureResult::default()
        };
        let partial = ResultBundle::new().with_exposure(own.clone());
        let filled = partial.filled_from(&ResultBundle::defaults());

        assert!(filled.is_complete());
        assert_eq!(filled.exposure.as_deref(), Some(&own));
    }

    #[test]
    fn test_clear_modules() {
        let mut bundle = ResultBundle::defaults();
        bundle.clear_modules(ResultModules::FOCUS | ResultModules::SHADING);
        assert!(bundle.focus.is_none());
        assert!(bundle.shading.is_none());
        assert_eq!(bundle.modules().bits().count_ones(), 7);
    }
}
