//! Tuning-derived defaults.
//!
//! The tuning collaborator turns a tuning blob into [`TuningDefaults`], from
//! which the cold-start bundle is built. Every section is optional in the
//! serialized form and falls back to the built-in default.

use crate::results::{
    BitCompressionResult, ColorResult, ExposureResult, FocusResult, LocalToneMapResult,
    ResultBundle, ShadingResult, StabilizationResult, ToneMapResult, WhiteBalanceResult,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default algorithm results used until a frame has real results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningDefaults {
    pub exposure: ExposureResult,
    pub white_balance: WhiteBalanceResult,
    pub focus: FocusResult,
    pub color: ColorResult,
    pub tone_map: ToneMapResult,
    pub shading: ShadingResult,
    pub local_tone_map: LocalToneMapResult,
    pub stabilization: StabilizationResult,
    pub bit_compression: BitCompressionResult,
}

impl TuningDefaults {
    /// Build the cold-start bundle. Every module is present.
    #[must_use]
    pub fn cold_start_bundle(&self) -> ResultBundle {
        ResultBundle {
            exposure: Some(Arc::new(self.exposure.clone())),
            white_balance: Some(Arc::new(self.white_balance.clone())),
            focus: Some(Arc::new(self.focus.clone())),
            color: Some(Arc::new(self.color.clone())),
            tone_map: Some(Arc::new(self.tone_map.clone())),
            shading: Some(Arc::new(self.shading.clone())),
            local_tone_map: Some(Arc::new(self.local_tone_map.clone())),
            stabilization: Some(Arc::new(self.stabilization.clone())),
            bit_compression: Some(Arc::new(self.bit_compression.clone())),
        }
    }
}
