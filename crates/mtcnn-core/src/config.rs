//! Cascade tuning: minimum face size, pyramid decay and per-stage thresholds.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("minimum face size must be a positive number of pixels, got {0}")]
    MinFaceSize(f32),
    #[error("scale factor must be in (0, 1), got {0}")]
    ScaleFactor(f32),
    #[error("stage {stage} threshold must be in [0, 1], got {value}")]
    Threshold { stage: usize, value: f32 },
}

/// Cascade parameters, fixed for the lifetime of a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Smallest face to look for, in pixels.
    pub min_face_size: f32,
    /// Pyramid decay between consecutive scales.
    pub scale_factor: f32,
    /// Face probability cut-offs for the proposal, refine and output stages.
    pub thresholds: [f32; 3],
    /// Run pyramid levels of the proposal stage on the rayon pool.
    pub parallel_scales: bool,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            min_face_size: 20.0,
            scale_factor: 0.709,
            thresholds: [0.6, 0.7, 0.7],
            parallel_scales: true,
        }
    }
}

impl CascadeConfig {
    /// Reject out-of-range values. Nothing is clamped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min_face_size.is_finite() && self.min_face_size > 0.0) {
            return Err(ConfigError::MinFaceSize(self.min_face_size));
        }
        if !(self.scale_factor > 0.0 && self.scale_factor < 1.0) {
            return Err(ConfigError::ScaleFactor(self.scale_factor));
        }
        for (i, &value) in self.thresholds.iter().enumerate() {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Threshold { stage: i + 1, value });
            }
        }
        Ok(())
    }
}
