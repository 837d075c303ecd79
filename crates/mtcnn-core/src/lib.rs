//! mtcnn-core: cascaded face detection, landmarks and alignment.
//!
//! Runs the three MTCNN networks (proposal, refine, output) over an image
//! pyramid via ONNX Runtime, or any other [`Network`] implementation.

pub mod alignment;
pub mod config;
pub mod detector;
pub mod geometry;
pub mod network;
pub mod onnx;
pub mod pyramid;
pub mod service;
mod stages;
pub mod types;

pub use alignment::{align_faces, align_to_template, AlignOptions};
pub use config::{CascadeConfig, ConfigError};
pub use detector::{CascadeNets, DetectorError, Mtcnn};
pub use network::{InferenceError, NetOutput, Network};
pub use onnx::OnnxNetwork;
pub use pyramid::{Pyramid, PyramidScale};
pub use service::{FaceService, ImageSource};
pub use types::{BoundingBox, FaceAnnotation, Landmark, LandmarkType, Position};

use std::path::PathBuf;

/// Default location of `pnet.onnx`, `rnet.onnx` and `onet.onnx`:
/// `$XDG_DATA_HOME/mtcnn/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("mtcnn")
        .join("models")
}
