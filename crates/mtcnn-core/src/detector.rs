//! MTCNN face detector.
//!
//! Runs the proposal network over an image pyramid, then rescores the
//! survivors with the refine and output networks. Every stage only narrows
//! the candidate set; an empty set ends the cascade early without further
//! inference.

use crate::alignment::{self, AlignOptions};
use crate::config::{CascadeConfig, ConfigError};
use crate::network::{InferenceError, Network};
use crate::onnx::OnnxNetwork;
use crate::pyramid::{Pyramid, PyramidScale};
use crate::stages;
use crate::types::FaceAnnotation;
use image::RgbImage;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub const PROPOSAL_MODEL_FILE: &str = "pnet.onnx";
pub const REFINE_MODEL_FILE: &str = "rnet.onnx";
pub const OUTPUT_MODEL_FILE: &str = "onet.onnx";

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("no image to align: run detection first or pass one explicitly")]
    NoImage,
}

/// The three cascade networks. Loaded once, shared read-only afterwards.
pub struct CascadeNets {
    pub proposal: Arc<dyn Network>,
    pub refine: Arc<dyn Network>,
    pub output: Arc<dyn Network>,
}

impl CascadeNets {
    pub fn new(
        proposal: impl Network + 'static,
        refine: impl Network + 'static,
        output: impl Network + 'static,
    ) -> Self {
        Self {
            proposal: Arc::new(proposal),
            refine: Arc::new(refine),
            output: Arc::new(output),
        }
    }

    /// Load `pnet.onnx`, `rnet.onnx` and `onet.onnx` from `model_dir`.
    pub fn load(model_dir: &Path, intra_threads: usize) -> Result<Self, InferenceError> {
        let proposal = OnnxNetwork::load(&model_dir.join(PROPOSAL_MODEL_FILE), intra_threads)?;
        let refine = OnnxNetwork::load(&model_dir.join(REFINE_MODEL_FILE), intra_threads)?;
        let output = OnnxNetwork::load(&model_dir.join(OUTPUT_MODEL_FILE), intra_threads)?;
        Ok(Self::new(proposal, refine, output))
    }
}

/// Cascaded face detector. Cheap to clone; clones share the networks.
#[derive(Clone)]
pub struct Mtcnn {
    nets: Arc<CascadeNets>,
    config: CascadeConfig,
}

impl Mtcnn {
    /// Build a detector, rejecting invalid configuration up front.
    pub fn new(nets: CascadeNets, config: CascadeConfig) -> Result<Self, DetectorError> {
        Self::with_shared(Arc::new(nets), config)
    }

    pub fn with_shared(nets: Arc<CascadeNets>, config: CascadeConfig) -> Result<Self, DetectorError> {
        config.validate()?;
        Ok(Self { nets, config })
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    /// Pyramid levels used for an image of the given size.
    pub fn pyramid(&self, width: u32, height: u32) -> Pyramid {
        Pyramid::new(width, height, self.config.min_face_size, self.config.scale_factor)
    }

    /// Detect faces, returning them in final suppression order.
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<FaceAnnotation>, DetectorError> {
        let (width, height) = image.dimensions();
        let scales: Vec<PyramidScale> = self.pyramid(width, height).collect();
        if scales.is_empty() {
            tracing::debug!(width, height, "image smaller than the minimum face, skipping");
            return Ok(Vec::new());
        }

        let [t1, t2, t3] = self.config.thresholds;

        let proposals = stages::collect_proposals(
            image,
            &scales,
            self.nets.proposal.as_ref(),
            t1,
            self.config.parallel_scales,
        )?;
        tracing::debug!(scales = scales.len(), candidates = proposals.len(), "stage 1: proposals");
        if proposals.is_empty() {
            return Ok(Vec::new());
        }

        let refined = stages::refine(image, proposals, self.nets.refine.as_ref(), t2)?;
        tracing::debug!(candidates = refined.len(), "stage 2: refined");
        if refined.is_empty() {
            return Ok(Vec::new());
        }

        let faces = stages::finalize(image, refined, self.nets.output.as_ref(), t3)?;
        tracing::debug!(faces = faces.len(), "stage 3: finalized");

        Ok(faces)
    }

    /// Crop each face out of `image`; see [`alignment::align_faces`].
    pub fn align(
        &self,
        image: &RgbImage,
        faces: &[FaceAnnotation],
        options: &AlignOptions,
    ) -> Vec<RgbImage> {
        alignment::align_faces(image, faces, options)
    }
}
