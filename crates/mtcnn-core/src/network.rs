//! The inference capability the cascade is written against.
//!
//! Each of the three cascade networks is a [`Network`]: it takes an NCHW
//! batch of normalized RGB crops and returns face probabilities, box
//! regressions and (for the output stage) landmark offsets. The ONNX Runtime
//! implementation lives in [`crate::onnx`]; tests plug in stubs.

use crate::geometry::Deltas;
use image::RgbImage;
use ndarray::{Array4, ArrayView4};
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_SCALE: f32 = 0.0078125; // 1 / 128
const PROBABILITY_CHANNELS: usize = 2;
const REGRESSION_CHANNELS: usize = 4;
const LANDMARK_CHANNELS: usize = 10;

/// Index of the "face" class in the two-way softmax.
const FACE_CLASS: usize = 1;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("model file not found: {0} (export pnet, rnet and onet to ONNX and place them in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    Failed(String),
    #[error("{net} network returned {tensor} with shape {shape:?}, expected {expected}")]
    BadShape {
        net: &'static str,
        tensor: &'static str,
        shape: Vec<usize>,
        expected: String,
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Raw outputs of one network call.
///
/// All tensors are `(N, C, H, W)`. The refine and output networks produce one
/// value per crop, so their `H` and `W` are 1.
#[derive(Debug, Clone)]
pub struct NetOutput {
    /// Two-way softmax, channel 1 is the face probability.
    pub probabilities: Array4<f32>,
    /// `[dx1, dy1, dx2, dy2]` per cell.
    pub regressions: Array4<f32>,
    /// `[x0..x4, y0..y4]` per crop, relative to the crop box.
    pub landmarks: Option<Array4<f32>>,
}

impl NetOutput {
    pub fn face_probability(&self, n: usize, row: usize, col: usize) -> f32 {
        self.probabilities[[n, FACE_CLASS, row, col]]
    }

    pub fn deltas(&self, n: usize, row: usize, col: usize) -> Deltas {
        let r = &self.regressions;
        Deltas {
            dx1: r[[n, 0, row, col]],
            dy1: r[[n, 1, row, col]],
            dx2: r[[n, 2, row, col]],
            dy2: r[[n, 3, row, col]],
        }
    }

    pub fn landmark_offsets(&self, n: usize) -> Option<[f32; LANDMARK_CHANNELS]> {
        self.landmarks
            .as_ref()
            .map(|l| std::array::from_fn(|c| l[[n, c, 0, 0]]))
    }

    /// Verify batch size, channel counts and matching spatial grids before
    /// any indexing happens.
    pub(crate) fn check(
        &self,
        net: &'static str,
        batch: usize,
        need_landmarks: bool,
    ) -> Result<(), InferenceError> {
        let (pn, pc, ph, pw) = self.probabilities.dim();
        if pn != batch || pc != PROBABILITY_CHANNELS {
            return Err(bad_shape(net, "probabilities", &self.probabilities, batch, PROBABILITY_CHANNELS));
        }

        let (rn, rc, rh, rw) = self.regressions.dim();
        if rn != batch || rc != REGRESSION_CHANNELS || rh != ph || rw != pw {
            return Err(bad_shape(net, "regressions", &self.regressions, batch, REGRESSION_CHANNELS));
        }

        match &self.landmarks {
            Some(l) => {
                let (ln, lc, _, _) = l.dim();
                if ln != batch || lc != LANDMARK_CHANNELS {
                    return Err(bad_shape(net, "landmarks", l, batch, LANDMARK_CHANNELS));
                }
            }
            None if need_landmarks => {
                return Err(InferenceError::Failed(format!(
                    "{net} network returned no landmark tensor"
                )));
            }
            None => {}
        }

        Ok(())
    }
}

fn bad_shape(
    net: &'static str,
    tensor: &'static str,
    array: &Array4<f32>,
    batch: usize,
    channels: usize,
) -> InferenceError {
    InferenceError::BadShape {
        net,
        tensor,
        shape: array.shape().to_vec(),
        expected: format!("({batch}, {channels}, H, W)"),
    }
}

/// One cascade network.
///
/// Implementations must be callable from several threads at once; the
/// proposal stage may run pyramid levels in parallel.
pub trait Network: Send + Sync {
    fn predict(&self, input: ArrayView4<'_, f32>) -> Result<NetOutput, InferenceError>;
}

impl<F> Network for F
where
    F: Fn(ArrayView4<'_, f32>) -> Result<NetOutput, InferenceError> + Send + Sync,
{
    fn predict(&self, input: ArrayView4<'_, f32>) -> Result<NetOutput, InferenceError> {
        self(input)
    }
}

/// Normalize an RGB image into a `(1, 3, H, W)` tensor.
pub fn image_to_tensor(image: &RgbImage) -> Array4<f32> {
    let mut tensor =
        Array4::<f32>::zeros((1, 3, image.height() as usize, image.width() as usize));
    write_normalized(image, &mut tensor, 0);
    tensor
}

/// Write `image` into batch slot `n` of an NCHW tensor of matching size.
pub(crate) fn write_normalized(image: &RgbImage, tensor: &mut Array4<f32>, n: usize) {
    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            tensor[[n, c, y, x]] = (pixel[c] as f32 - PIXEL_MEAN) * PIXEL_SCALE;
        }
    }
}
