//! Cascade networks via ONNX Runtime.
//!
//! Expects models exported with a single NCHW float input (RGB, normalized as
//! in [`crate::network::image_to_tensor`]) and softmax probability, box
//! regression and, for the output network, landmark outputs.

use crate::network::{InferenceError, NetOutput, Network};
use ndarray::{Array4, ArrayView4};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

const PROBABILITY_CHANNELS: usize = 2;
const REGRESSION_CHANNELS: usize = 4;
const LANDMARK_CHANNELS: usize = 10;

/// Output tensor positions: (probabilities, regressions, landmarks).
type OutputIndices = (usize, usize, Option<usize>);

/// One cascade stage backed by an ONNX Runtime session.
///
/// `Session::run` needs exclusive access, so concurrent callers take turns on
/// the mutex. The weights themselves are never modified after load.
pub struct OnnxNetwork {
    name: String,
    session: Mutex<Session>,
    num_outputs: usize,
}

impl OnnxNetwork {
    /// Load a stage model from the given path.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, InferenceError> {
        if !model_path.exists() {
            return Err(InferenceError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded cascade model"
        );

        if num_outputs < 2 {
            return Err(InferenceError::Failed(format!(
                "cascade model requires probability and regression outputs, got {num_outputs}"
            )));
        }

        let name = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());

        Ok(Self {
            name,
            session: Mutex::new(session),
            num_outputs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Network for OnnxNetwork {
    fn predict(&self, input: ArrayView4<'_, f32>) -> Result<NetOutput, InferenceError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| InferenceError::Failed(format!("{}: session lock poisoned", self.name)))?;

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input)?])?;

        let mut tensors = Vec::with_capacity(self.num_outputs);
        for idx in 0..self.num_outputs {
            let (shape, data) = outputs[idx].try_extract_tensor::<f32>().map_err(|e| {
                InferenceError::Failed(format!("{} output {idx}: {e}", self.name))
            })?;
            let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            tensors.push(to_nchw(&self.name, &dims, data)?);
        }

        let channels: Vec<usize> = tensors.iter().map(|t| t.dim().1).collect();
        let (prob_idx, reg_idx, lm_idx) = discover_output_indices(&channels);
        tracing::trace!(net = %self.name, ?channels, prob_idx, reg_idx, ?lm_idx, "mapped outputs");

        let mut slots: Vec<Option<Array4<f32>>> = tensors.into_iter().map(Some).collect();
        let mut take = |idx: usize| {
            slots[idx].take().ok_or_else(|| {
                InferenceError::Failed(format!("{}: output {idx} mapped twice", self.name))
            })
        };

        let probabilities = take(prob_idx)?;
        let regressions = take(reg_idx)?;
        let landmarks = lm_idx.map(&mut take).transpose()?;

        Ok(NetOutput {
            probabilities,
            regressions,
            landmarks,
        })
    }
}

/// Reshape a raw output to `(N, C, H, W)`; `(N, C)` outputs get `H = W = 1`.
fn to_nchw(net: &str, dims: &[usize], data: &[f32]) -> Result<Array4<f32>, InferenceError> {
    let shape = match *dims {
        [n, c, h, w] => (n, c, h, w),
        [n, c] => (n, c, 1, 1),
        _ => {
            return Err(InferenceError::Failed(format!(
                "{net}: unsupported output rank {} ({dims:?})",
                dims.len()
            )))
        }
    };
    Array4::from_shape_vec(shape, data.to_vec())
        .map_err(|e| InferenceError::Failed(format!("{net}: output shape {dims:?}: {e}")))
}

/// Discover output ordering by channel count.
///
/// Exported MTCNN stages name their outputs inconsistently ("prob1",
/// "conv4-2", numeric ids, ...), but the channel counts are fixed: 2 for the
/// softmax, 4 for regression, 10 for landmarks. When the counts are not
/// recognized, fall back to positional order [probabilities, regressions,
/// landmarks].
fn discover_output_indices(channels: &[usize]) -> OutputIndices {
    let find = |c: usize| channels.iter().position(|&n| n == c);

    match (find(PROBABILITY_CHANNELS), find(REGRESSION_CHANNELS)) {
        (Some(prob), Some(reg)) => (prob, reg, find(LANDMARK_CHANNELS)),
        _ => {
            tracing::debug!(?channels, "output channels not recognized, using positional mapping");
            (0, 1, (channels.len() > 2).then_some(2))
        }
    }
}
