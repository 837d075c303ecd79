use mtcnn_core::CascadeConfig;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// CLI configuration, loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory containing `pnet.onnx`, `rnet.onnx` and `onet.onnx`.
    pub model_dir: PathBuf,
    /// Smallest face, in pixels, the pyramid is built for.
    pub min_face_size: f32,
    /// Pyramid shrink factor between levels.
    pub scale_factor: f32,
    /// Score thresholds for the proposal, refine and output stages.
    pub thresholds: [f32; 3],
    /// ONNX Runtime intra-op threads per network.
    pub intra_threads: usize,
    /// Timeout in seconds for one detection run.
    pub timeout_secs: u64,
}

/// An `MTCNN_*` variable that is set but cannot be parsed.
#[derive(Error, Debug, PartialEq)]
#[error("{key}={value:?}: {reason}")]
pub struct EnvError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

impl Config {
    /// Load configuration from `MTCNN_*` environment variables with defaults.
    /// Unset variables take the default; malformed ones are an error.
    pub fn from_env() -> Result<Self, EnvError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EnvError> {
        let defaults = CascadeConfig::default();

        let model_dir = lookup("MTCNN_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(mtcnn_core::default_model_dir);

        let thresholds = match lookup("MTCNN_THRESHOLDS") {
            Some(value) => parse_thresholds(&value).map_err(|reason| EnvError {
                key: "MTCNN_THRESHOLDS",
                value,
                reason,
            })?,
            None => defaults.thresholds,
        };

        Ok(Self {
            model_dir,
            min_face_size: env_parse(&lookup, "MTCNN_MIN_FACE_SIZE", defaults.min_face_size)?,
            scale_factor: env_parse(&lookup, "MTCNN_SCALE_FACTOR", defaults.scale_factor)?,
            thresholds,
            intra_threads: env_parse(&lookup, "MTCNN_INTRA_THREADS", 1)?,
            timeout_secs: env_parse(&lookup, "MTCNN_TIMEOUT_SECS", 30)?,
        })
    }

    pub fn cascade(&self) -> CascadeConfig {
        CascadeConfig {
            min_face_size: self.min_face_size,
            scale_factor: self.scale_factor,
            thresholds: self.thresholds,
            ..CascadeConfig::default()
        }
    }
}

/// Parse `"0.6,0.7,0.7"` into one threshold per stage.
pub fn parse_thresholds(value: &str) -> Result<[f32; 3], String> {
    let parts: Vec<f32> = value
        .split(',')
        .map(|p| p.trim().parse::<f32>().map_err(|e| format!("{p:?}: {e}")))
        .collect::<Result<_, _>>()?;
    <[f32; 3]>::try_from(parts)
        .map_err(|parts| format!("expected 3 thresholds, got {}", parts.len()))
}

fn env_parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, EnvError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| EnvError {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}
