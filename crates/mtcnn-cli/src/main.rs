use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mtcnn_core::{
    align_to_template, AlignOptions, CascadeNets, DetectorError, FaceService, Mtcnn, Pyramid,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "mtcnn", about = "MTCNN face detection, landmarks and alignment")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Commands,
}

/// Flags that take precedence over `MTCNN_*` environment variables.
#[derive(Args)]
struct Overrides {
    /// Directory containing pnet.onnx, rnet.onnx and onet.onnx
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    /// Smallest face to detect, in pixels
    #[arg(long, global = true)]
    min_face_size: Option<f32>,
    /// Pyramid scale factor, in (0, 1)
    #[arg(long, global = true)]
    scale_factor: Option<f32>,
    /// Stage thresholds, e.g. "0.6,0.7,0.7"
    #[arg(long, global = true, value_parser = config::parse_thresholds)]
    thresholds: Option<[f32; 3]>,
    /// ONNX Runtime intra-op threads per network
    #[arg(long, global = true)]
    intra_threads: Option<usize>,
    /// Give up on an image after this many seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(dir) = self.model_dir {
            config.model_dir = dir;
        }
        if let Some(v) = self.min_face_size {
            config.min_face_size = v;
        }
        if let Some(v) = self.scale_factor {
            config.scale_factor = v;
        }
        if let Some(v) = self.thresholds {
            config.thresholds = v;
        }
        if let Some(v) = self.intra_threads {
            config.intra_threads = v;
        }
        if let Some(v) = self.timeout_secs {
            config.timeout_secs = v;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces and print them as JSON, one array per image
    Detect {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Pretty-print the JSON
        #[arg(long)]
        pretty: bool,
    },
    /// Detect faces and write one PNG crop per face
    Align {
        image: PathBuf,
        /// Pixels added around each box on every side
        #[arg(long, default_value_t = 44)]
        margin: u32,
        /// Side of the square output crops
        #[arg(long, default_value_t = 160)]
        size: u32,
        /// Center crops on the landmark centroid instead of the box center
        #[arg(long)]
        center: bool,
        /// Warp onto the five-point landmark template instead of cropping
        #[arg(long, conflicts_with = "center")]
        template: bool,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Print the pyramid scales used for an image
    Scales { image: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    cli.overrides.apply(&mut config);

    match cli.command {
        Commands::Detect { images, pretty } => {
            let service = load_service(&config)?;
            for path in images {
                let faces = {
                    let service = Arc::clone(&service);
                    run_blocking(config.timeout_secs, move || service.face_detection(path)).await?
                };
                let json = if pretty {
                    serde_json::to_string_pretty(&faces)?
                } else {
                    serde_json::to_string(&faces)?
                };
                println!("{json}");
            }
        }
        Commands::Align {
            image,
            margin,
            size,
            center,
            template,
            out_dir,
        } => {
            let service = load_service(&config)?;
            let faces = {
                let (service, image) = (Arc::clone(&service), image.clone());
                run_blocking(config.timeout_secs, move || service.face_detection(image)).await?
            };
            let Some(source) = service.last_image().filter(|_| !faces.is_empty()) else {
                tracing::info!(image = %image.display(), "no faces found");
                return Ok(());
            };

            let crops = if template {
                faces
                    .iter()
                    .map(|face| align_to_template(&source, face, size))
                    .collect()
            } else {
                let options = AlignOptions {
                    margin,
                    output_size: size,
                    center_on_landmarks: center,
                };
                service.face_alignment(None, &faces, &options)?
            };

            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("creating {}", out_dir.display()))?;
            let stem = file_stem(&image);
            for (i, crop) in crops.iter().enumerate() {
                let out = out_dir.join(format!("{stem}_face{i}.png"));
                crop.save(&out)
                    .with_context(|| format!("writing {}", out.display()))?;
                println!("{}", out.display());
            }
            tracing::info!(faces = crops.len(), out_dir = %out_dir.display(), "crops written");
        }
        Commands::Scales { image } => {
            config.cascade().validate()?;
            let (width, height) = image::image_dimensions(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            println!("{width}x{height}");
            for level in Pyramid::new(width, height, config.min_face_size, config.scale_factor) {
                println!("{:.6}\t{}x{}", level.scale, level.width, level.height);
            }
        }
    }

    Ok(())
}

/// Load the three networks and wrap them in a service. Fails fast if any
/// model is missing.
fn load_service(config: &Config) -> Result<Arc<FaceService>> {
    let nets = CascadeNets::load(&config.model_dir, config.intra_threads)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    let detector = Mtcnn::new(nets, config.cascade())?;
    Ok(Arc::new(FaceService::new(detector)))
}

/// Run a detection off the async runtime, bounded by `timeout_secs`.
async fn run_blocking<T, F>(timeout_secs: u64, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T, DetectorError> + Send + 'static,
    T: Send + 'static,
{
    let value = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        tokio::task::spawn_blocking(f),
    )
    .await
    .map_err(|_| anyhow::anyhow!("detection timed out after {timeout_secs}s"))???;
    Ok(value)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_align_defaults() {
        let cli = Cli::try_parse_from(["mtcnn", "align", "photo.jpg"]).unwrap();
        match cli.command {
            Commands::Align { margin, size, center, template, .. } => {
                assert_eq!((margin, size), (44, 160));
                assert!(!center && !template);
            }
            _ => panic!("expected align"),
        }
    }

    #[test]
    fn test_flags_override_environment_values() {
        let cli = Cli::try_parse_from([
            "mtcnn",
            "detect",
            "a.jpg",
            "--thresholds",
            "0.5,0.6,0.9",
            "--min-face-size",
            "40",
        ])
        .unwrap();
        let mut config = Config {
            model_dir: PathBuf::from("/env/models"),
            min_face_size: 20.0,
            scale_factor: 0.709,
            thresholds: [0.6, 0.7, 0.7],
            intra_threads: 1,
            timeout_secs: 30,
        };
        cli.overrides.apply(&mut config);
        assert_eq!(config.thresholds, [0.5, 0.6, 0.9]);
        assert_eq!(config.min_face_size, 40.0);
        assert_eq!(config.model_dir, PathBuf::from("/env/models"));
    }

    #[test]
    fn test_detect_requires_an_image() {
        assert!(Cli::try_parse_from(["mtcnn", "detect"]).is_err());
    }

    #[tokio::test]
    async fn test_run_blocking_propagates_errors() {
        let err = run_blocking(5, || -> Result<(), DetectorError> { Err(DetectorError::NoImage) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no image to align"));
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem(Path::new("/tmp/group.photo.jpg")), "group.photo");
        assert_eq!(file_stem(Path::new("/")), "image");
    }
}
