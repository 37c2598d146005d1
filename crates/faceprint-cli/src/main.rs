use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use faceprint_core::decoder;
use faceprint_core::localizer::DEFAULT_DETECTION_THRESHOLD;
use faceprint_core::{
    BatchPolicy, FaceDetector, FaceRecognizer, LocalizationPolicy, Pipeline, PipelineConfig,
    RasterImage,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "faceprint", about = "Face identity embeddings from photographs")]
struct Cli {
    #[command(flatten)]
    models: ModelArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ModelArgs {
    /// Directory containing the ONNX models
    #[arg(long, default_value = "models", global = true)]
    model_dir: PathBuf,
    /// SCRFD detector file name inside the model directory
    #[arg(long, default_value = "scrfd.onnx", global = true)]
    detector_model: String,
    /// ArcFace recognizer file name inside the model directory
    #[arg(long, default_value = "arcface.onnx", global = true)]
    recognizer_model: String,
    /// Face localization policy: fallback, best or center
    #[arg(long, default_value = "fallback", global = true)]
    localization: String,
    /// Minimum detection confidence for the fallback policy
    #[arg(long, default_value_t = DEFAULT_DETECTION_THRESHOLD, global = true)]
    threshold: f32,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute one embedding from one or more photos of the same person
    Embed {
        /// Image files (PNG, JPEG, ...)
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// What a failing image does to the batch: abort or skip
        #[arg(long, default_value = "abort")]
        batch_policy: String,
    },
    /// Show which face region would be used for an image
    Detect {
        image: PathBuf,
    },
    /// Check that the model files are present
    Status,
}

impl ModelArgs {
    fn detector_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    fn recognizer_path(&self) -> PathBuf {
        self.model_dir.join(&self.recognizer_model)
    }

    fn pipeline(&self, batch_policy: BatchPolicy) -> Result<Pipeline> {
        let Some(localization) = LocalizationPolicy::from_name(&self.localization, self.threshold)
        else {
            bail!("unknown localization policy: {}", self.localization);
        };

        let detector = FaceDetector::load(&self.detector_path(), 2)
            .context("loading detector")?
            .with_score_threshold(localization.detector_floor());
        let recognizer =
            FaceRecognizer::load(&self.recognizer_path(), 2).context("loading recognizer")?;

        Ok(Pipeline::new(
            Arc::new(detector),
            Arc::new(recognizer),
            PipelineConfig {
                localization,
                batch_policy,
                max_batch_size: usize::MAX,
                ..PipelineConfig::default()
            },
        ))
    }
}

fn read_image(path: &Path) -> Result<RasterImage> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    decoder::decode_bytes(&bytes).with_context(|| format!("decoding {}", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Embed { images, batch_policy } => {
            let Some(policy) = BatchPolicy::from_name(&batch_policy) else {
                bail!("unknown batch policy: {batch_policy}");
            };
            let pipeline = cli.models.pipeline(policy)?;
            let rasters = images
                .iter()
                .map(PathBuf::as_path)
                .map(read_image)
                .collect::<Result<Vec<_>>>()?;

            let batch = pipeline.embed_images(rasters)?;
            let mut output = serde_json::json!({ "embedding": batch.embedding });
            if !batch.failures.is_empty() {
                output["failed"] = serde_json::to_value(&batch.failures)?;
            }
            println!("{output}");
        }
        Commands::Detect { image } => {
            let pipeline = cli.models.pipeline(BatchPolicy::AbortOnFirstError)?;
            let raster = read_image(&image)?;
            let localization = pipeline.localize(&raster)?;
            println!(
                "{}",
                serde_json::json!({
                    "image": { "width": raster.width(), "height": raster.height() },
                    "localization": localization,
                })
            );
        }
        Commands::Status => {
            for (role, path) in [
                ("detector", cli.models.detector_path()),
                ("recognizer", cli.models.recognizer_path()),
            ] {
                let state = if path.exists() { "found" } else { "missing" };
                println!("{role:<10} {state:<8} {}", path.display());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_embed_args() {
        let cli = Cli::parse_from([
            "faceprint", "embed", "a.jpg", "b.png", "--batch-policy", "skip", "--model-dir", "/m",
        ]);
        assert_eq!(cli.models.detector_path(), PathBuf::from("/m/scrfd.onnx"));
        match cli.command {
            Commands::Embed { images, batch_policy } => {
                assert_eq!(images.len(), 2);
                assert_eq!(batch_policy, "skip");
            }
            _ => panic!("expected embed"),
        }
    }

    #[test]
    fn test_embed_requires_images() {
        assert!(Cli::try_parse_from(["faceprint", "embed"]).is_err());
    }

    #[test]
    fn test_read_image_names_missing_path() {
        let paths = [PathBuf::from("/nonexistent/face.png")];
        let err = paths
            .iter()
            .map(PathBuf::as_path)
            .map(read_image)
            .collect::<Result<Vec<_>>>()
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/face.png"));
    }
}
