use faceprint_core::localizer::DEFAULT_DETECTION_THRESHOLD;
use faceprint_core::pipeline::{DEFAULT_MAX_BATCH_SIZE, DEFAULT_MIN_IMAGE_SIZE};
use faceprint_core::{BatchPolicy, LocalizationPolicy, PipelineConfig};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Socket address to serve HTTP on (default: 0.0.0.0:8000).
    pub listen_addr: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SCRFD model file name, relative to `model_dir`.
    pub detector_model: String,
    /// ArcFace model file name, relative to `model_dir`.
    pub recognizer_model: String,
    pub localization: LocalizationPolicy,
    pub min_image_size: u32,
    pub batch_policy: BatchPolicy,
    pub max_batch_size: usize,
    /// Deadline for one embedding request.
    pub request_timeout: Duration,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
}

impl Config {
    /// Load configuration from `FACEPRINT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = &lookup as &dyn Fn(&str) -> Option<String>;

        let threshold = parsed(lookup, "FACEPRINT_DETECTION_THRESHOLD").unwrap_or(DEFAULT_DETECTION_THRESHOLD);
        let localization = match lookup("FACEPRINT_LOCALIZATION") {
            Some(name) => LocalizationPolicy::from_name(&name, threshold).unwrap_or_else(|| {
                tracing::warn!(value = %name, "unknown FACEPRINT_LOCALIZATION, using fallback");
                LocalizationPolicy::UseDetectionWithFallback { threshold }
            }),
            None => LocalizationPolicy::UseDetectionWithFallback { threshold },
        };
        let batch_policy = match lookup("FACEPRINT_BATCH_POLICY") {
            Some(name) => BatchPolicy::from_name(&name).unwrap_or_else(|| {
                tracing::warn!(value = %name, "unknown FACEPRINT_BATCH_POLICY, using abort");
                BatchPolicy::AbortOnFirstError
            }),
            None => BatchPolicy::AbortOnFirstError,
        };

        Self {
            listen_addr: lookup("FACEPRINT_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            model_dir: lookup("FACEPRINT_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("models")),
            detector_model: lookup("FACEPRINT_DETECTOR_MODEL").unwrap_or_else(|| "scrfd.onnx".to_string()),
            recognizer_model: lookup("FACEPRINT_RECOGNIZER_MODEL")
                .unwrap_or_else(|| "arcface.onnx".to_string()),
            localization,
            min_image_size: parsed(lookup, "FACEPRINT_MIN_IMAGE_SIZE").unwrap_or(DEFAULT_MIN_IMAGE_SIZE),
            batch_policy,
            max_batch_size: parsed(lookup, "FACEPRINT_MAX_BATCH").unwrap_or(DEFAULT_MAX_BATCH_SIZE),
            request_timeout: Duration::from_secs(parsed(lookup, "FACEPRINT_REQUEST_TIMEOUT_SECS").unwrap_or(30)),
            max_body_bytes: parsed(lookup, "FACEPRINT_MAX_BODY_BYTES").unwrap_or(DEFAULT_MAX_BODY_BYTES),
            intra_threads: parsed(lookup, "FACEPRINT_INTRA_THREADS").unwrap_or(2),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.recognizer_model)
    }

    /// Pipeline settings; the batch deadline matches the request timeout.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            localization: self.localization,
            min_image_size: self.min_image_size,
            batch_policy: self.batch_policy,
            max_batch_size: self.max_batch_size,
            timeout: Some(self.request_timeout),
        }
    }
}

fn parsed<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
