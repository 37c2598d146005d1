//! Batch face-to-embedding pipeline.
//!
//! Every payload is decoded and size-checked before any model runs. Images
//! then go through localize → normalize → extract → unit-normalize one at a
//! time in input order, and the unit embeddings are averaged.

use crate::decoder::{self, DecodeError};
use crate::detector::{DetectorError, FaceDetection};
use crate::embedding::{self, EmbeddingError};
use crate::localizer::{self, Localization, LocalizationPolicy};
use crate::normalizer;
use crate::recognizer::{EmbeddingModel, RecognizerError};
use crate::types::RasterImage;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Smallest width or height accepted.
pub const DEFAULT_MIN_IMAGE_SIZE: u32 = 10;

/// Largest number of images in one batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("image {index}: {source}")]
    Decode {
        index: usize,
        #[source]
        source: DecodeError,
    },
    #[error("image {index} is {width}x{height}, minimum is {min}x{min}")]
    ImageTooSmall {
        index: usize,
        width: u32,
        height: u32,
        min: u32,
    },
    #[error("image {index}: no face found")]
    NoFaceFound { index: usize },
    #[error("image {index}: face detection failed: {source}")]
    Detection {
        index: usize,
        #[source]
        source: DetectorError,
    },
    #[error("image {index}: embedding extraction failed: {source}")]
    Recognition {
        index: usize,
        #[source]
        source: RecognizerError,
    },
    #[error("image {index}: model returned an all-zero embedding")]
    ZeroVector { index: usize },
    #[error("batch is empty")]
    EmptyBatch,
    #[error("batch has {count} images, maximum is {max}")]
    BatchTooLarge { count: usize, max: usize },
    #[error("timed out after {processed} of {total} images")]
    Timeout { processed: usize, total: usize },
    #[error("aggregation failed: {0}")]
    Aggregation(#[source] EmbeddingError),
}

impl PipelineError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode { .. } => "decode_error",
            Self::ImageTooSmall { .. } => "image_too_small",
            Self::NoFaceFound { .. } => "no_face_found",
            Self::Detection { .. } | Self::Recognition { .. } => "model_inference_error",
            Self::ZeroVector { .. } => "zero_vector",
            Self::EmptyBatch => "empty_batch",
            Self::BatchTooLarge { .. } => "batch_too_large",
            Self::Timeout { .. } => "timeout",
            Self::Aggregation(_) => "internal_error",
        }
    }

    /// True when the submitted data is at fault rather than the service.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. }
                | Self::ImageTooSmall { .. }
                | Self::NoFaceFound { .. }
                | Self::EmptyBatch
                | Self::BatchTooLarge { .. }
        )
    }

    /// Index of the offending image, for per-image errors.
    pub fn image_index(&self) -> Option<usize> {
        match self {
            Self::Decode { index, .. }
            | Self::ImageTooSmall { index, .. }
            | Self::NoFaceFound { index }
            | Self::Detection { index, .. }
            | Self::Recognition { index, .. }
            | Self::ZeroVector { index } => Some(*index),
            _ => None,
        }
    }
}

/// What a failing image does to the rest of its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchPolicy {
    /// Any failure fails the whole batch.
    #[default]
    AbortOnFirstError,
    /// Failed images are left out and reported; the rest are aggregated.
    SkipFailed,
}

impl BatchPolicy {
    /// Parse a policy name (`abort`, `skip`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "abort" => Some(Self::AbortOnFirstError),
            "skip" => Some(Self::SkipFailed),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AbortOnFirstError => "abort",
            Self::SkipFailed => "skip",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub localization: LocalizationPolicy,
    pub min_image_size: u32,
    pub batch_policy: BatchPolicy,
    pub max_batch_size: usize,
    /// Wall-clock budget for one batch, checked before each image.
    pub timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            localization: LocalizationPolicy::default(),
            min_image_size: DEFAULT_MIN_IMAGE_SIZE,
            batch_policy: BatchPolicy::default(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            timeout: None,
        }
    }
}

/// An image left out of the aggregate under [`BatchPolicy::SkipFailed`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageFailure {
    pub index: usize,
    pub kind: &'static str,
    pub message: String,
}

/// Aggregated result of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEmbedding {
    /// Mean of the per-image unit embeddings.
    pub embedding: Vec<f32>,
    /// Number of images that went into the mean.
    pub contributing: usize,
    /// Skipped images, by index. Always empty under abort.
    pub failures: Vec<ImageFailure>,
}

/// Failures seen so far in one batch.
#[derive(Default)]
struct FailureLog {
    failures: Vec<ImageFailure>,
    first: Option<PipelineError>,
}

/// The face-to-embedding pipeline.
///
/// Holds the two shared model handles; cheap to share behind an `Arc`.
pub struct Pipeline {
    detector: Arc<dyn FaceDetection>,
    recognizer: Arc<dyn EmbeddingModel>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        detector: Arc<dyn FaceDetection>,
        recognizer: Arc<dyn EmbeddingModel>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            detector,
            recognizer,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Embed a batch of `<prefix>,<base64>` image payloads.
    pub fn embed_batch<S: AsRef<str>>(&self, payloads: &[S]) -> Result<BatchEmbedding, PipelineError> {
        self.embed_batch_by(payloads, self.own_deadline(Instant::now()))
    }

    /// Like [`Pipeline::embed_batch`], but also stop at `deadline`, which
    /// the caller fixed when the request arrived.
    pub fn embed_batch_until<S: AsRef<str>>(
        &self,
        payloads: &[S],
        deadline: Instant,
    ) -> Result<BatchEmbedding, PipelineError> {
        let own = self.own_deadline(Instant::now());
        self.embed_batch_by(payloads, Some(own.map_or(deadline, |d| d.min(deadline))))
    }

    fn embed_batch_by<S: AsRef<str>>(
        &self,
        payloads: &[S],
        deadline: Option<Instant>,
    ) -> Result<BatchEmbedding, PipelineError> {
        let started = Instant::now();
        self.check_batch_len(payloads.len())?;

        let mut log = FailureLog::default();
        let mut images = Vec::with_capacity(payloads.len());
        for (index, payload) in payloads.iter().enumerate() {
            let prepared = decoder::decode_data_uri(payload.as_ref())
                .map_err(|source| PipelineError::Decode { index, source })
                .and_then(|image| self.check_size(index, image));
            match prepared {
                Ok(image) => images.push((index, image)),
                Err(err) => self.record(&mut log, err)?,
            }
        }

        self.run(images, log, payloads.len(), started, deadline)
    }

    /// Embed a batch of already-decoded images.
    pub fn embed_images(&self, images: Vec<RasterImage>) -> Result<BatchEmbedding, PipelineError> {
        let started = Instant::now();
        self.check_batch_len(images.len())?;

        let total = images.len();
        let mut log = FailureLog::default();
        let mut checked = Vec::with_capacity(total);
        for (index, image) in images.into_iter().enumerate() {
            match self.check_size(index, image) {
                Ok(image) => checked.push((index, image)),
                Err(err) => self.record(&mut log, err)?,
            }
        }

        self.run(checked, log, total, started, self.own_deadline(started))
    }

    /// Localize the face in a single image without extracting an embedding.
    pub fn localize(&self, image: &RasterImage) -> Result<Localization, PipelineError> {
        let image = self.check_size(0, image.clone())?;
        self.locate(0, &image)
    }

    fn own_deadline(&self, from: Instant) -> Option<Instant> {
        self.config.timeout.map(|t| from + t)
    }

    fn check_batch_len(&self, count: usize) -> Result<(), PipelineError> {
        if count == 0 {
            return Err(PipelineError::EmptyBatch);
        }
        if count > self.config.max_batch_size {
            return Err(PipelineError::BatchTooLarge {
                count,
                max: self.config.max_batch_size,
            });
        }
        Ok(())
    }

    fn check_size(&self, index: usize, image: RasterImage) -> Result<RasterImage, PipelineError> {
        let min = self.config.min_image_size;
        if image.width() < min || image.height() < min {
            return Err(PipelineError::ImageTooSmall {
                index,
                width: image.width(),
                height: image.height(),
                min,
            });
        }
        Ok(image)
    }

    /// Abort on `err`, or note it and carry on, per the batch policy.
    fn record(&self, log: &mut FailureLog, err: PipelineError) -> Result<(), PipelineError> {
        match self.config.batch_policy {
            BatchPolicy::AbortOnFirstError => Err(err),
            BatchPolicy::SkipFailed => {
                tracing::warn!(index = ?err.image_index(), error = %err, "skipping image");
                log.failures.push(ImageFailure {
                    index: err.image_index().unwrap_or_default(),
                    kind: err.kind(),
                    message: err.to_string(),
                });
                log.first.get_or_insert(err);
                Ok(())
            }
        }
    }

    fn run(
        &self,
        images: Vec<(usize, RasterImage)>,
        mut log: FailureLog,
        total: usize,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<BatchEmbedding, PipelineError> {
        let mut units = Vec::with_capacity(images.len());
        for (processed, (index, image)) in images.into_iter().enumerate() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::warn!(processed, total, "batch deadline exceeded");
                return Err(PipelineError::Timeout { processed, total });
            }
            match self.embed_one(index, &image) {
                Ok(unit) => units.push(unit),
                Err(err) => self.record(&mut log, err)?,
            }
        }

        if units.is_empty() {
            return Err(log.first.unwrap_or(PipelineError::EmptyBatch));
        }

        let embedding = embedding::mean_embedding(&units).map_err(PipelineError::Aggregation)?;
        log.failures.sort_by_key(|f| f.index);

        tracing::debug!(
            contributing = units.len(),
            skipped = log.failures.len(),
            dim = embedding.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch aggregated"
        );

        Ok(BatchEmbedding {
            embedding,
            contributing: units.len(),
            failures: log.failures,
        })
    }

    fn locate(&self, index: usize, image: &RasterImage) -> Result<Localization, PipelineError> {
        let policy = self.config.localization;
        let detections = if policy.uses_detector() {
            self.detector
                .detect(image)
                .map_err(|source| PipelineError::Detection { index, source })?
        } else {
            Vec::new()
        };

        localizer::choose_region(policy, &detections, image.width(), image.height())
            .ok_or(PipelineError::NoFaceFound { index })
    }

    fn embed_one(&self, index: usize, image: &RasterImage) -> Result<Vec<f32>, PipelineError> {
        let localization = self.locate(index, image)?;
        let face = image.crop(&localization.region);
        let input = normalizer::normalize_face(&face);

        let raw = self
            .recognizer
            .embed(&input)
            .map_err(|source| PipelineError::Recognition { index, source })?;

        if let Some(expected) = self.recognizer.dimension() {
            if raw.len() != expected {
                return Err(PipelineError::Recognition {
                    index,
                    source: RecognizerError::InferenceFailed(format!(
                        "expected {expected}-dim embedding, got {}",
                        raw.len()
                    )),
                });
            }
        }

        let unit = embedding::l2_normalize(&raw).map_err(|err| match err {
            EmbeddingError::ZeroVector => PipelineError::ZeroVector { index },
            other => PipelineError::Recognition {
                index,
                source: RecognizerError::InferenceFailed(other.to_string()),
            },
        })?;

        tracing::debug!(
            index,
            width = image.width(),
            height = image.height(),
            region = ?localization.region,
            source = ?localization.source,
            "embedded image"
        );
        Ok(unit)
    }
}
