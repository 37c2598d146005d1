//! faceprint-core: face-to-embedding pipeline.
//!
//! Decodes data-URI images, localizes the face with SCRFD (or a center-crop
//! fallback), extracts ArcFace embeddings via ONNX Runtime and averages the
//! unit embeddings of a batch into one identity vector.

pub mod decoder;
pub mod detector;
pub mod embedding;
pub mod localizer;
pub mod normalizer;
pub mod pipeline;
pub mod recognizer;
pub mod types;

pub use detector::{FaceDetection, FaceDetector};
pub use localizer::{Localization, LocalizationPolicy, RegionSource};
pub use normalizer::NormalizedTensor;
pub use pipeline::{BatchEmbedding, BatchPolicy, ImageFailure, Pipeline, PipelineConfig, PipelineError};
pub use recognizer::{EmbeddingModel, FaceRecognizer};
pub use types::{Detection, FaceRegion, RasterImage};
