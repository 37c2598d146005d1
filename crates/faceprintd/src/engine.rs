use faceprint_core::{BatchEmbedding, FaceDetector, FaceRecognizer, Pipeline, PipelineError};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;

/// Requests waiting for the engine thread before senders back off.
const ENGINE_QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] faceprint_core::detector::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] faceprint_core::recognizer::RecognizerError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Embed {
        images: Vec<String>,
        deadline: Instant,
        reply: oneshot::Sender<Result<BatchEmbedding, PipelineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Run the pipeline over a batch of data-URI images. The engine stops
    /// working on the batch once `deadline` passes.
    pub async fn embed(
        &self,
        images: Vec<String>,
        deadline: Instant,
    ) -> Result<BatchEmbedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Embed {
                images,
                deadline,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Load both ONNX models and start the engine.
///
/// Fails fast at startup if either model is unavailable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let detector_path = config.detector_model_path();
    let detector = FaceDetector::load(&detector_path, config.intra_threads)?
        .with_score_threshold(config.localization.detector_floor());
    tracing::info!(path = %detector_path.display(), "SCRFD detector loaded");

    let recognizer_path = config.recognizer_model_path();
    let recognizer = FaceRecognizer::load(&recognizer_path, config.intra_threads)?;
    tracing::info!(path = %recognizer_path.display(), "ArcFace recognizer loaded");

    let pipeline = Pipeline::new(
        Arc::new(detector),
        Arc::new(recognizer),
        config.pipeline_config(),
    );
    spawn_with_pipeline(pipeline)
}

/// Start the engine thread around an already-built pipeline.
pub fn spawn_with_pipeline(pipeline: Pipeline) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(ENGINE_QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("faceprint-engine".into())
        .spawn(move || {
            tracing::info!(
                localization = pipeline.config().localization.name(),
                batch_policy = pipeline.config().batch_policy.name(),
                "engine thread started"
            );
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Embed { images, deadline, reply } => {
                        if reply.is_closed() {
                            tracing::debug!(images = images.len(), "caller gone, dropping request");
                            continue;
                        }
                        let result = pipeline.embed_batch_until(&images, deadline);
                        if let Err(err) = &result {
                            tracing::debug!(kind = err.kind(), error = %err, "embed request failed");
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use faceprint_core::detector::DetectorError;
    use faceprint_core::recognizer::RecognizerError;
    use faceprint_core::{
        Detection, EmbeddingModel, FaceDetection, LocalizationPolicy, NormalizedTensor,
        PipelineConfig, RasterImage,
    };
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NoFaces;

    impl FaceDetection for NoFaces {
        fn detect(&self, _image: &RasterImage) -> Result<Vec<Detection>, DetectorError> {
            Ok(Vec::new())
        }
    }

    /// Sleeps on every forward pass and counts calls.
    struct SlowModel {
        delay: Duration,
        calls: AtomicUsize,
    }

    impl EmbeddingModel for SlowModel {
        fn embed(&self, _input: &NormalizedTensor) -> Result<Vec<f32>, RecognizerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(vec![0.6, 0.8])
        }
    }

    fn png_uri() -> String {
        let mut bytes = Vec::new();
        RgbImage::from_pixel(20, 20, Rgb([90, 90, 90]))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        format!("data:image/png;base64,{}", STANDARD.encode(&bytes))
    }

    fn engine_with(model: Arc<SlowModel>) -> EngineHandle {
        let config = PipelineConfig {
            localization: LocalizationPolicy::AlwaysCenterCrop,
            timeout: Some(Duration::from_secs(10)),
            ..PipelineConfig::default()
        };
        spawn_with_pipeline(Pipeline::new(Arc::new(NoFaces), model, config)).unwrap()
    }

    #[tokio::test]
    async fn embed_round_trip() {
        let model = Arc::new(SlowModel { delay: Duration::ZERO, calls: AtomicUsize::new(0) });
        let engine = engine_with(model.clone());

        let deadline = Instant::now() + Duration::from_secs(10);
        let batch = engine.embed(vec![png_uri(), png_uri()], deadline).await.unwrap();
        assert_eq!(batch.contributing, 2);
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abandoned_request_stops_at_caller_deadline() {
        let model = Arc::new(SlowModel { delay: Duration::from_millis(100), calls: AtomicUsize::new(0) });
        let engine = engine_with(model.clone());

        let budget = Duration::from_millis(150);
        let abandoned = tokio::time::timeout(
            budget,
            engine.embed(vec![png_uri(); 10], Instant::now() + budget),
        )
        .await;
        assert!(abandoned.is_err());

        // One request at a time, so this reply means the abandoned batch is finished.
        let deadline = Instant::now() + Duration::from_secs(10);
        engine.embed(vec![png_uri()], deadline).await.unwrap();

        let calls = model.calls.load(Ordering::SeqCst);
        assert!(calls <= 4, "abandoned batch kept running: {calls} forward passes");
    }
}
