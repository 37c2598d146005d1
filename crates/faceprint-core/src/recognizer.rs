//! ArcFace face recognizer via ONNX Runtime.
//!
//! Runs one forward pass over a [`NormalizedTensor`] and returns the first
//! output, flattened, as the raw embedding.

use crate::normalizer::{NormalizedTensor, NORMALIZED_SHAPE};
use ort::session::Session;
use ort::value::{TensorRef, ValueType};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("input tensor has shape {actual:?}, model expects {expected:?}")]
    InputShape {
        expected: [usize; 4],
        actual: Vec<usize>,
    },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that maps a normalized face tensor to a raw embedding.
///
/// Implementations are shared between requests and must not need `&mut`.
pub trait EmbeddingModel: Send + Sync {
    fn embed(&self, input: &NormalizedTensor) -> Result<Vec<f32>, RecognizerError>;

    /// Embedding length declared by the model, if it declares one.
    fn dimension(&self) -> Option<usize> {
        None
    }
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Mutex<Session>,
    dimension: Option<usize>,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let dimension = session.outputs().first().and_then(|o| declared_length(o.dtype()));

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            ?dimension,
            "loaded ArcFace model"
        );

        Ok(Self {
            session: Mutex::new(session),
            dimension,
        })
    }
}

impl EmbeddingModel for FaceRecognizer {
    fn embed(&self, input: &NormalizedTensor) -> Result<Vec<f32>, RecognizerError> {
        check_input_shape(input)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| RecognizerError::InferenceFailed("recognizer session poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        check_output_length(raw.len(), self.dimension)?;
        Ok(raw.to_vec())
    }

    fn dimension(&self) -> Option<usize> {
        self.dimension
    }
}

/// Last axis of a tensor output, when it is a fixed positive size.
fn declared_length(dtype: &ValueType) -> Option<usize> {
    match dtype {
        ValueType::Tensor { shape, .. } => shape
            .iter()
            .last()
            .and_then(|&d| usize::try_from(d).ok())
            .filter(|&d| d > 0),
        _ => None,
    }
}

fn check_input_shape(input: &NormalizedTensor) -> Result<(), RecognizerError> {
    if input.shape() != NORMALIZED_SHAPE {
        return Err(RecognizerError::InputShape {
            expected: NORMALIZED_SHAPE,
            actual: input.shape().to_vec(),
        });
    }
    Ok(())
}

fn check_output_length(len: usize, declared: Option<usize>) -> Result<(), RecognizerError> {
    if len == 0 {
        return Err(RecognizerError::InferenceFailed("model returned an empty embedding".into()));
    }
    match declared {
        Some(expected) if expected != len => Err(RecognizerError::InferenceFailed(format!(
            "expected {expected}-dim embedding, got {len}"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_input_shape_accepted() {
        let input = NormalizedTensor::zeros(NORMALIZED_SHAPE);
        assert!(check_input_shape(&input).is_ok());
    }

    #[test]
    fn test_input_shape_rejected() {
        let input = Array4::<f32>::zeros((1, 3, 64, 64));
        match check_input_shape(&input) {
            Err(RecognizerError::InputShape { expected, actual }) => {
                assert_eq!(expected, [1, 3, 112, 112]);
                assert_eq!(actual, vec![1, 3, 64, 64]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_output_length_matches_declared() {
        assert!(check_output_length(512, Some(512)).is_ok());
        assert!(check_output_length(128, None).is_ok());
    }

    #[test]
    fn test_output_length_mismatch() {
        assert!(matches!(
            check_output_length(256, Some(512)),
            Err(RecognizerError::InferenceFailed(_))
        ));
    }

    #[test]
    fn test_output_empty() {
        assert!(check_output_length(0, None).is_err());
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceRecognizer::load(Path::new("/nonexistent/arcface.onnx"), 1)
            .err()
            .unwrap();
        assert!(matches!(err, RecognizerError::ModelNotFound(_)));
    }
}
