//! Unit-length normalization and batch averaging of embedding vectors.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding has zero norm")]
    ZeroVector,
    #[error("embedding contains non-finite values")]
    NonFinite,
    #[error("no embeddings to aggregate")]
    EmptyBatch,
    #[error("embedding {index} has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
}

/// Euclidean length of `values`.
pub fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Rescale `raw` to unit length.
///
/// An all-zero vector has no direction and is rejected rather than turned
/// into NaNs.
pub fn l2_normalize(raw: &[f32]) -> Result<Vec<f32>, EmbeddingError> {
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(EmbeddingError::NonFinite);
    }
    let norm = l2_norm(raw);
    if norm == 0.0 {
        return Err(EmbeddingError::ZeroVector);
    }
    if !norm.is_finite() {
        // Squares overflowed f32; redo the sum in f64.
        let wide = raw.iter().map(|&v| f64::from(v).powi(2)).sum::<f64>().sqrt();
        return Ok(raw.iter().map(|&v| (f64::from(v) / wide) as f32).collect());
    }
    Ok(raw.iter().map(|v| v / norm).collect())
}

/// Element-wise arithmetic mean of `vectors`.
///
/// The result is not re-normalized: its length shrinks below one as the
/// inputs point in different directions. Sums run in f64 so the mean of N
/// identical vectors is that vector bit for bit.
pub fn mean_embedding(vectors: &[Vec<f32>]) -> Result<Vec<f32>, EmbeddingError> {
    let first = vectors.first().ok_or(EmbeddingError::EmptyBatch)?;
    let dim = first.len();

    let mut sums = vec![0.0f64; dim];
    for (index, vector) in vectors.iter().enumerate() {
        if vector.len() != dim {
            return Err(EmbeddingError::DimensionMismatch {
                index,
                expected: dim,
                actual: vector.len(),
            });
        }
        for (sum, &v) in sums.iter_mut().zip(vector) {
            *sum += f64::from(v);
        }
    }

    let count = vectors.len() as f64;
    Ok(sums.into_iter().map(|s| (s / count) as f32).collect())
}
