//! Vector helpers shared by the index and the embedding backends.
//!
//! Concrete embedding backends (fastembed, tract, OpenAI, Ollama) live in the
//! `docqa` app crate; this module only holds pure functions over `f32` slices.

use crate::error::{PipelineError, Result};

/// A single embedding vector.
pub type Vector = Vec<f32>;

/// Squared Euclidean distance between two equal-length vectors.
///
/// Callers must check lengths first; extra components of the longer slice
/// are ignored.
#[inline]
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Scale a vector to unit length. Near-zero vectors are returned unchanged.
pub fn normalize_l2(mut v: Vector) -> Vector {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Return the shared dimensionality of a batch of vectors.
///
/// # Errors
///
/// [`PipelineError::InvalidVectorShape`] for an empty batch, zero-length rows
/// or rows of different lengths.
pub fn uniform_dimension(vectors: &[Vector]) -> Result<usize> {
    let first = vectors
        .first()
        .ok_or_else(|| PipelineError::InvalidVectorShape("no vectors supplied".to_string()))?;
    let dim = first.len();
    if dim == 0 {
        return Err(PipelineError::InvalidVectorShape(
            "vectors must have at least one dimension".to_string(),
        ));
    }
    if let Some((row, v)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dim) {
        return Err(PipelineError::InvalidVectorShape(format!(
            "row {} has {} dimensions, expected {}",
            row,
            v.len(),
            dim
        )));
    }
    Ok(dim)
}
