//! Error taxonomy shared by every pipeline stage.

use thiserror::Error;

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised by the retrieval pipeline.
///
/// Validation variants (`Configuration`, `InvalidVectorShape`,
/// `DimensionMismatch`, `InconsistentIndexData`) are raised synchronously by
/// the operation that received the bad input. Backend variants carry the
/// upstream message so callers can surface it without a stack trace.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// Bad chunking or generation parameters.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Embedding model unavailable, failed to load, or failed at inference.
    #[error("embedding backend error: {0}")]
    EmbeddingBackend(String),

    /// Index construction received an empty or ragged matrix.
    #[error("invalid vector shape: {0}")]
    InvalidVectorShape(String),

    /// Query vector length differs from the index dimensionality.
    #[error("dimension mismatch: index has {expected} dimensions, query has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Chunk and vector counts differ.
    #[error("inconsistent index data: {chunks} chunks but {vectors} vectors")]
    InconsistentIndexData { chunks: usize, vectors: usize },

    /// No index registered under the key.
    #[error("index not found for key: {0}")]
    IndexNotFound(String),

    /// Upstream generation failure, including mid-stream failures.
    #[error("generation backend error: {0}")]
    GenerationBackend(String),
}

impl PipelineError {
    /// Machine-readable code used in HTTP error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "configuration_error",
            PipelineError::EmbeddingBackend(_) => "embedding_backend_error",
            PipelineError::InvalidVectorShape(_) => "invalid_vector_shape",
            PipelineError::DimensionMismatch { .. } => "dimension_mismatch",
            PipelineError::InconsistentIndexData { .. } => "inconsistent_index_data",
            PipelineError::IndexNotFound(_) => "not_found",
            PipelineError::GenerationBackend(_) => "generation_backend_error",
        }
    }

    /// True for errors caused by the caller's input rather than a backend.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PipelineError::Configuration(_)
                | PipelineError::InvalidVectorShape(_)
                | PipelineError::DimensionMismatch { .. }
                | PipelineError::InconsistentIndexData { .. }
        )
    }
}
