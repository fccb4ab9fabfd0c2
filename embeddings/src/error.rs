//! Error types for the embeddings system.

use std::sync::Arc;

use thiserror::Error;

/// Result type alias for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Errors that can occur in the embeddings system.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// Provider not configured.
    #[error("embedding provider not configured")]
    ProviderNotConfigured,

    /// API request failed.
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Invalid response from provider.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// No documents were supplied.
    #[error("no documents to embed")]
    EmptyInput,

    /// The generator returned a different number of outputs than it was given keys.
    #[error("generator returned {actual} outputs for {expected} inputs")]
    BatchSizeMismatch { expected: usize, actual: usize },

    /// A generation batch failed. The source is shared by every waiter of the batch.
    #[error("generating embeddings: {0}")]
    Generation(#[source] Arc<EmbeddingError>),

    /// The generator call stopped without producing a result (panic or abort).
    #[error("embedding generation was interrupted")]
    Interrupted,

    /// The cache's dispatch loop has stopped.
    #[error("embedding cache is shut down")]
    Shutdown,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EmbeddingError {
    /// Wrap an error broadcast from a failed batch for a single caller.
    ///
    /// Shutdown is reported as-is so callers can match on it directly.
    pub(crate) fn from_batch(err: Arc<EmbeddingError>) -> Self {
        if matches!(*err, EmbeddingError::Shutdown) {
            EmbeddingError::Shutdown
        } else {
            EmbeddingError::Generation(err)
        }
    }

    /// Whether this error, or the batch error it wraps, is a shutdown.
    pub fn is_shutdown(&self) -> bool {
        match self {
            EmbeddingError::Shutdown => true,
            EmbeddingError::Generation(inner) => inner.is_shutdown(),
            _ => false,
        }
    }
}
