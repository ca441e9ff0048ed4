//! Error taxonomy for the engine surface.
//!
//! Four categories cover every failure a caller can observe; each maps to
//! a stable machine-readable code used by the HTTP error body. Generation
//! failures are deliberately absent: the orchestrator degrades to raw
//! context instead of surfacing them.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The caller supplied something unusable: blank fields, empty
    /// content, unknown ids, bad option values.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The embedding provider failed terminally (after retries, or with a
    /// non-retryable status).
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// The storage backend failed or returned corrupt rows.
    #[error("storage error: {0}")]
    Storage(String),

    /// The operation exceeded its configured deadline.
    #[error("operation timed out after {0}s")]
    Timeout(u64),
}

impl EngineError {
    /// Stable machine-readable code for wire surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Embedding(_) => "embedding_error",
            EngineError::Storage(_) => "storage_error",
            EngineError::Timeout(_) => "timeout",
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(EngineError::InvalidInput("x".into()).code(), "invalid_input");
        assert_eq!(EngineError::Embedding("x".into()).code(), "embedding_error");
        assert_eq!(EngineError::Storage("x".into()).code(), "storage_error");
        assert_eq!(EngineError::Timeout(30).code(), "timeout");
    }
}
