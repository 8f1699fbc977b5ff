//! Typed errors for the places where callers need to branch on the kind.

use std::time::Duration;
use thiserror::Error;

/// Failure of a single embedding call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EmbeddingError {
    /// Rate limiting, 5xx, or a network hiccup. Worth retrying.
    #[error("transient embedding failure: {0}")]
    Transient(String),

    /// The provider refused the request (bad key, bad model, 4xx).
    #[error("embedding request rejected: {0}")]
    Rejected(String),

    /// A batch job stayed outstanding longer than allowed.
    #[error("embedding batch timed out after {0:?}")]
    Timeout(Duration),

    #[error("embedding provider returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },

    /// No provider is configured or it failed to initialize.
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),
}

impl EmbeddingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbeddingError::Transient(_) | EmbeddingError::Timeout(_))
    }
}

/// A path that cannot be read or indexed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("absolute paths are not allowed: {0}")]
    Absolute(String),

    #[error("path escapes the memory root: {0}")]
    Traversal(String),

    #[error("path is not an indexable memory file: {0}")]
    NotIndexable(String),

    #[error("invalid extra path pattern '{pattern}': {reason}")]
    BadPattern { pattern: String, reason: String },

    #[error("file not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(EmbeddingError::Transient("429".into()).is_retryable());
        assert!(EmbeddingError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!EmbeddingError::Rejected("401".into()).is_retryable());
        assert!(!EmbeddingError::CountMismatch { expected: 2, got: 1 }.is_retryable());
        assert!(!EmbeddingError::Unavailable("none".into()).is_retryable());
    }
}
