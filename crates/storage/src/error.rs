//! Storage error types.

use thiserror::Error;

/// Data backend errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("size limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("stream closed: {0}")]
    StreamClosed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Build an I/O error from any displayable cause.
    pub fn io(cause: impl std::fmt::Display) -> Self {
        Self::Io(std::io::Error::other(cause.to_string()))
    }

    /// Whether the same call may succeed later without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::StreamClosed(_) | Self::Backend(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_are_retryable() {
        assert!(StorageError::io("connection reset").is_retryable());
        assert!(StorageError::Backend("throttled".to_string()).is_retryable());
        assert!(!StorageError::InvalidKey("../x".to_string()).is_retryable());
        assert!(!StorageError::Config("no path".to_string()).is_retryable());
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
