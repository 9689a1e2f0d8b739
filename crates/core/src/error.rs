//! Error types for the core domain.

use crate::file::FileStatus;
use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid file status: {0}")]
    InvalidStatus(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: FileStatus, to: FileStatus },

    #[error("invalid ttl: {0}")]
    InvalidTtl(String),

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
