//! Lifecycle error taxonomy.

use parcel_core::{FileId, FileStatus};
use parcel_metadata::MetadataError;
use parcel_storage::StorageError;
use thiserror::Error;

/// Broad failure class a caller can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Unauthorized,
    Unavailable,
    Backend,
    BadRequest,
    Internal,
}

/// Lifecycle engine errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    /// Credentials are missing or wrong (password-protected uploads, admin endpoints).
    #[error("{0}")]
    Unauthorized(String),

    /// The caller does not hold the upload's capability.
    #[error("{0}")]
    Forbidden(String),

    /// The file left `missing` before this caller could claim it.
    #[error("file {id} is already {status}")]
    AlreadyUploaded { id: FileId, status: FileStatus },

    #[error("{0}")]
    Conflict(String),

    /// The file is not in a downloadable status.
    #[error("not available: {0}")]
    Unavailable(FileStatus),

    #[error("file too large: limit is {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("data backend error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(MetadataError),

    #[error(transparent)]
    Core(#[from] parcel_core::Error),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::BadRequest(_) | Self::TooLarge { .. } | Self::Core(_) => ErrorKind::BadRequest,
            Self::Unauthorized(_) | Self::Forbidden(_) => ErrorKind::Unauthorized,
            Self::AlreadyUploaded { .. } | Self::Conflict(_) => ErrorKind::Conflict,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Storage(_) => ErrorKind::Backend,
            Self::Metadata(_) | Self::Archive(_) => ErrorKind::Internal,
        }
    }
}

impl From<MetadataError> for LifecycleError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(what) => Self::NotFound(what),
            MetadataError::Conflict { .. } | MetadataError::InvalidStateTransition { .. } => {
                Self::Conflict(err.to_string())
            }
            MetadataError::InvalidQuery(msg) => Self::BadRequest(msg),
            other => Self::Metadata(other),
        }
    }
}

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;
