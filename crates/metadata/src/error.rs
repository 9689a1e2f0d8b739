//! Metadata store error types.

use parcel_core::FileStatus;
use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A conditional status update lost against a concurrent writer.
    #[error("status conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: FileStatus,
        actual: FileStatus,
    },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: FileStatus, to: FileStatus },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("key-value store error: {0}")]
    Kv(#[from] redb::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<parcel_core::Error> for MetadataError {
    fn from(err: parcel_core::Error) -> Self {
        match err {
            parcel_core::Error::InvalidTransition { from, to } => {
                Self::InvalidStateTransition { from, to }
            }
            parcel_core::Error::InvalidCursor(cursor) => {
                Self::InvalidQuery(format!("invalid cursor: {cursor}"))
            }
            other => Self::Corrupt(other.to_string()),
        }
    }
}

macro_rules! redb_error {
    ($($ty:ident),* $(,)?) => {
        $(
            impl From<redb::$ty> for MetadataError {
                fn from(err: redb::$ty) -> Self {
                    Self::Kv(err.into())
                }
            }
        )*
    };
}

redb_error!(
    DatabaseError,
    TransactionError,
    TableError,
    StorageError,
    CommitError,
);

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
