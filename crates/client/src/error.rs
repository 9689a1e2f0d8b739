//! Client error types.
//!
//! Errors are `Clone` because one outcome is handed to every caller waiting
//! on the same creation or upload.

use serde::Deserialize;

/// Error body returned by the server.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum ClientError {
    /// The server answered with an error status.
    #[error("API error ({status}): {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// The server broke an invariant of the upload protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("upload has not been created yet")]
    NotCreated,

    #[error("file {0} has no data to upload")]
    NoSource(String),

    #[error("{failed} of {total} files failed to upload")]
    Incomplete { failed: usize, total: usize },

    /// The task doing the work stopped before recording an outcome.
    #[error("operation interrupted")]
    Interrupted,
}

impl ClientError {
    /// Build an [`ClientError::Api`] from a status and raw response body.
    pub(crate) fn from_response(status: u16, body: &str) -> Self {
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(err) => ClientError::Api {
                status,
                code: err.code,
                message: err.message,
            },
            Err(_) => ClientError::Api {
                status,
                code: "unknown".to_string(),
                message: body.to_string(),
            },
        }
    }

    /// Server error code, when the server produced this error.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some("not_found")
    }

    /// Someone else already performed this transition.
    pub fn is_conflict(&self) -> bool {
        matches!(self.code(), Some("conflict" | "already_uploaded"))
    }

    /// Credentials are missing or do not grant access.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self.code(), Some("unauthorized" | "forbidden"))
    }

    /// The file exists but is not downloadable in its current status.
    pub fn is_unavailable(&self) -> bool {
        self.code() == Some("unavailable")
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Request(err.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err.to_string())
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
