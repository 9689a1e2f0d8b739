//! API error types.

use crate::lifecycle::{ErrorKind, LifecycleError};
use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// API error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("core error: {0}")]
    Core(#[from] parcel_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Internal(_) => "internal_error",
            Self::Core(_) => "bad_request",
            Self::Lifecycle(e) => match e {
                LifecycleError::Forbidden(_) => "forbidden",
                LifecycleError::AlreadyUploaded { .. } => "already_uploaded",
                LifecycleError::TooLarge { .. } => "payload_too_large",
                _ => match e.kind() {
                    ErrorKind::NotFound => "not_found",
                    ErrorKind::Conflict => "conflict",
                    ErrorKind::Unauthorized => "unauthorized",
                    ErrorKind::Unavailable => "unavailable",
                    ErrorKind::Backend => "backend_error",
                    ErrorKind::BadRequest => "bad_request",
                    ErrorKind::Internal => "internal_error",
                },
            },
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::Core(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Lifecycle(e) => match e {
                LifecycleError::Forbidden(_) => StatusCode::FORBIDDEN,
                LifecycleError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                _ => match e.kind() {
                    ErrorKind::NotFound | ErrorKind::Unavailable => StatusCode::NOT_FOUND,
                    ErrorKind::Conflict => StatusCode::CONFLICT,
                    ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
                    ErrorKind::Backend => StatusCode::BAD_GATEWAY,
                    ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
                    ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                },
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match status {
            StatusCode::INTERNAL_SERVER_ERROR | StatusCode::BAD_GATEWAY => {
                tracing::error!(error = %self, "Request failed");
            }
            _ => tracing::debug!(error = %self, "Request rejected"),
        }

        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"parcel\""),
            );
        }
        response
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
