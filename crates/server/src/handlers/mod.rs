//! HTTP request handlers.

pub mod admin;
pub mod files;
pub mod uploads;

pub use admin::*;
pub use files::*;
pub use uploads::*;

use crate::error::{ApiError, ApiResult};
use parcel_core::{FileId, UploadId};

/// Parse an upload ID from a path segment.
///
/// A malformed ID cannot name an existing upload, so it is reported as not found.
pub(crate) fn parse_upload_id(raw: &str) -> ApiResult<UploadId> {
    UploadId::parse(raw).map_err(|_| ApiError::NotFound(format!("upload {raw}")))
}

pub(crate) fn parse_file_id(raw: &str) -> ApiResult<FileId> {
    FileId::parse(raw).map_err(|_| ApiError::NotFound(format!("file {raw}")))
}
