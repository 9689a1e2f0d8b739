//! File data handlers.
//!
//! The trailing file name segment of file URLs only makes links readable; the
//! file is addressed by its ID.

use crate::error::{ApiError, ApiResult};
use crate::handlers::{parse_file_id, parse_upload_id};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures::TryStreamExt;
use parcel_core::{Capability, File, NewFile, Upload};
use parcel_storage::{ByteStream, StorageError};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const ZIP_CONTENT_TYPE: &str = "application/zip";
const MAX_ARCHIVE_NAME_LEN: usize = 1024;
const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

/// Receive a file's bytes as the raw request body.
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(cap): Extension<Capability>,
    Path((upload_id, file_id, _name)): Path<(String, String, String)>,
    body: Body,
) -> ApiResult<Json<File>> {
    let upload_id = parse_upload_id(&upload_id)?;
    let file_id = parse_file_id(&file_id)?;

    let file = state
        .lifecycle
        .upload_file(&upload_id, &file_id, &cap, body_stream(body))
        .await?;
    Ok(Json(file))
}

/// Register a file named by the URL and receive its bytes in the same request.
pub async fn upload_new_file(
    State(state): State<AppState>,
    Extension(cap): Extension<Capability>,
    Path((upload_id, file_name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Json<File>> {
    let upload_id = parse_upload_id(&upload_id)?;
    let new = NewFile {
        name: file_name,
        mime_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ..Default::default()
    };

    let file = state
        .lifecycle
        .upload_new_file(&upload_id, new, &cap, body_stream(body))
        .await?;
    Ok(Json(file))
}

pub async fn download_file(
    State(state): State<AppState>,
    Extension(cap): Extension<Capability>,
    Path((upload_id, file_id, _name)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    let upload_id = parse_upload_id(&upload_id)?;
    let file_id = parse_file_id(&file_id)?;

    let download = state
        .lifecycle
        .download_file(&upload_id, &file_id, &cap)
        .await?;
    let headers = file_headers(&download.upload, &download.file);
    Ok((StatusCode::OK, headers, Body::from_stream(download.body)).into_response())
}

/// Headers of a download, without consuming one-shot files or attaching to streams.
pub async fn head_file(
    State(state): State<AppState>,
    Extension(cap): Extension<Capability>,
    Path((upload_id, file_id, _name)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    let upload_id = parse_upload_id(&upload_id)?;
    let file_id = parse_file_id(&file_id)?;

    let (upload, file) = state.lifecycle.head_file(&upload_id, &file_id, &cap).await?;
    Ok((StatusCode::OK, file_headers(&upload, &file)).into_response())
}

pub async fn remove_file(
    State(state): State<AppState>,
    Extension(cap): Extension<Capability>,
    Path((upload_id, file_id, _name)): Path<(String, String, String)>,
) -> ApiResult<Json<File>> {
    let upload_id = parse_upload_id(&upload_id)?;
    let file_id = parse_file_id(&file_id)?;
    Ok(Json(
        state.lifecycle.remove_file(&upload_id, &file_id, &cap).await?,
    ))
}

/// Every downloadable file of an upload as one zip archive.
pub async fn download_archive(
    State(state): State<AppState>,
    Extension(cap): Extension<Capability>,
    Path((upload_id, archive_name)): Path<(String, String)>,
) -> ApiResult<Response> {
    validate_archive_name(&archive_name)?;
    let upload_id = parse_upload_id(&upload_id)?;

    let archive = state.lifecycle.download_archive(&upload_id, &cap).await?;
    let mut headers = archive_headers(&archive.upload, &archive_name);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(archive.data.len() as u64));
    Ok((StatusCode::OK, headers, Body::from(archive.data)).into_response())
}

pub async fn head_archive(
    State(state): State<AppState>,
    Extension(cap): Extension<Capability>,
    Path((upload_id, archive_name)): Path<(String, String)>,
) -> ApiResult<Response> {
    validate_archive_name(&archive_name)?;
    let upload_id = parse_upload_id(&upload_id)?;

    let upload = state.lifecycle.head_archive(&upload_id, &cap).await?;
    Ok((StatusCode::OK, archive_headers(&upload, &archive_name)).into_response())
}

fn validate_archive_name(name: &str) -> ApiResult<()> {
    if name.chars().count() > MAX_ARCHIVE_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "archive name longer than {MAX_ARCHIVE_NAME_LEN} characters"
        )));
    }
    if name.len() <= ".zip".len() || !name.ends_with(".zip") {
        return Err(ApiError::BadRequest("archive name must end with .zip".to_string()));
    }
    Ok(())
}

fn archive_headers(upload: &Upload, name: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(ZIP_CONTENT_TYPE));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if upload.one_shot {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
    }
    headers
}

fn body_stream(body: Body) -> ByteStream {
    Box::pin(body.into_data_stream().map_err(StorageError::io))
}

fn file_headers(upload: &Upload, file: &File) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let content_type = file
        .mime_type
        .as_deref()
        .and_then(|m| HeaderValue::from_str(m).ok())
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    headers.insert(header::CONTENT_TYPE, content_type);

    if let Ok(value) = HeaderValue::from_str(&content_disposition(&file.name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    // Stream sizes are only known once the transfer is over.
    if !upload.stream
        && let Some(size) = file.size
    {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }

    if upload.one_shot || upload.stream {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
    }
    headers
}

/// `attachment` disposition with a header-safe file name.
fn content_disposition(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();
    format!("attachment; filename=\"{safe}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use parcel_core::{UploadId, UploadParams};

    #[test]
    fn disposition_escapes_quotes_and_non_ascii() {
        assert_eq!(
            content_disposition("a \"b\".txt"),
            "attachment; filename=\"a _b_.txt\""
        );
        assert_eq!(content_disposition("été.png"), "attachment; filename=\"_t_.png\"");
    }

    #[test]
    fn archive_names_need_zip_extension() {
        assert!(validate_archive_name("photos.zip").is_ok());
        assert!(validate_archive_name(".zip").is_err());
        assert!(validate_archive_name("photos.tar").is_err());
        assert!(validate_archive_name(&format!("{}.zip", "a".repeat(1024))).is_err());
    }

    #[test]
    fn stream_downloads_have_no_length() {
        let params = UploadParams {
            stream: true,
            ..Default::default()
        };
        let upload = Upload::new(&params, 60, parcel_core::now());
        let mut file = File::new(UploadId::new(), "a.bin", None);
        file.size = Some(10);

        let headers = file_headers(&upload, &file);
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(headers[header::CACHE_CONTROL], NO_CACHE);
        assert_eq!(headers[header::CONTENT_TYPE], DEFAULT_CONTENT_TYPE);
    }
}
