//! Upload handlers.

use crate::error::ApiResult;
use crate::handlers::parse_upload_id;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use parcel_core::{Capability, CreateUpload, File, NewFile, Upload, UploadView};
use serde::Deserialize;

/// Create an upload with its placeholder files.
///
/// The response is the only place the upload token is returned.
pub async fn create_upload(
    State(state): State<AppState>,
    Extension(cap): Extension<Capability>,
    Json(req): Json<CreateUpload>,
) -> ApiResult<Json<UploadView>> {
    let view = state
        .lifecycle
        .create_upload(req.params, req.files, &cap)
        .await?;
    Ok(Json(view))
}

pub async fn get_upload(
    State(state): State<AppState>,
    Extension(cap): Extension<Capability>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<UploadView>> {
    let upload_id = parse_upload_id(&upload_id)?;
    Ok(Json(state.lifecycle.get_upload(&upload_id, &cap).await?))
}

pub async fn remove_upload(
    State(state): State<AppState>,
    Extension(cap): Extension<Capability>,
    Path(upload_id): Path<String>,
) -> ApiResult<StatusCode> {
    let upload_id = parse_upload_id(&upload_id)?;
    state.lifecycle.remove_upload(&upload_id, &cap).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Request body for changing an upload's TTL.
#[derive(Debug, Deserialize)]
pub struct SetTtlRequest {
    pub ttl: i64,
}

pub async fn set_upload_ttl(
    State(state): State<AppState>,
    Extension(cap): Extension<Capability>,
    Path(upload_id): Path<String>,
    Json(req): Json<SetTtlRequest>,
) -> ApiResult<Json<Upload>> {
    let upload_id = parse_upload_id(&upload_id)?;
    let upload = state
        .lifecycle
        .extend_ttl(&upload_id, req.ttl, &cap)
        .await?;
    Ok(Json(upload))
}

/// Register one more file on an upload.
pub async fn add_file(
    State(state): State<AppState>,
    Extension(cap): Extension<Capability>,
    Path(upload_id): Path<String>,
    Json(req): Json<NewFile>,
) -> ApiResult<Json<File>> {
    let upload_id = parse_upload_id(&upload_id)?;
    Ok(Json(state.lifecycle.add_file(&upload_id, req, &cap).await?))
}
