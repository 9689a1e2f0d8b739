//! Health and admin handlers.

use crate::cleaning::CleaningReport;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::{Extension, Json};
use parcel_core::paging::SortOrder;
use parcel_core::{Capability, Page, PagingQuery, Upload, UploadFilter};
use parcel_metadata::Statistics;
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Liveness of the server and both stores.
///
/// Unauthenticated; returns only non-sensitive information.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state
        .metadata
        .health_check()
        .await
        .map_err(|e| ApiError::Internal(format!("metadata store unhealthy: {e}")))?;
    state
        .data
        .health_check()
        .await
        .map_err(|e| ApiError::Internal(format!("data backend unhealthy: {e}")))?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

/// Query string of the upload listing.
///
/// Kept flat: query strings do not deserialize through `#[serde(flatten)]`
/// for non-string fields.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListUploadsQuery {
    pub user: Option<String>,
    pub token: Option<String>,
    #[serde(default)]
    pub include_deleted: bool,
    pub before: Option<String>,
    pub after: Option<String>,
    pub limit: Option<usize>,
    pub order: Option<SortOrder>,
}

impl ListUploadsQuery {
    fn split(self) -> (UploadFilter, PagingQuery) {
        (
            UploadFilter {
                user: self.user,
                token: self.token,
                include_deleted: self.include_deleted,
            },
            PagingQuery {
                before: self.before,
                after: self.after,
                limit: self.limit,
                order: self.order,
            },
        )
    }
}

pub async fn list_uploads(
    State(state): State<AppState>,
    Extension(cap): Extension<Capability>,
    Query(query): Query<ListUploadsQuery>,
) -> ApiResult<Json<Page<Upload>>> {
    let (filter, paging) = query.split();
    Ok(Json(
        state.lifecycle.list_uploads(&filter, &paging, &cap).await?,
    ))
}

pub async fn get_statistics(
    State(state): State<AppState>,
    Extension(cap): Extension<Capability>,
) -> ApiResult<Json<Statistics>> {
    Ok(Json(state.lifecycle.statistics(&cap).await?))
}

/// Run one cleaning cycle now and report what it did.
pub async fn run_cleaning(
    State(state): State<AppState>,
    Extension(cap): Extension<Capability>,
) -> ApiResult<Json<CleaningReport>> {
    if !cap.admin {
        return Err(ApiError::Unauthorized("admin token required".to_string()));
    }
    tracing::info!("Cleaning cycle requested");
    Ok(Json(state.cleaner.run_cycle().await))
}
