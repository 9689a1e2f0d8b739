//! Upload repository.

use crate::error::MetadataResult;
use crate::models::PurgeOutcome;
use crate::repos::UploadVisitor;
use async_trait::async_trait;
use parcel_core::{File, Page, PagingQuery, Upload, UploadFilter, UploadId};
use time::OffsetDateTime;

/// Repository for upload operations.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Insert an upload together with its initial files, atomically.
    async fn create_upload(&self, upload: &Upload, files: &[File]) -> MetadataResult<()>;

    /// Get an upload by ID, including soft-deleted ones.
    async fn get_upload(&self, id: &UploadId) -> MetadataResult<Option<Upload>>;

    /// List uploads in creation order.
    async fn list_uploads(
        &self,
        filter: &UploadFilter,
        paging: &PagingQuery,
    ) -> MetadataResult<Page<Upload>>;

    /// Visit every upload. An error from the visitor stops the scan and is returned.
    async fn for_each_upload(&self, visit: &mut UploadVisitor<'_>) -> MetadataResult<()>;

    /// Alive uploads whose expiration is at or before `now`, ordered by ID and
    /// starting strictly after `after`.
    async fn get_expired_uploads(
        &self,
        now: OffsetDateTime,
        after: Option<&UploadId>,
        limit: u32,
    ) -> MetadataResult<Vec<Upload>>;

    /// Soft-deleted uploads, ordered by ID and starting strictly after `after`.
    async fn get_deleted_uploads(
        &self,
        after: Option<&UploadId>,
        limit: u32,
    ) -> MetadataResult<Vec<Upload>>;

    /// Mark an alive upload deleted. Returns false if it was missing or already deleted.
    async fn soft_delete_upload(&self, id: &UploadId, now: OffsetDateTime) -> MetadataResult<bool>;

    /// Replace the TTL and expiration of an alive upload.
    /// Returns false if it was missing or already deleted.
    async fn set_upload_expiration(
        &self,
        id: &UploadId,
        ttl: i64,
        expire_at: Option<OffsetDateTime>,
    ) -> MetadataResult<bool>;

    /// Hard-delete a soft-deleted upload and its files, only if every file is deleted.
    ///
    /// The check and the deletion happen in one transaction.
    async fn purge_upload(&self, id: &UploadId) -> MetadataResult<PurgeOutcome>;
}
