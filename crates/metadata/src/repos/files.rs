//! File repository.

use crate::error::{MetadataError, MetadataResult};
use crate::models::Statistics;
use crate::repos::FileVisitor;
use async_trait::async_trait;
use parcel_core::{File, FileId, FileStatus, UploadId};

/// Repository for file operations.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Insert a file under an alive upload.
    ///
    /// Fails with `NotFound` if the upload is missing or soft-deleted.
    async fn create_file(&self, file: &File) -> MetadataResult<()>;

    /// Get a file by ID.
    async fn get_file(&self, id: &FileId) -> MetadataResult<Option<File>>;

    /// Files of an upload in creation order.
    async fn get_files(&self, upload_id: &UploadId) -> MetadataResult<Vec<File>>;

    /// Move a file from `expected` to `new` if and only if it is still in `expected`.
    ///
    /// Disallowed transitions fail with `InvalidStateTransition` before touching
    /// the store. A file in another status fails with `Conflict`.
    async fn update_file_status(
        &self,
        id: &FileId,
        expected: FileStatus,
        new: FileStatus,
    ) -> MetadataResult<File>;

    /// Save every mutable field of a file if it is still in `expected`.
    ///
    /// `file.status` may equal `expected` or be a permitted successor.
    async fn update_file(&self, file: &File, expected: FileStatus) -> MetadataResult<()>;

    /// Files in `status`, ordered by ID and starting strictly after `after`.
    async fn get_files_by_status(
        &self,
        status: FileStatus,
        after: Option<&FileId>,
        limit: u32,
    ) -> MetadataResult<Vec<File>>;

    /// Number of files under an upload.
    async fn count_upload_files(&self, upload_id: &UploadId) -> MetadataResult<u64>;

    /// Visit every file. An error from the visitor stops the scan and is returned.
    async fn for_each_file(&self, visit: &mut FileVisitor<'_>) -> MetadataResult<()>;

    /// Counters over alive uploads and their files.
    async fn statistics(&self) -> MetadataResult<Statistics>;
}

/// Validate a status change before it reaches the store.
pub(crate) fn check_update(expected: FileStatus, new: FileStatus) -> MetadataResult<()> {
    if expected != new {
        expected.check_transition(new)?;
    }
    Ok(())
}

/// Explain why a conditional update matched nothing.
pub(crate) async fn status_mismatch<R>(repo: &R, id: &FileId, expected: FileStatus) -> MetadataError
where
    R: FileRepo + ?Sized,
{
    match repo.get_file(id).await {
        Ok(Some(file)) => MetadataError::Conflict {
            id: id.to_string(),
            expected,
            actual: file.status,
        },
        Ok(None) => MetadataError::NotFound(format!("file {id}")),
        Err(err) => err,
    }
}
