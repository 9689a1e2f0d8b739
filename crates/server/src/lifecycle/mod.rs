//! Upload and file lifecycle.
//!
//! Every status change goes through a compare-and-set on the metadata store,
//! and the data backend is only touched once a transition authorized it:
//! bytes are written after a file was claimed as `uploading`, and deleted
//! only after it reached `removed`.

mod archive;
mod digest;
mod error;

pub use digest::{BodyDigest, Meter};
pub use error::{ErrorKind, LifecycleError, LifecycleResult};

use parcel_core::config::LimitsConfig;
use parcel_core::{
    Capability, File, FileId, FileStatus, NewFile, Page, PagingQuery, Upload, UploadFilter,
    UploadId, UploadParams, UploadView,
};
use parcel_metadata::{FileRepo, MetadataError, MetadataStore, Statistics, UploadRepo};
use archive::ZipBuilder;
use bytes::Bytes;
use parcel_storage::{ByteStream, DataBackend, StorageError, StreamBackend};
use std::collections::HashSet;
use std::sync::Arc;
use time::OffsetDateTime;

/// Login recorded when a client sets a password without one.
pub const DEFAULT_LOGIN: &str = "parcel";

/// Longest accepted file name, in characters.
pub const MAX_FILE_NAME_LEN: usize = 1024;

/// Compare-and-set attempts before a removal gives up on a moving file.
const REMOVAL_ATTEMPTS: usize = 4;

/// A download ready to be served.
pub struct Download {
    pub upload: Upload,
    pub file: File,
    pub body: ByteStream,
}

/// A zip archive of an upload's downloadable files.
pub struct Archive {
    pub upload: Upload,
    /// Files in the archive, in entry order.
    pub files: Vec<File>,
    pub data: Bytes,
}

/// Owns the upload/file state machine.
pub struct Lifecycle {
    metadata: Arc<dyn MetadataStore>,
    data: Arc<dyn DataBackend>,
    stream: Arc<StreamBackend>,
    limits: LimitsConfig,
}

impl Lifecycle {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        data: Arc<dyn DataBackend>,
        stream: Arc<StreamBackend>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            metadata,
            data,
            stream,
            limits,
        }
    }

    pub fn stream(&self) -> &Arc<StreamBackend> {
        &self.stream
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Register an upload and its placeholder files.
    ///
    /// The returned view is the only one that ever carries the upload token
    /// to a caller who did not present it.
    #[tracing::instrument(skip_all)]
    pub async fn create_upload(
        &self,
        mut params: UploadParams,
        files: Vec<NewFile>,
        cap: &Capability,
    ) -> LifecycleResult<UploadView> {
        self.check_policy(&params)?;
        let ttl = self.limits.resolve_ttl(params.ttl)?;
        if files.len() > self.limits.max_files_per_upload {
            return Err(LifecycleError::BadRequest(format!(
                "too many files: maximum is {}",
                self.limits.max_files_per_upload
            )));
        }
        let mut references = HashSet::new();
        for file in &files {
            validate_file_name(&file.name)?;
            if let Some(reference) = &file.reference
                && !references.insert(reference.as_str())
            {
                return Err(LifecycleError::BadRequest(format!(
                    "duplicate file reference {reference:?}"
                )));
            }
        }

        if params.password.is_some() && params.login.is_none() {
            params.login = Some(DEFAULT_LOGIN.to_string());
        }
        let mut upload = Upload::new(&params, ttl, parcel_core::now());
        if cap.admin {
            upload.user = params.user.clone();
            upload.token = params.token.clone();
        }

        let files: Vec<File> = files
            .into_iter()
            .map(|new| {
                let mut file = File::new(upload.id.clone(), new.name, new.reference);
                file.mime_type = new.mime_type;
                file.created_at = upload.created_at;
                file
            })
            .collect();

        self.metadata.create_upload(&upload, &files).await?;
        tracing::info!(
            upload_id = %upload.id,
            files = files.len(),
            ttl,
            stream = upload.stream,
            one_shot = upload.one_shot,
            "Upload created"
        );

        upload.sanitize_for_owner();
        Ok(UploadView {
            upload,
            files: files.into_iter().map(sanitized).collect(),
        })
    }

    /// Fetch an alive upload with its files.
    pub async fn get_upload(&self, id: &UploadId, cap: &Capability) -> LifecycleResult<UploadView> {
        let mut upload = self.alive_upload(id).await?;
        check_read(&upload, cap)?;
        let files = self.metadata.get_files(id).await?;

        if cap.owns(&upload) {
            upload.sanitize_for_owner();
        } else {
            upload.sanitize();
        }
        Ok(UploadView {
            upload,
            files: files.into_iter().map(sanitized).collect(),
        })
    }

    /// Register one more placeholder file on an upload.
    #[tracing::instrument(skip(self, new, cap), fields(upload_id = %upload_id))]
    pub async fn add_file(
        &self,
        upload_id: &UploadId,
        new: NewFile,
        cap: &Capability,
    ) -> LifecycleResult<File> {
        let upload = self.alive_upload(upload_id).await?;
        check_owner(&upload, cap)?;
        validate_file_name(&new.name)?;

        let count = self.metadata.count_upload_files(upload_id).await?;
        if count >= self.limits.max_files_per_upload as u64 {
            return Err(LifecycleError::BadRequest(format!(
                "too many files: maximum is {}",
                self.limits.max_files_per_upload
            )));
        }
        if let Some(reference) = &new.reference
            && self
                .metadata
                .get_files(upload_id)
                .await?
                .iter()
                .any(|f| f.reference.as_ref() == Some(reference))
        {
            return Err(LifecycleError::BadRequest(format!(
                "duplicate file reference {reference:?}"
            )));
        }

        let mut file = File::new(upload.id.clone(), new.name, new.reference);
        file.mime_type = new.mime_type;
        self.metadata.create_file(&file).await?;
        tracing::debug!(file_id = %file.id, "File registered");
        Ok(file)
    }

    /// Receive a file's bytes.
    ///
    /// Claims the file with `missing -> uploading`; a second writer fails with
    /// [`LifecycleError::AlreadyUploaded`]. Stream uploads block here until a
    /// downloader has consumed the body.
    #[tracing::instrument(
        skip(self, cap, body),
        fields(upload_id = %upload_id, file_id = %file_id)
    )]
    pub async fn upload_file(
        &self,
        upload_id: &UploadId,
        file_id: &FileId,
        cap: &Capability,
        body: ByteStream,
    ) -> LifecycleResult<File> {
        let upload = self.alive_upload(upload_id).await?;
        check_owner(&upload, cap)?;
        let file = self.file_of(&upload, file_id).await?;
        let file = self.claim(&file).await?;

        if upload.stream {
            self.pump_stream(file, body).await
        } else {
            self.store(file, body).await
        }
    }

    /// Register a new file and receive its bytes in one call.
    pub async fn upload_new_file(
        &self,
        upload_id: &UploadId,
        new: NewFile,
        cap: &Capability,
        body: ByteStream,
    ) -> LifecycleResult<File> {
        let file = self.add_file(upload_id, new, cap).await?;
        self.upload_file(upload_id, &file.id, cap, body).await
    }

    /// Open a file for download.
    ///
    /// One-shot files are moved to `removed` before any byte is served, so at
    /// most the readers that passed the status gate before the flip succeed.
    #[tracing::instrument(skip(self, cap), fields(upload_id = %upload_id, file_id = %file_id))]
    pub async fn download_file(
        &self,
        upload_id: &UploadId,
        file_id: &FileId,
        cap: &Capability,
    ) -> LifecycleResult<Download> {
        let (upload, file) = self.readable_file(upload_id, file_id, cap).await?;

        if upload.stream {
            let body = match self
                .stream
                .get(upload_id.as_str(), file_id.as_str(), &None)
                .await
            {
                Ok(body) => body,
                // Claimed but the uploader is not parked yet, or another
                // downloader already took the stream.
                Err(StorageError::NotFound(_)) => {
                    return Err(LifecycleError::Unavailable(file.status));
                }
                Err(err) => return Err(err.into()),
            };
            tracing::info!("Stream download attached");
            return Ok(Download {
                upload: public_view(upload, cap),
                file: sanitized(file),
                body,
            });
        }

        let file = if upload.one_shot {
            match self
                .metadata
                .update_file_status(&file.id, FileStatus::Uploaded, FileStatus::Removed)
                .await
            {
                Ok(file) => {
                    tracing::info!("One-shot file consumed");
                    file
                }
                Err(MetadataError::Conflict { actual, .. }) => {
                    return Err(LifecycleError::Conflict(format!(
                        "one-shot file {file_id} was consumed concurrently ({actual})"
                    )));
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            file
        };

        let body = self
            .data
            .get(upload_id.as_str(), file_id.as_str(), &file.backend_details)
            .await?;
        Ok(Download {
            upload: public_view(upload, cap),
            file: sanitized(file),
            body,
        })
    }

    /// Check that a file could be downloaded, without consuming it.
    pub async fn head_file(
        &self,
        upload_id: &UploadId,
        file_id: &FileId,
        cap: &Capability,
    ) -> LifecycleResult<(Upload, File)> {
        let (upload, file) = self.readable_file(upload_id, file_id, cap).await?;
        Ok((public_view(upload, cap), sanitized(file)))
    }

    /// Zip every `uploaded` file of an upload.
    ///
    /// One-shot files are moved to `removed` before the archive is built; a
    /// file consumed concurrently is left out instead of served twice.
    #[tracing::instrument(skip(self, cap), fields(upload_id = %upload_id))]
    pub async fn download_archive(
        &self,
        upload_id: &UploadId,
        cap: &Capability,
    ) -> LifecycleResult<Archive> {
        let upload = self.archivable_upload(upload_id, cap).await?;
        let candidates: Vec<File> = self
            .metadata
            .get_files(upload_id)
            .await?
            .into_iter()
            .filter(|f| f.status == FileStatus::Uploaded)
            .collect();

        if let Some(limit) = self.limits.max_archive_size() {
            let total: u64 = candidates.iter().filter_map(|f| f.size).sum();
            if total > limit {
                return Err(LifecycleError::TooLarge { limit });
            }
        }

        let mut files = Vec::with_capacity(candidates.len());
        for file in candidates {
            if !upload.one_shot {
                files.push(file);
                continue;
            }
            match self
                .metadata
                .update_file_status(&file.id, FileStatus::Uploaded, FileStatus::Removed)
                .await
            {
                Ok(consumed) => files.push(consumed),
                Err(MetadataError::Conflict { actual, .. }) => {
                    tracing::debug!(file_id = %file.id, status = %actual, "Skipping consumed file");
                }
                Err(err) => return Err(err.into()),
            }
        }
        if files.is_empty() {
            return Err(LifecycleError::BadRequest("nothing to archive".to_string()));
        }

        let mut zip = ZipBuilder::new();
        for file in &files {
            let body = self
                .data
                .get(upload_id.as_str(), file.id.as_str(), &file.backend_details)
                .await?;
            zip.add(&file.name, file.id.as_str(), body).await?;
        }
        let data = zip.finish()?;
        tracing::info!(files = files.len(), size = data.len(), "Archive built");

        Ok(Archive {
            upload: public_view(upload, cap),
            files: files.into_iter().map(sanitized).collect(),
            data,
        })
    }

    /// Check that an archive could be built, without consuming one-shot files.
    pub async fn head_archive(
        &self,
        upload_id: &UploadId,
        cap: &Capability,
    ) -> LifecycleResult<Upload> {
        let upload = self.archivable_upload(upload_id, cap).await?;
        Ok(public_view(upload, cap))
    }

    /// Remove one file. Bytes are reclaimed later by the cleaning routine.
    #[tracing::instrument(skip(self, cap), fields(upload_id = %upload_id, file_id = %file_id))]
    pub async fn remove_file(
        &self,
        upload_id: &UploadId,
        file_id: &FileId,
        cap: &Capability,
    ) -> LifecycleResult<File> {
        let upload = self.alive_upload(upload_id).await?;
        check_removal(&upload, cap)?;
        let file = self.file_of(&upload, file_id).await?;
        let file = retire_file(self.metadata.as_ref(), Some(&self.stream), file).await?;
        Ok(sanitized(file))
    }

    /// Remove an upload: retire every file, then soft delete the upload.
    #[tracing::instrument(skip(self, cap), fields(upload_id = %upload_id))]
    pub async fn remove_upload(
        &self,
        upload_id: &UploadId,
        cap: &Capability,
    ) -> LifecycleResult<()> {
        let upload = self.alive_upload(upload_id).await?;
        check_removal(&upload, cap)?;
        retire_upload(
            self.metadata.as_ref(),
            Some(&self.stream),
            &upload,
            parcel_core::now(),
        )
        .await?;
        tracing::info!("Upload removed");
        Ok(())
    }

    /// Set a new TTL, counted from the upload's creation.
    #[tracing::instrument(skip(self, cap), fields(upload_id = %upload_id))]
    pub async fn extend_ttl(
        &self,
        upload_id: &UploadId,
        ttl: i64,
        cap: &Capability,
    ) -> LifecycleResult<Upload> {
        let mut upload = self.alive_upload(upload_id).await?;
        check_owner(&upload, cap)?;

        let ttl = self.limits.resolve_ttl(Some(ttl))?;
        let expire_at = upload.expiration_for(ttl);
        if !self
            .metadata
            .set_upload_expiration(upload_id, ttl, expire_at)
            .await?
        {
            return Err(LifecycleError::NotFound(format!("upload {upload_id}")));
        }
        tracing::info!(ttl, "Upload TTL changed");

        upload.ttl = ttl;
        upload.expire_at = expire_at;
        upload.sanitize_for_owner();
        Ok(upload)
    }

    /// Admin listing of uploads.
    pub async fn list_uploads(
        &self,
        filter: &UploadFilter,
        paging: &PagingQuery,
        cap: &Capability,
    ) -> LifecycleResult<Page<Upload>> {
        check_admin(cap)?;
        let page = self.metadata.list_uploads(filter, paging).await?;
        Ok(page.map(|mut upload| {
            upload.upload_token = None;
            upload.password_hash = None;
            upload
        }))
    }

    /// Admin counters over alive uploads.
    pub async fn statistics(&self, cap: &Capability) -> LifecycleResult<Statistics> {
        check_admin(cap)?;
        Ok(self.metadata.statistics().await?)
    }

    fn check_policy(&self, params: &UploadParams) -> LifecycleResult<()> {
        let disabled = |feature: &str| -> LifecycleResult<()> {
            Err(LifecycleError::BadRequest(format!(
                "{feature} uploads are disabled on this server"
            )))
        };
        if params.one_shot && !self.limits.one_shot_enabled {
            return disabled("one-shot");
        }
        if params.removable && !self.limits.removable_enabled {
            return disabled("removable");
        }
        if params.stream && !self.limits.stream_enabled {
            return disabled("stream");
        }
        if params.password.is_some() && !self.limits.password_enabled {
            return disabled("password-protected");
        }
        if params.login.is_some() && params.password.is_none() {
            return Err(LifecycleError::BadRequest(
                "login requires a password".to_string(),
            ));
        }
        Ok(())
    }

    /// An upload that exists, is not soft-deleted and has not expired.
    async fn alive_upload(&self, id: &UploadId) -> LifecycleResult<Upload> {
        match self.metadata.get_upload(id).await? {
            Some(upload)
                if !upload.is_deleted() && !upload.is_expired_at(parcel_core::now()) =>
            {
                Ok(upload)
            }
            _ => Err(LifecycleError::NotFound(format!("upload {id}"))),
        }
    }

    async fn archivable_upload(
        &self,
        upload_id: &UploadId,
        cap: &Capability,
    ) -> LifecycleResult<Upload> {
        let upload = self.alive_upload(upload_id).await?;
        check_read(&upload, cap)?;
        if upload.stream {
            return Err(LifecycleError::BadRequest(
                "archives are not available for stream uploads".to_string(),
            ));
        }
        Ok(upload)
    }

    async fn file_of(&self, upload: &Upload, file_id: &FileId) -> LifecycleResult<File> {
        match self.metadata.get_file(file_id).await? {
            Some(file) if file.upload_id == upload.id => Ok(file),
            _ => Err(LifecycleError::NotFound(format!("file {file_id}"))),
        }
    }

    /// Upload and file passing the read checks and the status gate.
    async fn readable_file(
        &self,
        upload_id: &UploadId,
        file_id: &FileId,
        cap: &Capability,
    ) -> LifecycleResult<(Upload, File)> {
        let upload = self.alive_upload(upload_id).await?;
        check_read(&upload, cap)?;
        let file = self.file_of(&upload, file_id).await?;

        // Streamed bytes only exist while the uploader is attached.
        let readable = if upload.stream {
            FileStatus::Uploading
        } else {
            FileStatus::Uploaded
        };
        if file.status != readable {
            return Err(LifecycleError::Unavailable(file.status));
        }
        Ok((upload, file))
    }

    async fn claim(&self, file: &File) -> LifecycleResult<File> {
        match self
            .metadata
            .update_file_status(&file.id, FileStatus::Missing, FileStatus::Uploading)
            .await
        {
            Ok(file) => Ok(file),
            Err(MetadataError::Conflict { actual, .. }) => Err(LifecycleError::AlreadyUploaded {
                id: file.id.clone(),
                status: actual,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn store(&self, file: File, body: ByteStream) -> LifecycleResult<File> {
        let limit = self.limits.max_file_size();
        let meter = Meter::new(limit);
        let result = self
            .data
            .put(file.upload_id.as_str(), file.id.as_str(), meter.wrap(body))
            .await;

        match result {
            Ok(details) => {
                let digest = meter.finish();
                let mut done = file;
                done.status = FileStatus::Uploaded;
                done.size = Some(digest.size);
                done.md5 = Some(digest.md5);
                done.backend_details = details;
                if let Err(err) = self.metadata.update_file(&done, FileStatus::Uploading).await {
                    // Retired while the bytes were in flight: nothing tracks them anymore.
                    self.discard(&done).await;
                    if !matches!(err, MetadataError::Conflict { .. } | MetadataError::NotFound(_)) {
                        self.release(&done, FileStatus::Removed).await;
                    }
                    return Err(err.into());
                }
                tracing::info!(
                    size = digest.size,
                    backend = self.data.backend_name(),
                    "File uploaded"
                );
                Ok(sanitized(done))
            }
            Err(err) => {
                // Whatever reached the backend is reclaimed by the cleaning routine.
                self.release(&file, FileStatus::Removed).await;
                Err(upload_error(err, limit))
            }
        }
    }

    async fn pump_stream(&self, file: File, body: ByteStream) -> LifecycleResult<File> {
        let limit = self.limits.max_file_size();
        let meter = Meter::new(limit);
        let result = self
            .stream
            .put(file.upload_id.as_str(), file.id.as_str(), meter.wrap(body))
            .await;

        match result {
            Ok(_) => {
                let digest = meter.finish();
                let mut done = file;
                done.status = FileStatus::Deleted;
                done.size = Some(digest.size);
                done.md5 = Some(digest.md5);
                self.metadata.update_file(&done, FileStatus::Uploading).await?;
                tracing::info!(size = digest.size, "Stream transfer complete");
                Ok(sanitized(done))
            }
            Err(err) => {
                self.release(&file, FileStatus::Deleted).await;
                Err(upload_error(err, limit))
            }
        }
    }

    /// Delete bytes written for a file whose record no longer accepts them.
    async fn discard(&self, file: &File) {
        match self
            .data
            .delete(file.upload_id.as_str(), file.id.as_str(), &file.backend_details)
            .await
        {
            Ok(()) | Err(StorageError::NotFound(_)) => {
                tracing::info!(file_id = %file.id, "Discarded data of a retired file");
            }
            Err(err) => {
                tracing::warn!(
                    file_id = %file.id,
                    backend = self.data.backend_name(),
                    error = %err,
                    "Failed to discard data of a retired file"
                );
            }
        }
    }

    /// Move a file out of `uploading` after a failed transfer.
    async fn release(&self, file: &File, target: FileStatus) {
        if let Err(err) = self
            .metadata
            .update_file_status(&file.id, FileStatus::Uploading, target)
            .await
        {
            tracing::warn!(
                file_id = %file.id,
                status = %target,
                error = %err,
                "Failed to release file after failed upload, expiry will retire it"
            );
        }
    }
}

/// Move one file toward `deleted` as far as removal allows.
///
/// Missing files go straight to `deleted`; stored or in-flight files go to
/// `removed` so the cleaning routine deletes their bytes. A file that moves
/// concurrently is re-read and retried.
pub(crate) async fn retire_file(
    metadata: &dyn MetadataStore,
    stream: Option<&StreamBackend>,
    mut file: File,
) -> LifecycleResult<File> {
    for _ in 0..REMOVAL_ATTEMPTS {
        let Some(target) = file.status.removal_target() else {
            return Ok(file);
        };
        match metadata
            .update_file_status(&file.id, file.status, target)
            .await
        {
            Ok(updated) => {
                // Unblock an uploader still parked on the stream rendezvous.
                if let Some(stream) = stream
                    && file.status == FileStatus::Uploading
                {
                    stream
                        .delete(file.upload_id.as_str(), file.id.as_str(), &None)
                        .await?;
                }
                tracing::debug!(
                    file_id = %file.id,
                    from = %file.status,
                    to = %target,
                    "File retired"
                );
                return Ok(updated);
            }
            Err(MetadataError::Conflict { actual, .. }) => file.status = actual,
            Err(err) => return Err(err.into()),
        }
    }
    Err(LifecycleError::Conflict(format!(
        "file {} kept changing status during removal",
        file.id
    )))
}

/// Retire every file of an upload, then soft delete it.
///
/// Returns the number of files that could not be retired; the upload stays
/// alive in that case so the next attempt resumes.
pub(crate) async fn retire_upload(
    metadata: &dyn MetadataStore,
    stream: Option<&StreamBackend>,
    upload: &Upload,
    now: OffsetDateTime,
) -> LifecycleResult<usize> {
    let mut failures = 0;
    for file in metadata.get_files(&upload.id).await? {
        let file_id = file.id.clone();
        if let Err(err) = retire_file(metadata, stream, file).await {
            tracing::warn!(
                upload_id = %upload.id,
                file_id = %file_id,
                error = %err,
                "Failed to retire file"
            );
            failures += 1;
        }
    }
    if failures == 0 {
        metadata.soft_delete_upload(&upload.id, now).await?;
    }
    Ok(failures)
}

fn upload_error(err: StorageError, limit: Option<u64>) -> LifecycleError {
    match (err, limit) {
        (StorageError::LimitExceeded(_), Some(limit)) => LifecycleError::TooLarge { limit },
        (err, _) => err.into(),
    }
}

fn validate_file_name(name: &str) -> LifecycleResult<()> {
    if name.trim().is_empty() {
        return Err(LifecycleError::BadRequest("file name is empty".to_string()));
    }
    if name.chars().count() > MAX_FILE_NAME_LEN {
        return Err(LifecycleError::BadRequest(format!(
            "file name longer than {MAX_FILE_NAME_LEN} characters"
        )));
    }
    Ok(())
}

fn check_owner(upload: &Upload, cap: &Capability) -> LifecycleResult<()> {
    if cap.owns(upload) {
        Ok(())
    } else {
        Err(LifecycleError::Forbidden(format!(
            "a valid upload token is required for upload {}",
            upload.id
        )))
    }
}

fn check_removal(upload: &Upload, cap: &Capability) -> LifecycleResult<()> {
    if upload.removable {
        return Ok(());
    }
    check_owner(upload, cap)
}

fn check_read(upload: &Upload, cap: &Capability) -> LifecycleResult<()> {
    if cap.can_read(upload) {
        Ok(())
    } else {
        Err(LifecycleError::Unauthorized(format!(
            "upload {} is password protected",
            upload.id
        )))
    }
}

fn check_admin(cap: &Capability) -> LifecycleResult<()> {
    if cap.admin {
        Ok(())
    } else {
        Err(LifecycleError::Unauthorized(
            "admin token required".to_string(),
        ))
    }
}

fn public_view(mut upload: Upload, cap: &Capability) -> Upload {
    if cap.owns(&upload) {
        upload.sanitize_for_owner();
    } else {
        upload.sanitize();
    }
    upload
}

fn sanitized(mut file: File) -> File {
    file.sanitize();
    file
}
