//! Background cleaning routine.
//!
//! A cycle runs three passes, each resumable and safe to run concurrently with
//! other servers sharing the metadata store:
//!
//! 1. expire: alive uploads past their expiration are retired and soft deleted
//! 2. reclaim: bytes of `removed` files are deleted, then the files move to `deleted`
//! 3. purge: soft-deleted uploads whose files are all `deleted` are hard deleted
//!
//! A failure on one entity is logged and counted, and the entity is retried on
//! the next cycle.

use crate::lifecycle::{retire_file, retire_upload};
use parcel_core::config::CleaningConfig;
use parcel_core::{FileId, FileStatus, UploadId};
use parcel_metadata::{
    FileRepo, MetadataError, MetadataResult, MetadataStore, PurgeOutcome, UploadRepo,
};
use parcel_storage::{DataBackend, StorageError, StreamBackend};
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassStats {
    pub items_processed: u64,
    pub items_deleted: u64,
    pub errors: u64,
}

/// Counters for one full cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleaningReport {
    pub expire: PassStats,
    pub reclaim: PassStats,
    pub purge: PassStats,
}

impl CleaningReport {
    pub fn errors(&self) -> u64 {
        self.expire.errors + self.reclaim.errors + self.purge.errors
    }
}

pub struct CleaningEngine {
    metadata: Arc<dyn MetadataStore>,
    data: Arc<dyn DataBackend>,
    stream: Option<Arc<StreamBackend>>,
    config: CleaningConfig,
    cycle: tokio::sync::Mutex<()>,
}

impl CleaningEngine {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        data: Arc<dyn DataBackend>,
        config: CleaningConfig,
    ) -> Self {
        Self {
            metadata,
            data,
            stream: None,
            config,
            cycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Also release uploaders parked on the stream backend when their upload expires.
    pub fn with_stream(mut self, stream: Arc<StreamBackend>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn config(&self) -> &CleaningConfig {
        &self.config
    }

    /// Run the three passes once.
    ///
    /// Cycles started concurrently on the same engine run one after the other.
    pub async fn run_cycle(&self) -> CleaningReport {
        let _running = self.cycle.lock().await;
        let started = std::time::Instant::now();
        let now = parcel_core::now();

        let report = CleaningReport {
            expire: self.guarded("expire", self.expire_pass(now)).await,
            reclaim: self.guarded("reclaim", self.reclaim_pass()).await,
            purge: self.guarded("purge", self.purge_pass()).await,
        };

        tracing::info!(
            expired = report.expire.items_deleted,
            reclaimed = report.reclaim.items_deleted,
            purged = report.purge.items_deleted,
            errors = report.errors(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cleaning cycle finished"
        );
        report
    }

    /// Run cycles forever, sleeping a randomized delay before each.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                min_interval_secs = self.config.min_interval_secs,
                random_delay_secs = self.config.random_delay_secs,
                "Cleaning routine started"
            );
            loop {
                tokio::time::sleep(self.config.next_delay()).await;
                self.run_cycle().await;
            }
        })
    }

    async fn guarded(
        &self,
        pass: &'static str,
        run: impl Future<Output = MetadataResult<PassStats>>,
    ) -> PassStats {
        match run.await {
            Ok(stats) => {
                if stats.errors > 0 {
                    tracing::warn!(
                        pass,
                        errors = stats.errors,
                        "Cleaning pass completed with errors"
                    );
                }
                stats
            }
            Err(err) => {
                tracing::error!(pass, error = %err, "Cleaning pass aborted");
                PassStats {
                    errors: 1,
                    ..Default::default()
                }
            }
        }
    }

    /// Retire uploads whose expiration is at or before `now`.
    pub async fn expire_pass(&self, now: OffsetDateTime) -> MetadataResult<PassStats> {
        let mut stats = PassStats::default();
        let mut after: Option<UploadId> = None;

        for iteration in 1.. {
            if iteration > self.config.max_iterations {
                self.iterations_exhausted("expire");
                break;
            }
            let batch = self
                .metadata
                .get_expired_uploads(now, after.as_ref(), self.config.batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some(last.id.clone());

            for upload in batch {
                stats.items_processed += 1;
                let retired =
                    retire_upload(self.metadata.as_ref(), self.stream.as_deref(), &upload, now)
                        .await;
                match retired {
                    Ok(0) => {
                        stats.items_deleted += 1;
                        tracing::debug!(upload_id = %upload.id, "Expired upload retired");
                    }
                    Ok(failed) => stats.errors += failed as u64,
                    Err(err) => {
                        tracing::warn!(
                            upload_id = %upload.id,
                            error = %err,
                            "Failed to retire expired upload, will retry next cycle"
                        );
                        stats.errors += 1;
                    }
                }
            }
        }
        Ok(stats)
    }

    /// Delete the bytes of `removed` files, then mark them `deleted`.
    pub async fn reclaim_pass(&self) -> MetadataResult<PassStats> {
        let mut stats = PassStats::default();
        let mut after: Option<FileId> = None;

        for iteration in 1.. {
            if iteration > self.config.max_iterations {
                self.iterations_exhausted("reclaim");
                break;
            }
            let batch = self
                .metadata
                .get_files_by_status(FileStatus::Removed, after.as_ref(), self.config.batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some(last.id.clone());

            for file in batch {
                stats.items_processed += 1;
                match self
                    .data
                    .delete(file.upload_id.as_str(), file.id.as_str(), &file.backend_details)
                    .await
                {
                    Ok(()) | Err(StorageError::NotFound(_)) => {}
                    Err(err) if err.is_retryable() => {
                        tracing::warn!(
                            file_id = %file.id,
                            backend = self.data.backend_name(),
                            error = %err,
                            "Failed to delete file data, will retry next cycle"
                        );
                        stats.errors += 1;
                        continue;
                    }
                    Err(err) => {
                        // Stays `removed`; later cycles keep trying once the backend is fixed.
                        tracing::error!(
                            file_id = %file.id,
                            backend = self.data.backend_name(),
                            error = %err,
                            "File data cannot be deleted"
                        );
                        stats.errors += 1;
                        continue;
                    }
                }

                match self
                    .metadata
                    .update_file_status(&file.id, FileStatus::Removed, FileStatus::Deleted)
                    .await
                {
                    Ok(_) => stats.items_deleted += 1,
                    // Another server reclaimed it first.
                    Err(MetadataError::Conflict { actual: FileStatus::Deleted, .. }) => {}
                    Err(err) => {
                        tracing::warn!(
                            file_id = %file.id,
                            error = %err,
                            "Failed to mark file deleted"
                        );
                        stats.errors += 1;
                    }
                }
            }
        }
        Ok(stats)
    }

    /// Hard delete soft-deleted uploads once every file is `deleted`.
    pub async fn purge_pass(&self) -> MetadataResult<PassStats> {
        let mut stats = PassStats::default();
        let mut after: Option<UploadId> = None;

        for iteration in 1.. {
            if iteration > self.config.max_iterations {
                self.iterations_exhausted("purge");
                break;
            }
            let batch = self
                .metadata
                .get_deleted_uploads(after.as_ref(), self.config.batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some(last.id.clone());

            for upload in batch {
                stats.items_processed += 1;
                match self.metadata.purge_upload(&upload.id).await {
                    Ok(PurgeOutcome::Purged) => {
                        stats.items_deleted += 1;
                        tracing::debug!(upload_id = %upload.id, "Upload purged");
                    }
                    Ok(PurgeOutcome::NotFound) | Ok(PurgeOutcome::Alive) => {}
                    Ok(PurgeOutcome::Pending(files)) => {
                        // Files left behind by an interrupted removal.
                        for file in files {
                            let file_id = file.id.clone();
                            let retired =
                                retire_file(self.metadata.as_ref(), self.stream.as_deref(), file)
                                    .await;
                            if let Err(err) = retired {
                                tracing::warn!(
                                    upload_id = %upload.id,
                                    file_id = %file_id,
                                    error = %err,
                                    "Failed to retire file of deleted upload"
                                );
                                stats.errors += 1;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            upload_id = %upload.id,
                            error = %err,
                            "Failed to purge upload, will retry next cycle"
                        );
                        stats.errors += 1;
                    }
                }
            }
        }
        Ok(stats)
    }

    fn iterations_exhausted(&self, pass: &'static str) {
        tracing::warn!(
            pass,
            max_iterations = self.config.max_iterations,
            "Cleaning pass reached max iterations, resuming next cycle"
        );
    }
}
