//! Database rows and the records returned by repository queries.
//!
//! Timestamps are stored as microseconds since the epoch so that every
//! realization orders and compares them as plain integers.

use crate::error::{MetadataError, MetadataResult};
use parcel_core::timestamp::{from_micros, to_micros};
use parcel_core::{File, FileId, FileStatus, Upload, UploadId};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// =============================================================================
// Uploads
// =============================================================================

/// Upload record.
#[derive(Debug, Clone, FromRow)]
pub struct UploadRow {
    pub id: String,
    pub upload_token: Option<String>,
    pub user_id: Option<String>,
    pub token: Option<String>,
    pub comments: Option<String>,
    pub one_shot: bool,
    pub removable: bool,
    pub stream: bool,
    pub protected_by_password: bool,
    pub login: Option<String>,
    pub password_hash: Option<String>,
    pub ttl: i64,
    pub created_at: i64,
    pub expire_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

impl From<&Upload> for UploadRow {
    fn from(upload: &Upload) -> Self {
        Self {
            id: upload.id.to_string(),
            upload_token: upload.upload_token.clone(),
            user_id: upload.user.clone(),
            token: upload.token.clone(),
            comments: upload.comments.clone(),
            one_shot: upload.one_shot,
            removable: upload.removable,
            stream: upload.stream,
            protected_by_password: upload.protected_by_password,
            login: upload.login.clone(),
            password_hash: upload.password_hash.clone(),
            ttl: upload.ttl,
            created_at: to_micros(upload.created_at),
            expire_at: upload.expire_at.map(to_micros),
            deleted_at: upload.deleted_at.map(to_micros),
        }
    }
}

impl From<UploadRow> for Upload {
    fn from(row: UploadRow) -> Self {
        Self {
            id: UploadId::from_stored(row.id),
            upload_token: row.upload_token,
            user: row.user_id,
            token: row.token,
            comments: row.comments,
            one_shot: row.one_shot,
            removable: row.removable,
            stream: row.stream,
            protected_by_password: row.protected_by_password,
            login: row.login,
            password_hash: row.password_hash,
            ttl: row.ttl,
            created_at: from_micros(row.created_at),
            expire_at: row.expire_at.map(from_micros),
            deleted_at: row.deleted_at.map(from_micros),
        }
    }
}

// =============================================================================
// Files
// =============================================================================

/// File record.
#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub id: String,
    pub upload_id: String,
    pub name: String,
    pub status: String,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
    pub md5: Option<String>,
    pub reference: Option<String>,
    /// Backend details as JSON text.
    pub backend_details: Option<String>,
    pub created_at: i64,
}

impl TryFrom<&File> for FileRow {
    type Error = MetadataError;

    fn try_from(file: &File) -> MetadataResult<Self> {
        let size = file
            .size
            .map(i64::try_from)
            .transpose()
            .map_err(|_| MetadataError::Corrupt(format!("file {} size out of range", file.id)))?;
        let backend_details = file
            .backend_details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        Ok(Self {
            id: file.id.to_string(),
            upload_id: file.upload_id.to_string(),
            name: file.name.clone(),
            status: file.status.as_str().to_string(),
            mime_type: file.mime_type.clone(),
            size,
            md5: file.md5.clone(),
            reference: file.reference.clone(),
            backend_details,
            created_at: to_micros(file.created_at),
        })
    }
}

impl TryFrom<FileRow> for File {
    type Error = MetadataError;

    fn try_from(row: FileRow) -> MetadataResult<Self> {
        let status = FileStatus::parse(&row.status)?;
        let size = row
            .size
            .map(u64::try_from)
            .transpose()
            .map_err(|_| MetadataError::Corrupt(format!("file {} has a negative size", row.id)))?;
        let backend_details = row
            .backend_details
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Self {
            id: FileId::from_stored(row.id),
            upload_id: UploadId::from_stored(row.upload_id),
            name: row.name,
            status,
            mime_type: row.mime_type,
            size,
            md5: row.md5,
            reference: row.reference,
            backend_details,
            created_at: from_micros(row.created_at),
        })
    }
}

/// Convert a batch of rows, failing on the first corrupt one.
pub(crate) fn files_from_rows(rows: Vec<FileRow>) -> MetadataResult<Vec<File>> {
    rows.into_iter().map(File::try_from).collect()
}

// =============================================================================
// Results
// =============================================================================

/// Outcome of a hard purge attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PurgeOutcome {
    /// Upload and file rows are gone.
    Purged,
    /// No such upload.
    NotFound,
    /// The upload is not soft-deleted.
    Alive,
    /// Some files are not yet deleted; nothing was removed.
    Pending(Vec<File>),
}

/// Aggregate counters over alive uploads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub uploads: u64,
    pub anonymous_uploads: u64,
    pub files: u64,
    pub total_size: u64,
    pub anonymous_size: u64,
}

impl Statistics {
    /// Fold one alive upload and its files into the counters.
    pub fn add_upload(&mut self, upload: &Upload, files: &[File]) {
        let anonymous = upload.user.is_none();
        self.uploads += 1;
        if anonymous {
            self.anonymous_uploads += 1;
        }
        for file in files.iter().filter(|f| f.status != FileStatus::Deleted) {
            let size = file.size.unwrap_or(0);
            self.files += 1;
            self.total_size += size;
            if anonymous {
                self.anonymous_size += size;
            }
        }
    }
}
