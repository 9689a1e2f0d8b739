//! File records and the file status state machine.

use crate::id::{FileId, UploadId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Lifecycle status of a file.
///
/// Status only moves forward. The permitted edges are:
///
/// ```text
/// Missing ──► Uploading ──► Uploaded ──► Removed ──► Deleted
///    │            │  │                      ▲           ▲
///    │            │  └──────────────────────┘           │
///    │            └─────────────────────────────────────┤ (stream)
///    └──────────────────────────────────────────────────┘
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Registered, no bytes received yet.
    Missing,
    /// A writer owns the file and bytes are flowing.
    Uploading,
    /// Bytes are durably stored and downloadable.
    Uploaded,
    /// Pending deletion from the data backend.
    Removed,
    /// Bytes are gone. Terminal.
    Deleted,
}

impl FileStatus {
    pub const ALL: [FileStatus; 5] = [
        Self::Missing,
        Self::Uploading,
        Self::Uploaded,
        Self::Removed,
        Self::Deleted,
    ];

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Removed => "removed",
            Self::Deleted => "deleted",
        }
    }

    /// Parse from the string representation.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "missing" => Ok(Self::Missing),
            "uploading" => Ok(Self::Uploading),
            "uploaded" => Ok(Self::Uploaded),
            "removed" => Ok(Self::Removed),
            "deleted" => Ok(Self::Deleted),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }

    /// Whether a direct transition from `self` to `next` is permitted.
    ///
    /// `Uploading -> Removed` covers expiry and failed writes, `Uploading -> Deleted`
    /// covers streamed files which never reach durable storage.
    pub fn can_transition_to(&self, next: FileStatus) -> bool {
        use FileStatus::*;
        matches!(
            (self, next),
            (Missing, Uploading)
                | (Missing, Deleted)
                | (Uploading, Uploaded)
                | (Uploading, Removed)
                | (Uploading, Deleted)
                | (Uploaded, Removed)
                | (Removed, Deleted)
        )
    }

    /// Check a transition, returning a typed error when it is not permitted.
    pub fn check_transition(&self, next: FileStatus) -> crate::Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(crate::Error::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }

    /// Status a file moves to when its upload is removed or expires, if any.
    ///
    /// Never-uploaded files skip the data backend entirely.
    pub fn removal_target(&self) -> Option<FileStatus> {
        match self {
            Self::Missing => Some(Self::Deleted),
            Self::Uploading | Self::Uploaded => Some(Self::Removed),
            Self::Removed | Self::Deleted => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

/// A file belonging to exactly one upload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub id: FileId,
    pub upload_id: UploadId,
    #[serde(rename = "fileName")]
    pub name: String,
    pub status: FileStatus,
    /// Content type declared by the uploader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Size in bytes, known once uploaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Hex MD5 digest, known once uploaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    /// Client-chosen correlation token echoed back on creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Opaque data owned by the data backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_details: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl File {
    /// Create a placeholder file in `Missing` status.
    pub fn new(upload_id: UploadId, name: impl Into<String>, reference: Option<String>) -> Self {
        Self {
            id: FileId::new(),
            upload_id,
            name: name.into(),
            status: FileStatus::Missing,
            mime_type: None,
            size: None,
            md5: None,
            reference,
            backend_details: None,
            created_at: crate::now(),
        }
    }

    /// Strip data that only the data backend may see.
    pub fn sanitize(&mut self) {
        self.backend_details = None;
    }
}

/// A file the client wants to register on an upload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFile {
    #[serde(rename = "fileName")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}
