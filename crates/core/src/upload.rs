//! Upload records and creation parameters.

use crate::file::File;
use crate::id::UploadId;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// TTL value meaning "never expires".
pub const TTL_INFINITE: i64 = -1;

/// An upload groups one or more files under a shared policy and capability token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    pub id: UploadId,
    /// Capability secret authorizing mutation. Only ever sent to its holder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_token: Option<String>,
    /// Owning user, as asserted by the authentication layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// User API token the upload was created with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    pub one_shot: bool,
    pub removable: bool,
    pub stream: bool,
    pub protected_by_password: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    /// SHA-256 of `login:password`, never serialized to clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    /// Time to live in seconds, [`TTL_INFINITE`] for uploads that never expire.
    pub ttl: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expire_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Upload {
    /// Create a new upload with fresh identity and token.
    ///
    /// `ttl` must already be resolved against the server limits.
    pub fn new(params: &UploadParams, ttl: i64, now: OffsetDateTime) -> Self {
        let mut upload = Self {
            id: UploadId::new(),
            upload_token: Some(crate::id::new_upload_token()),
            user: None,
            token: None,
            comments: params.comments.clone(),
            one_shot: params.one_shot,
            removable: params.removable,
            stream: params.stream,
            protected_by_password: false,
            login: None,
            password_hash: None,
            ttl,
            created_at: now,
            expire_at: None,
            deleted_at: None,
        };
        upload.expire_at = upload.expiration_for(ttl);

        if let (Some(login), Some(password)) = (&params.login, &params.password) {
            upload.protected_by_password = true;
            upload.password_hash = Some(crate::auth::hash_credentials(login, password));
            upload.login = Some(login.clone());
        }

        upload
    }

    /// Expiration derived from creation time and a TTL.
    ///
    /// TTLs too large to represent never expire.
    pub fn expiration_for(&self, ttl: i64) -> Option<OffsetDateTime> {
        if ttl <= 0 {
            return None;
        }
        self.created_at.checked_add(Duration::seconds(ttl))
    }

    /// Whether the upload is past its expiration at `now`.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expire_at.is_some_and(|expire_at| expire_at <= now)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Strip everything a non-holder of the capability must not see.
    pub fn sanitize(&mut self) {
        self.upload_token = None;
        self.user = None;
        self.token = None;
        self.login = None;
        self.password_hash = None;
    }

    /// Strip secrets even the capability holder does not need back.
    pub fn sanitize_for_owner(&mut self) {
        self.password_hash = None;
    }
}

/// Client-provided parameters for creating an upload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadParams {
    #[serde(default)]
    pub one_shot: bool,
    #[serde(default)]
    pub removable: bool,
    #[serde(default)]
    pub stream: bool,
    /// Requested TTL in seconds. `None` or `0` selects the server default,
    /// [`TTL_INFINITE`] requests an upload that never expires.
    #[serde(default)]
    pub ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Owning user; honored only for admin callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// User API token; honored only for admin callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Request body for creating an upload together with its placeholder files.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateUpload {
    #[serde(flatten)]
    pub params: UploadParams,
    #[serde(default)]
    pub files: Vec<crate::file::NewFile>,
}

/// An upload together with its files, as returned by the API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadView {
    #[serde(flatten)]
    pub upload: Upload,
    #[serde(default)]
    pub files: Vec<File>,
}

/// Filter for listing uploads.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UploadFilter {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Include soft-deleted uploads.
    #[serde(default)]
    pub include_deleted: bool,
}

impl UploadFilter {
    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..Default::default()
        }
    }

    /// Check an upload against the filter.
    pub fn matches(&self, upload: &Upload) -> bool {
        if !self.include_deleted && upload.is_deleted() {
            return false;
        }
        if let Some(user) = &self.user
            && upload.user.as_ref() != Some(user)
        {
            return false;
        }
        if let Some(token) = &self.token
            && upload.token.as_ref() != Some(token)
        {
            return false;
        }
        true
    }
}
