//! Record builders with deterministic timestamps.

use parcel_core::{File, FileStatus, Upload, UploadId, UploadParams};
use time::{Duration, OffsetDateTime};

/// Fixed base instant so ordering assertions never depend on the clock.
pub fn base_time() -> OffsetDateTime {
    parcel_core::timestamp::from_micros(1_700_000_000_000_000)
}

/// An alive upload created `offset_secs` after [`base_time`], expiring after `ttl` seconds.
#[allow(dead_code)]
pub fn upload_at(offset_secs: i64, ttl: i64) -> Upload {
    Upload::new(
        &UploadParams::default(),
        ttl,
        base_time() + Duration::seconds(offset_secs),
    )
}

#[allow(dead_code)]
pub fn user_upload_at(user: &str, offset_secs: i64) -> Upload {
    let mut upload = upload_at(offset_secs, 0);
    upload.user = Some(user.to_string());
    upload.token = Some(format!("{user}-token"));
    upload
}

#[allow(dead_code)]
pub fn file_for(upload_id: &UploadId, name: &str) -> File {
    let mut file = File::new(upload_id.clone(), name, Some(name.to_string()));
    file.created_at = base_time();
    file
}

#[allow(dead_code)]
pub fn file_in(upload_id: &UploadId, name: &str, status: FileStatus) -> File {
    let mut file = file_for(upload_id, name);
    file.status = status;
    file
}
