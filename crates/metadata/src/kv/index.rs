//! Secondary index entries for the key-value store.
//!
//! Every entry is a pure function of one record. Writers remove the entries
//! of the previous version and insert those of the new one in the same
//! transaction, so the index never drifts from the records it describes.
//!
//! | prefix | key                                   | value     |
//! |--------|---------------------------------------|-----------|
//! | `c/`   | created ts + upload id                | empty     |
//! | `d/`   | upload id (soft-deleted only)         | empty     |
//! | `e/`   | expire ts + upload id (alive only)    | empty     |
//! | `u/`   | user NUL reversed created ts + id     | token     |
//! | `f/`   | upload id NUL file id                 | empty     |
//! | `s/`   | status NUL file id                    | upload id |

use parcel_core::timestamp::to_micros;
use parcel_core::{File, FileStatus, Upload};
use time::OffsetDateTime;

pub const CREATED: &[u8] = b"c/";
pub const DELETED: &[u8] = b"d/";
pub const EXPIRING: &[u8] = b"e/";
pub const BY_USER: &[u8] = b"u/";
pub const FILES_BY_UPLOAD: &[u8] = b"f/";
pub const FILES_BY_STATUS: &[u8] = b"s/";

/// Width of an encoded timestamp.
pub const TS_LEN: usize = 8;

pub type Entry = (Vec<u8>, Vec<u8>);

/// Big-endian, sign-flipped so that byte order matches numeric order.
pub fn encode_ts(micros: i64) -> [u8; TS_LEN] {
    ((micros as u64) ^ (1 << 63)).to_be_bytes()
}

pub fn decode_ts(bytes: &[u8]) -> Option<i64> {
    let raw: [u8; TS_LEN] = bytes.get(..TS_LEN)?.try_into().ok()?;
    Some((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
}

fn key(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}

pub fn created_key(created_at: OffsetDateTime, id: &str) -> Vec<u8> {
    key(&[CREATED, &encode_ts(to_micros(created_at)), id.as_bytes()])
}

pub fn deleted_key(id: &str) -> Vec<u8> {
    key(&[DELETED, id.as_bytes()])
}

pub fn expiring_key(expire_at: OffsetDateTime, id: &str) -> Vec<u8> {
    key(&[EXPIRING, &encode_ts(to_micros(expire_at)), id.as_bytes()])
}

/// Prefix of a user's uploads; newest sort first.
pub fn user_prefix(user: &str) -> Vec<u8> {
    key(&[BY_USER, user.as_bytes(), b"\0"])
}

pub fn user_key(user: &str, created_at: OffsetDateTime, id: &str) -> Vec<u8> {
    let reversed = encode_ts(to_micros(created_at)).map(|b| !b);
    key(&[&user_prefix(user), &reversed, id.as_bytes()])
}

pub fn upload_files_prefix(upload_id: &str) -> Vec<u8> {
    key(&[FILES_BY_UPLOAD, upload_id.as_bytes(), b"\0"])
}

pub fn status_prefix(status: FileStatus) -> Vec<u8> {
    key(&[FILES_BY_STATUS, status.as_str().as_bytes(), b"\0"])
}

/// Index entries describing an upload.
pub fn upload_entries(upload: &Upload) -> Vec<Entry> {
    let id = upload.id.as_str();
    let mut entries = vec![(created_key(upload.created_at, id), Vec::new())];

    if upload.is_deleted() {
        entries.push((deleted_key(id), Vec::new()));
    } else if let Some(expire_at) = upload.expire_at {
        entries.push((expiring_key(expire_at, id), Vec::new()));
    }

    if let Some(user) = &upload.user {
        let token = upload.token.clone().unwrap_or_default().into_bytes();
        entries.push((user_key(user, upload.created_at, id), token));
    }

    entries
}

/// Index entries describing a file.
pub fn file_entries(file: &File) -> Vec<Entry> {
    vec![
        (
            key(&[&upload_files_prefix(file.upload_id.as_str()), file.id.as_str().as_bytes()]),
            Vec::new(),
        ),
        (
            key(&[&status_prefix(file.status), file.id.as_str().as_bytes()]),
            file.upload_id.as_str().as_bytes().to_vec(),
        ),
    ]
}

/// First key strictly greater than every key starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
