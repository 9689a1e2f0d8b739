//! Size and MD5 accounting for upload bodies.

use futures::StreamExt;
use md5::{Digest, Md5};
use parcel_storage::{ByteStream, StorageError};
use std::sync::{Arc, Mutex};

/// Size and checksum of a received body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyDigest {
    pub size: u64,
    pub md5: String,
}

struct MeterState {
    hasher: Md5,
    size: u64,
}

/// Observes the bytes flowing into a data backend.
///
/// The wrapped stream fails with [`StorageError::LimitExceeded`] as soon as the
/// running size passes the limit, so backends stop writing early.
#[derive(Clone)]
pub struct Meter {
    state: Arc<Mutex<MeterState>>,
    limit: Option<u64>,
}

impl Meter {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MeterState {
                hasher: Md5::new(),
                size: 0,
            })),
            limit,
        }
    }

    /// Wrap a body so every chunk is counted and hashed.
    pub fn wrap(&self, body: ByteStream) -> ByteStream {
        let meter = self.clone();
        Box::pin(body.map(move |chunk| {
            let chunk = chunk?;
            let mut state = meter.lock();
            state.size += chunk.len() as u64;
            if let Some(limit) = meter.limit
                && state.size > limit
            {
                return Err(StorageError::LimitExceeded(format!(
                    "body exceeds {limit} bytes"
                )));
            }
            state.hasher.update(&chunk);
            Ok(chunk)
        }))
    }

    /// Digest of everything seen so far.
    pub fn finish(&self) -> BodyDigest {
        let state = self.lock();
        BodyDigest {
            size: state.size,
            md5: hex::encode(state.hasher.clone().finalize()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MeterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
