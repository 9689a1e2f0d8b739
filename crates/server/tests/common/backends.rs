//! Data backends with injectable failures.

use async_trait::async_trait;
use parcel_storage::{
    BackendDetails, ByteStream, DataBackend, MemoryBackend, StorageError, StorageResult,
};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Memory backend whose next deletes fail on demand.
#[allow(dead_code)]
#[derive(Default)]
pub struct FlakyBackend {
    pub inner: MemoryBackend,
    failing_deletes: AtomicUsize,
    delete_calls: AtomicUsize,
}

#[allow(dead_code)]
impl FlakyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` deletes fail.
    pub fn fail_next_deletes(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub async fn contains(&self, upload_id: &str, file_id: &str) -> bool {
        self.inner.contains(upload_id, file_id).await
    }
}

#[async_trait]
impl DataBackend for FlakyBackend {
    async fn put(
        &self,
        upload_id: &str,
        file_id: &str,
        data: ByteStream,
    ) -> StorageResult<BackendDetails> {
        self.inner.put(upload_id, file_id, data).await
    }

    async fn get(
        &self,
        upload_id: &str,
        file_id: &str,
        details: &BackendDetails,
    ) -> StorageResult<ByteStream> {
        self.inner.get(upload_id, file_id, details).await
    }

    async fn delete(
        &self,
        upload_id: &str,
        file_id: &str,
        details: &BackendDetails,
    ) -> StorageResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Backend("injected delete failure".to_string()));
        }
        self.inner.delete(upload_id, file_id, details).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}
