//! In-process data backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{BackendDetails, ByteStream, DataBackend, collect_stream, stream_from_bytes};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Data backend holding file contents in memory.
///
/// Used by tests and by deployments that accept losing data on restart.
#[derive(Default)]
pub struct MemoryBackend {
    files: RwLock<HashMap<(String, String), Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored files.
    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }

    /// Whether bytes are stored for the file.
    pub async fn contains(&self, upload_id: &str, file_id: &str) -> bool {
        self.files
            .read()
            .await
            .contains_key(&(upload_id.to_string(), file_id.to_string()))
    }
}

#[async_trait]
impl DataBackend for MemoryBackend {
    async fn put(
        &self,
        upload_id: &str,
        file_id: &str,
        data: ByteStream,
    ) -> StorageResult<BackendDetails> {
        // Buffer first so a failed body never replaces stored content.
        let bytes = collect_stream(data).await?;
        self.files
            .write()
            .await
            .insert((upload_id.to_string(), file_id.to_string()), bytes);
        Ok(None)
    }

    async fn get(
        &self,
        upload_id: &str,
        file_id: &str,
        _details: &BackendDetails,
    ) -> StorageResult<ByteStream> {
        let files = self.files.read().await;
        let bytes = files
            .get(&(upload_id.to_string(), file_id.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("{upload_id}/{file_id}")))?;
        Ok(stream_from_bytes(bytes))
    }

    async fn delete(
        &self,
        upload_id: &str,
        file_id: &str,
        _details: &BackendDetails,
    ) -> StorageResult<()> {
        self.files
            .write()
            .await
            .remove(&(upload_id.to_string(), file_id.to_string()));
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
