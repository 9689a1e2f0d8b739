//! Data backend contract.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads and writes.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Opaque per-file data produced and consumed only by a backend.
pub type BackendDetails = Option<serde_json::Value>;

/// Byte storage addressed by `(upload_id, file_id)`.
///
/// Backends never see file status; the metadata store owns it. A backend is
/// only written after the file was moved to `uploading`, and only deleted from
/// after it was moved to `removed`.
#[async_trait]
pub trait DataBackend: Send + Sync + 'static {
    /// Store a file's bytes, returning the details needed to read them back.
    async fn put(&self, upload_id: &str, file_id: &str, data: ByteStream)
    -> StorageResult<BackendDetails>;

    /// Read a file's bytes.
    async fn get(
        &self,
        upload_id: &str,
        file_id: &str,
        details: &BackendDetails,
    ) -> StorageResult<ByteStream>;

    /// Delete a file's bytes.
    ///
    /// Must be safe to retry: deleting an absent object succeeds.
    async fn delete(&self, upload_id: &str, file_id: &str, details: &BackendDetails)
    -> StorageResult<()>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Check backend health.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Wrap a single buffer as a byte stream.
pub fn stream_from_bytes(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Drain a byte stream into one buffer.
pub async fn collect_stream(mut stream: ByteStream) -> StorageResult<Bytes> {
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(Bytes::from(buf))
}
