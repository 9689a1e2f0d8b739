//! Rendezvous backend for stream uploads.
//!
//! A stream upload is never persisted. The uploader's `put` registers itself
//! and parks until a downloader calls `get`; bytes then flow through a bounded
//! channel, so the uploader advances only as fast as the downloader reads.
//! Each registration serves exactly one downloader, and deleting the file
//! aborts the transfer whether or not a downloader attached.

use crate::error::{StorageError, StorageResult};
use crate::traits::{BackendDetails, ByteStream, DataBackend};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::instrument;

/// Frames buffered between uploader and downloader.
pub const DEFAULT_STREAM_BUFFER: usize = 16;

enum Frame {
    Data(Bytes),
    End,
    Failed(String),
}

struct PendingStream {
    frames: mpsc::Receiver<Frame>,
    attached: oneshot::Sender<()>,
    cancel: oneshot::Sender<()>,
    token: u64,
}

/// A transfer whose downloader attached. Dropping `cancel` stops the uploader.
struct ActiveStream {
    cancel: oneshot::Sender<()>,
    token: u64,
}

#[derive(Default)]
struct Registry {
    pending: HashMap<String, PendingStream>,
    active: HashMap<String, ActiveStream>,
}

/// Data backend that hands an upload's body directly to one downloader.
pub struct StreamBackend {
    registry: Mutex<Registry>,
    next_token: AtomicU64,
    buffer: usize,
}

impl Default for StreamBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamBackend {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_STREAM_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_token: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Whether an uploader is waiting for a downloader on this file.
    pub fn is_waiting(&self, upload_id: &str, file_id: &str) -> bool {
        self.lock()
            .pending
            .contains_key(&stream_key(upload_id, file_id))
    }

    /// Whether bytes are flowing from an uploader to a downloader on this file.
    pub fn is_transferring(&self, upload_id: &str, file_id: &str) -> bool {
        self.lock()
            .active
            .contains_key(&stream_key(upload_id, file_id))
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // The maps hold no invariants a panicking holder could break halfway.
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn stream_key(upload_id: &str, file_id: &str) -> String {
    format!("{upload_id}/{file_id}")
}

/// Unregisters an uploader when its `put` returns or is dropped.
struct PendingGuard<'a> {
    backend: &'a StreamBackend,
    key: String,
    token: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut registry = self.backend.lock();
        if registry
            .pending
            .get(&self.key)
            .is_some_and(|p| p.token == self.token)
        {
            registry.pending.remove(&self.key);
        }
        if registry
            .active
            .get(&self.key)
            .is_some_and(|a| a.token == self.token)
        {
            registry.active.remove(&self.key);
        }
    }
}

#[async_trait]
impl DataBackend for StreamBackend {
    #[instrument(skip(self, data), fields(backend = "stream"))]
    async fn put(
        &self,
        upload_id: &str,
        file_id: &str,
        mut data: ByteStream,
    ) -> StorageResult<BackendDetails> {
        let key = stream_key(upload_id, file_id);
        let (tx, rx) = mpsc::channel(self.buffer);
        let (attach_tx, attach_rx) = oneshot::channel();
        let (cancel_tx, mut cancelled) = oneshot::channel::<()>();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        {
            let mut registry = self.lock();
            if registry.pending.contains_key(&key) || registry.active.contains_key(&key) {
                return Err(StorageError::AlreadyExists(key));
            }
            registry.pending.insert(
                key.clone(),
                PendingStream {
                    frames: rx,
                    attached: attach_tx,
                    cancel: cancel_tx,
                    token,
                },
            );
        }
        let _guard = PendingGuard {
            backend: self,
            key: key.clone(),
            token,
        };

        tracing::debug!(key = %key, "Waiting for downloader");
        attach_rx.await.map_err(|_| {
            StorageError::StreamClosed("stream cancelled before a downloader attached".to_string())
        })?;
        tracing::debug!(key = %key, "Downloader attached");

        let removed =
            || StorageError::StreamClosed("stream removed during transfer".to_string());
        let mut sent = 0u64;
        loop {
            let chunk = tokio::select! {
                _ = &mut cancelled => return Err(removed()),
                chunk = data.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            match chunk {
                Ok(bytes) => {
                    sent += bytes.len() as u64;
                    let delivered = tokio::select! {
                        _ = &mut cancelled => return Err(removed()),
                        delivered = tx.send(Frame::Data(bytes)) => delivered,
                    };
                    if delivered.is_err() {
                        return Err(StorageError::StreamClosed(
                            "downloader went away".to_string(),
                        ));
                    }
                }
                Err(err) => {
                    let _ = tx.send(Frame::Failed(err.to_string())).await;
                    return Err(err);
                }
            }
        }

        tx.send(Frame::End)
            .await
            .map_err(|_| StorageError::StreamClosed("downloader went away".to_string()))?;
        tracing::debug!(key = %key, size = sent, "Stream handed off");

        Ok(None)
    }

    #[instrument(skip(self, _details), fields(backend = "stream"))]
    async fn get(
        &self,
        upload_id: &str,
        file_id: &str,
        _details: &BackendDetails,
    ) -> StorageResult<ByteStream> {
        let key = stream_key(upload_id, file_id);
        let mut frames = {
            let mut registry = self.lock();
            let pending = registry
                .pending
                .remove(&key)
                .ok_or_else(|| StorageError::NotFound(key.clone()))?;
            if pending.attached.send(()).is_err() {
                return Err(StorageError::StreamClosed(
                    "uploader went away".to_string(),
                ));
            }
            registry.active.insert(
                key,
                ActiveStream {
                    cancel: pending.cancel,
                    token: pending.token,
                },
            );
            pending.frames
        };

        let stream = async_stream::try_stream! {
            loop {
                match frames.recv().await {
                    Some(Frame::Data(bytes)) => yield bytes,
                    Some(Frame::End) => break,
                    Some(Frame::Failed(reason)) => {
                        Err::<(), _>(StorageError::StreamClosed(reason))?;
                    }
                    None => {
                        Err::<(), _>(StorageError::StreamClosed("uploader went away".to_string()))?;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn delete(
        &self,
        upload_id: &str,
        file_id: &str,
        _details: &BackendDetails,
    ) -> StorageResult<()> {
        // Dropping the registration wakes the uploader with an error, parked or not.
        let key = stream_key(upload_id, file_id);
        let mut registry = self.lock();
        registry.pending.remove(&key);
        registry.active.remove(&key);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{collect_stream, stream_from_bytes};
    use std::sync::Arc;
    use std::time::Duration;

    async fn wait_until_waiting(backend: &StreamBackend, upload: &str, file: &str) {
        for _ in 0..200 {
            if backend.is_waiting(upload, file) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("uploader never registered");
    }

    #[tokio::test]
    async fn download_without_uploader_is_not_found() {
        let backend = StreamBackend::new();
        assert!(matches!(
            backend.get("u", "f", &None).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn hands_bytes_to_one_downloader() {
        let backend = Arc::new(StreamBackend::new());
        let uploader = {
            let backend = backend.clone();
            tokio::spawn(async move {
                let body: ByteStream = Box::pin(futures::stream::iter(vec![
                    Ok(Bytes::from("data ")),
                    Ok(Bytes::from("data ")),
                    Ok(Bytes::from("data")),
                ]));
                backend.put("u", "f", body).await
            })
        };

        wait_until_waiting(&backend, "u", "f").await;
        let stream = backend.get("u", "f", &None).await.unwrap();
        let data = collect_stream(stream).await.unwrap();
        assert_eq!(data, Bytes::from("data data data"));

        uploader.await.unwrap().unwrap();
        assert!(!backend.is_waiting("u", "f"));
        assert!(matches!(
            backend.get("u", "f", &None).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn second_uploader_is_rejected() {
        let backend = Arc::new(StreamBackend::new());
        let first = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.put("u", "f", stream_from_bytes("a")).await })
        };
        wait_until_waiting(&backend, "u", "f").await;

        let second = backend.put("u", "f", stream_from_bytes("b")).await;
        assert!(matches!(second, Err(StorageError::AlreadyExists(_))));

        backend.delete("u", "f", &None).await.unwrap();
        let first = first.await.unwrap();
        assert!(matches!(first, Err(StorageError::StreamClosed(_))));
    }

    #[tokio::test]
    async fn cancelled_uploader_unregisters() {
        let backend = Arc::new(StreamBackend::new());
        let uploader = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.put("u", "f", stream_from_bytes("a")).await })
        };
        wait_until_waiting(&backend, "u", "f").await;

        uploader.abort();
        let _ = uploader.await;
        assert!(!backend.is_waiting("u", "f"));
    }

    #[tokio::test]
    async fn uploader_failure_reaches_downloader() {
        let backend = Arc::new(StreamBackend::new());
        let uploader = {
            let backend = backend.clone();
            tokio::spawn(async move {
                let body: ByteStream = Box::pin(futures::stream::iter(vec![
                    Ok(Bytes::from("partial")),
                    Err(StorageError::io("connection reset")),
                ]));
                backend.put("u", "f", body).await
            })
        };
        wait_until_waiting(&backend, "u", "f").await;

        let stream = backend.get("u", "f", &None).await.unwrap();
        assert!(matches!(
            collect_stream(stream).await,
            Err(StorageError::StreamClosed(_))
        ));
        assert!(uploader.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn delete_during_transfer_stops_uploader() {
        let backend = Arc::new(StreamBackend::new());
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let uploader = {
            let backend = backend.clone();
            tokio::spawn(async move {
                let body: ByteStream = Box::pin(async_stream::stream! {
                    yield Ok::<_, StorageError>(Bytes::from("head"));
                    let _ = release_rx.await;
                    yield Ok::<_, StorageError>(Bytes::from("tail"));
                });
                backend.put("u", "f", body).await
            })
        };
        wait_until_waiting(&backend, "u", "f").await;

        let mut stream = backend.get("u", "f", &None).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from("head"));
        assert!(backend.is_transferring("u", "f"));

        backend.delete("u", "f", &None).await.unwrap();
        assert!(matches!(
            uploader.await.unwrap(),
            Err(StorageError::StreamClosed(_))
        ));
        assert!(stream.next().await.unwrap().is_err());
        assert!(!backend.is_transferring("u", "f"));
        drop(release_tx);
    }

    #[tokio::test]
    async fn dropped_downloader_stops_uploader() {
        let backend = Arc::new(StreamBackend::with_buffer(1));
        let uploader = {
            let backend = backend.clone();
            tokio::spawn(async move {
                let body: ByteStream = Box::pin(futures::stream::iter(
                    (0..64).map(|_| Ok(Bytes::from_static(b"chunk"))),
                ));
                backend.put("u", "f", body).await
            })
        };
        wait_until_waiting(&backend, "u", "f").await;

        let stream = backend.get("u", "f", &None).await.unwrap();
        drop(stream);
        assert!(matches!(
            uploader.await.unwrap(),
            Err(StorageError::StreamClosed(_))
        ));
    }
}
