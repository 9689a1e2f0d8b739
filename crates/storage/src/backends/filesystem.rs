//! Local filesystem data backend.
//!
//! Files live at `<root>/<upload_id[..2]>/<upload_id>/<file_id>`. Writes go to
//! a temporary sibling which is fsynced and renamed into place, so a crashed
//! upload never leaves a partially written file under its final name.

use crate::error::{StorageError, StorageResult};
use crate::traits::{BackendDetails, ByteStream, DataBackend};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;
use uuid::Uuid;

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Local filesystem data backend.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative key for a file.
    fn key(upload_id: &str, file_id: &str) -> StorageResult<String> {
        for (kind, segment) in [("upload", upload_id), ("file", file_id)] {
            if segment.len() < 2 || !segment.bytes().all(|b| b.is_ascii_alphanumeric()) {
                return Err(StorageError::InvalidKey(format!(
                    "invalid {kind} id: {segment:?}"
                )));
            }
        }
        Ok(format!("{}/{upload_id}/{file_id}", &upload_id[..2]))
    }

    /// Key recorded in the backend details, falling back to the computed key.
    fn resolve_key(upload_id: &str, file_id: &str, details: &BackendDetails) -> StorageResult<String> {
        let computed = Self::key(upload_id, file_id)?;
        match details
            .as_ref()
            .and_then(|d| d.get("path"))
            .and_then(|p| p.as_str())
        {
            Some(recorded) if recorded == computed => Ok(computed),
            Some(recorded) => Err(StorageError::InvalidKey(format!(
                "backend details point to {recorded}, expected {computed}"
            ))),
            None => Ok(computed),
        }
    }

    /// Absolute path for a key, refusing anything that resolves outside the root.
    ///
    /// Canonicalization touches the filesystem, so it runs on the blocking pool.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| StorageError::io(format!("spawn_blocking failed: {e}")))?
    }

    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        let path = root.join(key);
        let root_canonical = root.canonicalize()?;

        // The nearest existing ancestor must stay inside the root, which also
        // catches symlinked shard directories.
        let mut ancestor = path.as_path();
        loop {
            match std::fs::symlink_metadata(ancestor) {
                Ok(_) => {
                    let canonical = ancestor.canonicalize().map_err(|_| {
                        StorageError::InvalidKey(format!("dangling symlink on path: {key}"))
                    })?;
                    if !canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "path escapes storage root: {key}"
                        )));
                    }
                    return Ok(path);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    ancestor = match ancestor.parent() {
                        Some(parent) => parent,
                        None => return Ok(path),
                    };
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }
    }

    fn not_found(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
        move |e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(e)
            }
        }
    }
}

#[async_trait]
impl DataBackend for FilesystemBackend {
    #[instrument(skip(self, data), fields(backend = "filesystem"))]
    async fn put(
        &self,
        upload_id: &str,
        file_id: &str,
        mut data: ByteStream,
    ) -> StorageResult<BackendDetails> {
        let key = Self::key(upload_id, file_id)?;
        let path = self.key_path(&key).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = path.with_file_name(format!("{file_id}.tmp.{}", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path).await?;

        let written: StorageResult<u64> = async {
            let mut written = 0u64;
            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.sync_all().await?;
            Ok(written)
        }
        .await;

        drop(file);
        let written = match written {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };

        fs::rename(&temp_path, &path).await?;
        tracing::debug!(key = %key, size = written, "Stored file");

        Ok(Some(json!({ "path": key })))
    }

    #[instrument(skip(self, details), fields(backend = "filesystem"))]
    async fn get(
        &self,
        upload_id: &str,
        file_id: &str,
        details: &BackendDetails,
    ) -> StorageResult<ByteStream> {
        let key = Self::resolve_key(upload_id, file_id, details)?;
        let path = self.key_path(&key).await?;
        let file = fs::File::open(&path).await.map_err(Self::not_found(&key))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, details), fields(backend = "filesystem"))]
    async fn delete(
        &self,
        upload_id: &str,
        file_id: &str,
        details: &BackendDetails,
    ) -> StorageResult<()> {
        let key = Self::resolve_key(upload_id, file_id, details)?;
        let path = self.key_path(&key).await?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(key = %key, "File already absent");
            }
            Err(e) => return Err(StorageError::Io(e)),
        }

        // Drop the per-upload directory once its last file is gone.
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir(dir).await;
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    async fn health_check(&self) -> StorageResult<()> {
        fs::metadata(&self.root).await?;
        Ok(())
    }
}
