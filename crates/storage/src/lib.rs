//! Data backends for parcel.
//!
//! This crate provides:
//! - The `DataBackend` contract addressed by `(upload_id, file_id)`
//! - Backends: local filesystem and in-memory
//! - `StreamBackend`, the rendezvous used by stream uploads

pub mod backends;
pub mod error;
pub mod stream;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, memory::MemoryBackend};
pub use error::{StorageError, StorageResult};
pub use stream::StreamBackend;
pub use traits::{BackendDetails, ByteStream, DataBackend, collect_stream, stream_from_bytes};

use parcel_core::config::StorageConfig;
use std::sync::Arc;

/// Create the data backend from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn DataBackend>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
    }
}
