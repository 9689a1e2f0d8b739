//! Application state shared across handlers.

use crate::cleaning::CleaningEngine;
use crate::lifecycle::Lifecycle;
use parcel_core::config::AppConfig;
use parcel_metadata::MetadataStore;
use parcel_storage::{DataBackend, StreamBackend};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Data backend for stored files.
    pub data: Arc<dyn DataBackend>,
    pub lifecycle: Arc<Lifecycle>,
    pub cleaner: Arc<CleaningEngine>,
}

impl AppState {
    /// Wire the lifecycle and cleaning engines over the given stores.
    ///
    /// The configuration is expected to be validated already.
    pub fn new(
        config: AppConfig,
        data: Arc<dyn DataBackend>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let stream = Arc::new(StreamBackend::new());
        let lifecycle = Lifecycle::new(
            metadata.clone(),
            data.clone(),
            stream.clone(),
            config.limits.clone(),
        );
        let cleaner = CleaningEngine::new(metadata.clone(), data.clone(), config.cleaning.clone())
            .with_stream(stream);

        Self {
            config: Arc::new(config),
            metadata,
            data,
            lifecycle: Arc::new(lifecycle),
            cleaner: Arc::new(cleaner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parcel_metadata::SqliteStore;
    use parcel_storage::MemoryBackend;

    #[tokio::test]
    async fn state_shares_one_stream_backend() {
        let metadata = Arc::new(SqliteStore::in_memory().await.unwrap());
        let state = AppState::new(
            AppConfig::for_testing(),
            Arc::new(MemoryBackend::new()),
            metadata,
        );
        assert!(!state.lifecycle.stream().is_waiting("u", "f"));
        assert!(!state.cleaner.config().enabled);
    }
}
