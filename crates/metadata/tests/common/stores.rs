//! Metadata store test utilities.

use parcel_metadata::{MetadataError, MetadataResult, MetadataStore, PostgresStore, RedbStore, SqliteStore};
use std::future::Future;
use std::sync::Arc;
use tempfile::TempDir;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Stable prefix for Docker/container startup failures in Postgres test setup.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// A SQLite store in a temporary directory.
#[allow(dead_code)]
pub struct TestSqlite {
    pub store: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

impl TestSqlite {
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir()?;
        let store = SqliteStore::new(temp_dir.path().join("test.db"), None).await?;
        Ok(Self {
            store: Arc::new(store),
            _temp_dir: temp_dir,
        })
    }
}

/// PostgreSQL store backed by a testcontainer.
#[allow(dead_code)]
pub struct TestPostgres {
    pub store: Arc<PostgresStore>,
    _container: ContainerAsync<Postgres>,
}

impl TestPostgres {
    pub async fn new() -> MetadataResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                MetadataError::Internal(format!(
                    "{POSTGRES_CONTAINER_START_ERR_PREFIX} Failed to start PostgreSQL container: {e}"
                ))
            })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let store = PostgresStore::from_url(&url, 5, None).await?;

        Ok(Self {
            store: Arc::new(store),
            _container: container,
        })
    }
}

/// Start PostgreSQL, or `None` when Docker is unavailable or SKIP_POSTGRES_TESTS is set.
///
/// Only container-start failures cause a skip; schema or connection errors panic.
#[allow(dead_code)]
pub async fn postgres_or_skip() -> Option<TestPostgres> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match TestPostgres::new().await {
        Ok(postgres) => Some(postgres),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(POSTGRES_CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
                None
            } else {
                panic!("PostgreSQL test setup failed: {msg}");
            }
        }
    }
}

/// Run a test against SQLite, redb and (when Docker is available) PostgreSQL.
#[allow(dead_code)]
pub async fn run_metadata_test_all<F, Fut>(test_fn: F)
where
    F: Fn(Arc<dyn MetadataStore>) -> Fut,
    Fut: Future<Output = ()>,
{
    let sqlite = TestSqlite::new()
        .await
        .expect("Failed to create SQLite test store");
    test_fn(sqlite.store.clone()).await;

    let redb = RedbStore::in_memory()
        .await
        .expect("Failed to create redb test store");
    test_fn(Arc::new(redb)).await;

    if let Some(postgres) = postgres_or_skip().await {
        test_fn(postgres.store.clone()).await;
    }
}
