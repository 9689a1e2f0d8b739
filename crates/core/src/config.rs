//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum size of JSON request bodies in bytes.
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_request_body_bytes() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_request_body_bytes: default_max_request_body_bytes(),
        }
    }
}

/// Admin token configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Pre-computed hash of the admin token (SHA256 hex, 64 characters).
    /// Generate with: `echo -n "your-secret-token" | sha256sum`
    /// Admin endpoints are disabled when unset.
    #[serde(default)]
    pub token_hash: Option<String>,
}

impl AdminConfig {
    /// Create a test configuration with a known token.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            // SHA256 of "test-admin-token"
            token_hash: Some(
                "9f735e0df9a1ddc702bf0a1a7b83033f9f7153a00c29de82cedadc9957289b05".to_string(),
            ),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(hash) = &self.token_hash {
            let hash = hash.strip_prefix("sha256:").unwrap_or(hash);
            if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err("admin.token_hash must be a 64 character SHA256 hex digest".to_string());
            }
        }
        Ok(())
    }
}

/// Data backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for stored files.
        path: PathBuf,
    },
    /// Process memory. Contents are lost on restart.
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/files"),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Filesystem { path } if path.as_os_str().is_empty() => {
                Err("filesystem storage requires a non-empty 'path'".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// PostgreSQL SSL mode.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Query timeout in seconds (advisory only).
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL (optional if using individual fields).
        /// Takes precedence over individual fields if both are provided.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer PARCEL_METADATA__PASSWORD over storing this in the config file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
    /// Embedded key-value store (redb).
    Redb {
        /// Database file path.
        path: PathBuf,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } | MetadataConfig::Redb { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) => Ok(()),
                (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => Err(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ),
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }
}

/// Upload policy limits and feature switches.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// TTL applied when the client does not request one (seconds).
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: i64,
    /// Largest TTL a client may request (seconds). 0 allows any TTL,
    /// including uploads that never expire.
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: i64,
    /// Largest accepted file in bytes. 0 disables the limit.
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
    /// Largest number of files per upload.
    #[serde(default = "default_max_files_per_upload")]
    pub max_files_per_upload: usize,
    /// Largest zip archive built in memory, summed over its files. 0 disables the limit.
    #[serde(default = "default_max_archive_size_bytes")]
    pub max_archive_size_bytes: u64,
    #[serde(default = "default_true")]
    pub one_shot_enabled: bool,
    #[serde(default = "default_true")]
    pub removable_enabled: bool,
    #[serde(default = "default_true")]
    pub stream_enabled: bool,
    #[serde(default = "default_true")]
    pub password_enabled: bool,
}

fn default_ttl_secs() -> i64 {
    30 * 24 * 3600 // 30 days
}

fn default_max_ttl_secs() -> i64 {
    30 * 24 * 3600
}

fn default_max_file_size_bytes() -> u64 {
    10 * 1024 * 1024 * 1024 // 10 GiB
}

fn default_max_files_per_upload() -> usize {
    1000
}

fn default_max_archive_size_bytes() -> u64 {
    512 * 1024 * 1024 // 512 MiB
}

fn default_true() -> bool {
    true
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            max_ttl_secs: default_max_ttl_secs(),
            max_file_size_bytes: default_max_file_size_bytes(),
            max_files_per_upload: default_max_files_per_upload(),
            max_archive_size_bytes: default_max_archive_size_bytes(),
            one_shot_enabled: true,
            removable_enabled: true,
            stream_enabled: true,
            password_enabled: true,
        }
    }
}

impl LimitsConfig {
    /// Resolve a requested TTL into the TTL to store.
    ///
    /// `None` and `0` select the default. Negative values other than
    /// [`crate::upload::TTL_INFINITE`] are rejected.
    pub fn resolve_ttl(&self, requested: Option<i64>) -> crate::Result<i64> {
        let ttl = match requested {
            None | Some(0) => self.default_ttl_secs,
            Some(ttl) => ttl,
        };

        if ttl < 0 && ttl != crate::upload::TTL_INFINITE {
            return Err(crate::Error::InvalidTtl(format!("invalid ttl {ttl}")));
        }
        if self.max_ttl_secs > 0 {
            if ttl == crate::upload::TTL_INFINITE {
                return Err(crate::Error::InvalidTtl(format!(
                    "cannot set infinite ttl (maximum allowed is {}s)",
                    self.max_ttl_secs
                )));
            }
            if ttl > self.max_ttl_secs {
                return Err(crate::Error::InvalidTtl(format!(
                    "ttl {ttl}s exceeds maximum allowed {}s",
                    self.max_ttl_secs
                )));
            }
        }
        Ok(ttl)
    }

    /// Size limit, if any.
    pub fn max_file_size(&self) -> Option<u64> {
        (self.max_file_size_bytes > 0).then_some(self.max_file_size_bytes)
    }

    /// Archive size limit, if any.
    pub fn max_archive_size(&self) -> Option<u64> {
        (self.max_archive_size_bytes > 0).then_some(self.max_archive_size_bytes)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.default_ttl_secs <= 0 && self.default_ttl_secs != crate::upload::TTL_INFINITE {
            return Err("limits.default_ttl_secs must be positive or -1".to_string());
        }
        if self.max_ttl_secs < 0 {
            return Err("limits.max_ttl_secs must not be negative".to_string());
        }
        if self.max_files_per_upload == 0 {
            return Err("limits.max_files_per_upload must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Cleaning routine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleaningConfig {
    /// Run the cleaning routine in the background.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum delay between two cycles in seconds.
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    /// Upper bound of the random delay added to the minimum, in seconds.
    /// Spreads cycles of several servers sharing one metadata store.
    #[serde(default = "default_random_delay_secs")]
    pub random_delay_secs: u64,
    /// Entities fetched per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Maximum number of batches per pass (guards against runaway loops).
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
}

fn default_min_interval_secs() -> u64 {
    300
}

fn default_random_delay_secs() -> u64 {
    300
}

fn default_batch_size() -> u32 {
    100
}

fn default_max_iterations() -> u64 {
    10_000
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_secs: default_min_interval_secs(),
            random_delay_secs: default_random_delay_secs(),
            batch_size: default_batch_size(),
            max_iterations: default_max_iterations(),
        }
    }
}

impl CleaningConfig {
    /// Delay before the next cycle, with a random component.
    pub fn next_delay(&self) -> std::time::Duration {
        use rand::Rng;
        let jitter = if self.random_delay_secs > 0 {
            rand::rng().random_range(0..=self.random_delay_secs)
        } else {
            0
        };
        std::time::Duration::from_secs(self.min_interval_secs.saturating_add(jitter))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("cleaning.batch_size must be at least 1".to_string());
        }
        if self.max_iterations == 0 {
            return Err("cleaning.max_iterations must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub cleaning: CleaningConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

impl AppConfig {
    /// Create a test configuration.
    ///
    /// **For testing only.** Uses in-memory storage, the default SQLite path,
    /// the test admin token and no background cleaning.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::Memory,
            metadata: MetadataConfig::default(),
            limits: LimitsConfig::default(),
            cleaning: CleaningConfig {
                enabled: false,
                ..Default::default()
            },
            admin: AdminConfig::for_testing(),
        }
    }

    /// Validate every section, reporting the first problem.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.metadata.validate()?;
        self.limits.validate()?;
        self.cleaning.validate()?;
        self.admin.validate()?;
        Ok(())
    }
}
