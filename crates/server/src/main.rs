//! parcel server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use parcel_core::config::AppConfig;
use parcel_server::{AppState, create_router};
use std::net::SocketAddr;
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ENV_PREFIX: &str = "PARCEL_";

/// parcel - temporary file sharing server
#[derive(Parser, Debug)]
#[command(name = "parceld")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "PARCEL_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

/// Load configuration from an optional TOML file overlaid with `PARCEL_` variables.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    let has_config_file = Path::new(path).exists();

    if has_config_file {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    let has_env_config = std::env::vars()
        .any(|(key, _)| key.starts_with(ENV_PREFIX) && key != "PARCEL_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: parceld --config /path/to/config.toml\n  \
             2. Environment variables: PARCEL_SERVER__BIND=0.0.0.0:8080 \
             PARCEL_METADATA__TYPE=sqlite PARCEL_METADATA__PATH=./parcel.db parceld\n\n\
             Set PARCEL_CONFIG env var to specify a default config file path."
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("parcel v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    let data = parcel_storage::from_config(&config.storage)
        .await
        .context("failed to initialize data backend")?;
    data.health_check()
        .await
        .context("data backend health check failed")?;
    tracing::info!(backend = data.backend_name(), "Data backend initialized");

    let metadata = parcel_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!(backend = metadata.backend_name(), "Metadata store initialized");

    if config.admin.token_hash.is_none() {
        tracing::warn!("No admin token configured, admin endpoints are disabled");
    }

    let state = AppState::new(config.clone(), data, metadata);

    if config.cleaning.enabled {
        let _cleaner = state.cleaner.clone().spawn();
    } else {
        tracing::info!("Background cleaning disabled");
    }

    let app = create_router(state);
    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
