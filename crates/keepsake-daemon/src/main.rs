//! Host process for the Keepsake data engine.
//!
//! Owns the database pool and the engine, keeps the backing table in
//! shape, and flushes every cached entity before exiting.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `KEEPSAKE_CONFIG` or `keepsake-config.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Connect to `PostgreSQL` and bootstrap the entity table
//! 4. Create the data engine over that table
//! 5. Start the retention cleanup job
//! 6. Wait for Ctrl-C, then save everything cached and close the pool

mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keepsake_core::config::LoggingConfig;
use keepsake_core::{DataEngine, EngineConfig, ShutdownOutcome};
use keepsake_db::{PostgresConfig, PostgresPool, RowStore, SqlIdent};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::error::DaemonError;

/// Config file read when `KEEPSAKE_CONFIG` is unset.
const DEFAULT_CONFIG_PATH: &str = "keepsake-config.yaml";

/// Application entry point for the daemon.
///
/// # Errors
///
/// Returns an error if configuration, connection, or schema bootstrap
/// fails.
#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    // 1. Load configuration.
    let path = config_path();
    let config = load_config(&path)?;

    // 2. Initialize structured logging.
    init_tracing(&config.logging);
    info!("keepsaked starting");
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
    }
    info!(
        table = config.database.table,
        max_connections = config.database.max_connections,
        save_throttle_ms = config.persistence.save_throttle_ms,
        retention_days = config.retention.retention_days,
        "Configuration loaded"
    );

    // 3. Connect and bootstrap.
    let pg_config = PostgresConfig::new(&config.database.url)
        .with_max_connections(config.database.max_connections)
        .with_connect_timeout(Duration::from_secs(config.database.connect_timeout_secs));
    let pool = PostgresPool::connect(&pg_config).await?;
    let store = Arc::new(pool.row_store(SqlIdent::new(config.database.table.as_str())?));
    store.ensure_table().await?;

    // 4. Create the engine.
    let engine = DataEngine::new(store, &config);

    // 5. Start retention cleanup.
    let retention = engine.spawn_retention(&config.retention);

    // 6. Run until interrupted.
    info!("keepsaked ready; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    if let Some(job) = retention {
        job.abort();
    }
    match engine.shutdown().await {
        ShutdownOutcome::Completed(outcome) => info!(?outcome, "Final save finished"),
        ShutdownOutcome::TimedOut => error!("Final save timed out"),
    }
    engine.dispose();
    pool.close().await;

    info!("keepsaked stopped");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

/// Config path from `KEEPSAKE_CONFIG`, or the default file name.
fn config_path() -> PathBuf {
    std::env::var_os("KEEPSAKE_CONFIG")
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
}

/// Load configuration from `path`, falling back to defaults when the file
/// is absent. `DATABASE_URL` applies either way.
fn load_config(path: &Path) -> Result<EngineConfig, DaemonError> {
    if path.exists() {
        Ok(EngineConfig::from_file(path)?)
    } else {
        let mut config = EngineConfig::default();
        config.database.apply_env_overrides();
        Ok(config)
    }
}
