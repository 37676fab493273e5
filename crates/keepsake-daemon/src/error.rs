//! Error types for the daemon binary.

/// Top-level error for the daemon.
///
/// Each variant wraps a subsystem error so `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: keepsake_core::ConfigError,
    },

    /// Database connection or schema bootstrap failed.
    #[error("database error: {source}")]
    Db {
        /// The underlying database error.
        #[from]
        source: keepsake_db::DbError,
    },

    /// Waiting for the shutdown signal failed.
    #[error("signal error: {source}")]
    Signal {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}
