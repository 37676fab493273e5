//! Error types for the storage layer.
//!
//! All errors are propagated via [`DbError`], which wraps the underlying
//! [`sqlx`] error or describes which storage precondition failed.

/// Errors that can occur in the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A table or column name failed the identifier allow-list.
    #[error("invalid SQL identifier {0:?}")]
    InvalidIdentifier(String),

    /// A write targeted a column that was never created.
    #[error("unknown column {0:?}")]
    UnknownColumn(String),

    /// The store is not reachable or not initialized.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
