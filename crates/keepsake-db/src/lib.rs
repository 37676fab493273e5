//! Backing-row storage for the Keepsake data engine.
//!
//! Every entity owns one row in a single table. Each (module, data-class)
//! handler owns one JSON text column in that row, and every load and save
//! refreshes the row's `last_seen` timestamp.
//!
//! # Architecture
//!
//! ```text
//! keepsake-core handlers
//!     |
//!     +-- RowStore (async trait)
//!           |-- PgRowStore      (sqlx, PostgreSQL, production)
//!           +-- MemoryRowStore  (in-process, tests and embedding)
//! ```
//!
//! # Modules
//!
//! - [`store`] -- the [`RowStore`] trait and [`ColumnWrite`]
//! - [`postgres`] -- `PostgreSQL` pool configuration and [`PgRowStore`]
//! - [`memory`] -- [`MemoryRowStore`]
//! - [`ident`] -- validated SQL identifiers
//! - [`error`] -- shared error type

pub mod error;
pub mod ident;
pub mod memory;
pub mod postgres;
pub mod store;

// Re-export primary types for convenience.
pub use error::DbError;
pub use ident::SqlIdent;
pub use memory::MemoryRowStore;
pub use postgres::{PgRowStore, PostgresConfig, PostgresPool};
pub use store::{ColumnWrite, RowStore};
