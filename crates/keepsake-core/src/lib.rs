//! Per-entity attribute storage with delta-reconciled persistence.
//!
//! Modules read and write typed attributes of external entities (players,
//! accounts) through a [`Handler`]. Values live in a process-wide
//! [`EntityCache`] and are persisted as one JSON column per handler in a
//! shared per-entity table. Tracked numeric attributes are merged by delta
//! on save, so several processes can increment the same counter without
//! losing each other's changes.
//!
//! # Architecture
//!
//! ```text
//! DataEngine
//!     |-- EntityCache   (entity, class) -> module:attribute -> Value
//!     |-- KeyRegistry   key ownership, public flags, read grants
//!     |-- EventBus      Load/Save pre+post hooks, custom events
//!     +-- Handler per (module, class)
//!           |-- get / set / register        (sync, cache only)
//!           |-- load / load_bulk / save     (async, RowStore)
//!           +-- synchronize_tracked         (delta merge)
//! ```
//!
//! # Modules
//!
//! - [`engine`] -- [`DataEngine`], sessions and shutdown
//! - [`handler`] -- [`Handler`], [`Defaults`], write options
//! - [`cache`] -- [`EntityCache`] and [`AttributeTable`]
//! - [`registry`] -- key ownership and [`ReadGrant`]
//! - [`tracked`] -- delta reconciliation
//! - [`persist`] -- load, save and batch save
//! - [`retention`] -- stale-row cleanup job
//! - [`config`] -- YAML configuration
//! - [`error`] -- registration errors

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod persist;
pub mod registry;
pub mod retention;
pub mod tracked;

// Re-export primary types for convenience.
pub use cache::{AttributeTable, EntityCache};
pub use config::{ConfigError, EngineConfig};
pub use engine::{DataEngine, SessionEndReport, ShutdownOutcome};
pub use error::RegistrationError;
pub use handler::{Defaults, Handler, SetOutcome, WriteOptions};
pub use persist::{BatchOutcome, BulkLoadReport, LoadOutcome, SaveOutcome, save_batch};
pub use registry::{KeyRegistry, KeySpec, ReadGrant};
pub use retention::{run_retention_once, spawn_retention_job};
pub use tracked::SyncReport;
