//! Event-hook dispatch bus for the Keepsake data engine.
//!
//! The persistence layer announces load and save transitions through an
//! [`EventBus`]; modules may also register their own named events. Every
//! dispatch runs in two phases: [`HookPhase::Pre`] subscribers can veto the
//! guarded action, [`HookPhase::Post`] subscribers are notified after it.
//!
//! # Architecture
//!
//! ```text
//! subscribe / unsubscribe --rcu--> ArcSwap<Snapshot>
//!                                      |
//! dispatch --load--> Snapshot ---------+-- subscriptions (immutable Vec)
//!                                      +-- index (OnceLock, built on first use)
//! ```
//!
//! # Modules
//!
//! - [`hook`] -- phases, signals, event kinds, and the dispatch context
//! - [`bus`] -- the copy-on-write subscription store and dispatcher
//! - [`error`] -- bus and subscriber error types

pub mod bus;
pub mod error;
pub mod hook;

pub use bus::{DispatchOutcome, EventBus, SubscriptionId};
pub use error::{BusError, HookError};
pub use hook::{EventContext, EventKind, HookPhase, HookSignal};
