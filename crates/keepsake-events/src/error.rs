//! Error types for the event bus.

/// Errors returned by bus registration and subscription calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// A named event was used before being registered.
    #[error("event {0:?} is not registered")]
    UnknownEvent(String),

    /// A named event is already registered by another owner.
    #[error("event {name:?} is already registered by {owner:?}")]
    DuplicateEvent {
        /// The contested event name.
        name: String,
        /// Owner of the existing registration.
        owner: String,
    },

    /// Event names follow the attribute naming grammar.
    #[error("invalid event name: {0}")]
    InvalidName(#[from] keepsake_types::KeyError),
}

/// Error a subscriber may return instead of a signal.
///
/// The bus logs it and treats the subscriber as having returned
/// [`crate::HookSignal::Continue`], unless fail-fast dispatch is enabled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    /// Build an error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
