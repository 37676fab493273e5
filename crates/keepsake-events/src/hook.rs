//! Hook phases, signals, and the context handed to subscribers.

use std::sync::Arc;

use keepsake_types::{DataClass, EntityId, Value};

/// When a subscriber runs relative to the guarded action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    /// Before the action; may veto it.
    Pre,
    /// After the action; notification only.
    Post,
}

/// What a subscriber wants the dispatcher to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookSignal {
    /// No opinion, proceed.
    #[default]
    Continue,
    /// Suppress the guarded action (pre phase); later subscribers still run.
    Handled,
    /// Halt dispatch immediately and, in the pre phase, suppress the action.
    Stop,
    /// The subscriber altered shared state; otherwise behaves as `Continue`.
    Changed,
}

/// The kind of event being dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Handler data is being loaded for an entity. `Pre` marks the start,
    /// `Post` the end.
    Load,
    /// Handler data is being saved for an entity. `Pre` marks the start,
    /// `Post` the end.
    Save,
    /// A module-defined named event. The name must be registered first.
    Custom(Arc<str>),
}

impl EventKind {
    /// Build a custom kind from a name.
    pub fn custom(name: &str) -> Self {
        Self::Custom(Arc::from(name))
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        match self {
            Self::Load => "load",
            Self::Save => "save",
            Self::Custom(name) => name,
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a subscriber learns about a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct EventContext {
    /// Event being dispatched.
    pub kind: EventKind,
    /// Entity the event concerns, if any.
    pub entity: Option<EntityId>,
    /// Owning module of the handler that fired the event, if any.
    pub module: Option<String>,
    /// Data-class of the handler that fired the event, if any.
    pub class: Option<DataClass>,
    /// Free-form payload for custom events.
    pub payload: Value,
}

impl EventContext {
    /// Context for `kind` with no entity, module, or payload.
    pub const fn new(kind: EventKind) -> Self {
        Self {
            kind,
            entity: None,
            module: None,
            class: None,
            payload: Value::Null,
        }
    }

    /// Context for a named custom event.
    pub fn custom(name: &str) -> Self {
        Self::new(EventKind::custom(name))
    }

    /// Attach the entity.
    #[must_use]
    pub const fn for_entity(mut self, entity: EntityId) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Attach the owning module and data-class of the firing handler.
    #[must_use]
    pub fn for_handler(mut self, module: &str, class: DataClass) -> Self {
        self.module = Some(module.to_owned());
        self.class = Some(class);
        self
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}
