//! The data engine: owner of the cache, registry, event bus and handlers.
//!
//! One [`DataEngine`] per process replaces global state. Modules obtain
//! their [`Handler`]s from it; the session collaborator drives
//! [`DataEngine::begin_session`] and [`DataEngine::end_session`]; the host
//! calls [`DataEngine::shutdown`] once on exit.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use keepsake_db::RowStore;
use keepsake_events::EventBus;
use keepsake_types::{DataClass, EntityId, ModuleName};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::EntityCache;
use crate::config::{EngineConfig, RetentionConfig};
use crate::error::RegistrationError;
use crate::handler::Handler;
use crate::persist::{BatchOutcome, BulkLoadReport, SaveOutcome, save_batch};
use crate::registry::{KeyRegistry, ReadGrant};
use crate::retention::spawn_retention_job;

/// State every handler of one engine shares.
pub(crate) struct Shared {
    pub(crate) cache: EntityCache,
    pub(crate) registry: KeyRegistry,
    pub(crate) bus: EventBus,
    pub(crate) store: Arc<dyn RowStore>,
    pub(crate) save_throttle: Duration,
}

/// Tally of a [`DataEngine::end_session`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionEndReport {
    /// Handlers whose data was saved, or whose save a pre-save hook
    /// suppressed, and then cleared. A suppressed save writes nothing.
    pub saved: usize,
    /// Handlers whose save failed; their data stays cached for a retry.
    pub failed: usize,
}

/// Result of [`DataEngine::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The final batch finished in time.
    Completed(BatchOutcome),
    /// The final batch did not finish within the configured bound.
    TimedOut,
}

/// Root of the data engine.
pub struct DataEngine {
    shared: Arc<Shared>,
    handlers: DashMap<(ModuleName, DataClass), Arc<Handler>>,
    shutdown_timeout: Duration,
}

impl core::fmt::Debug for DataEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DataEngine")
            .field("table", &self.shared.store.table().as_str())
            .field("handlers", &self.handlers.len())
            .field("cached_tables", &self.shared.cache.len())
            .field("bus", &self.shared.bus)
            .finish_non_exhaustive()
    }
}

impl DataEngine {
    /// Create an engine over `store`.
    pub fn new(store: Arc<dyn RowStore>, config: &EngineConfig) -> Self {
        let shared = Shared {
            cache: EntityCache::new(),
            registry: KeyRegistry::new(),
            bus: EventBus::with_fail_fast(config.events.fail_fast),
            store,
            save_throttle: config.persistence.save_throttle(),
        };
        Self {
            shared: Arc::new(shared),
            handlers: DashMap::new(),
            shutdown_timeout: config.persistence.shutdown_timeout(),
        }
    }

    /// The event bus shared by every handler.
    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    /// The entity cache.
    pub fn cache(&self) -> &EntityCache {
        &self.shared.cache
    }

    /// The key-ownership registry.
    pub fn registry(&self) -> &KeyRegistry {
        &self.shared.registry
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.shared.store
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    /// Create the handler for `module` in `class`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::InvalidName`] for a bad module name,
    /// [`RegistrationError::DuplicateHandler`] if the pair already has a
    /// handler, and [`RegistrationError::Column`] if the backing column name
    /// is not a valid identifier.
    pub fn handler(
        &self,
        module: &str,
        class: DataClass,
    ) -> Result<Arc<Handler>, RegistrationError> {
        let module = ModuleName::new(module)?;
        let handler = Arc::new(Handler::new(module.clone(), class, Arc::clone(&self.shared))?);
        match self.handlers.entry((module, class)) {
            Entry::Occupied(slot) => Err(RegistrationError::DuplicateHandler {
                module: slot.key().0.to_string(),
                class,
            }),
            Entry::Vacant(slot) => {
                info!(
                    module = handler.module().as_str(),
                    %class,
                    column = handler.column().as_str(),
                    "Created handler"
                );
                slot.insert(Arc::clone(&handler));
                Ok(handler)
            }
        }
    }

    /// The existing handler for `module` in `class`.
    pub fn get_handler(&self, module: &str, class: DataClass) -> Option<Arc<Handler>> {
        let module = ModuleName::new(module).ok()?;
        self.handlers
            .get(&(module, class))
            .map(|h| Arc::clone(h.value()))
    }

    /// Every handler, ordered by module then data-class. This is the order
    /// batch saves visit them in.
    pub fn handlers(&self) -> Vec<Arc<Handler>> {
        let mut handlers: Vec<_> = self
            .handlers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        handlers.sort_by(|a, b| a.0.cmp(&b.0));
        handlers.into_iter().map(|(_, h)| h).collect()
    }

    /// Ask for a capability to read `owner`'s public key `name`.
    ///
    /// Returns `None` (logged) for invalid names, private keys and
    /// unregistered keys.
    pub fn request_cross_module_read(
        &self,
        requester: &str,
        owner: &str,
        class: DataClass,
        name: &str,
    ) -> Option<ReadGrant> {
        let (Ok(requester), Ok(owner)) = (ModuleName::new(requester), ModuleName::new(owner))
        else {
            warn!(
                requester,
                owner, name, "Denied cross-module read: invalid module name"
            );
            return None;
        };
        self.shared.registry.grant_read(&requester, &owner, class, name)
    }

    /// Remove every handler of `module` and everything it left behind:
    /// cached data for all entities, registered keys, and event
    /// subscriptions. The cache is emptied once the last handler is gone.
    ///
    /// Returns the number of handlers removed.
    pub fn unregister_module(&self, module: &str) -> usize {
        let Ok(module) = ModuleName::new(module) else {
            return 0;
        };
        let removed = DataClass::ALL
            .iter()
            .filter(|class| self.handlers.remove(&(module.clone(), **class)).is_some())
            .count();

        let cleared = self.shared.cache.clear_all_module_data(&module);
        let keys = self.shared.registry.release_module(&module);
        let subscriptions = self.shared.bus.unsubscribe_owner(module.as_str());
        if self.handlers.is_empty() {
            self.shared.cache.clear();
        }

        info!(
            module = module.as_str(),
            handlers = removed,
            cleared,
            keys,
            subscriptions,
            "Unregistered module"
        );
        removed
    }

    /// Drop every handler and empty the cache. Unsaved data is lost; call
    /// [`DataEngine::shutdown`] first.
    pub fn dispose(&self) {
        let handlers = self.handlers.len();
        self.handlers.clear();
        self.shared.cache.clear();
        info!(handlers, "Data engine disposed");
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Bulk-load every handler's column for the given entities.
    pub async fn begin_session(&self, entities: &[EntityId]) -> BulkLoadReport {
        let mut total = BulkLoadReport::default();
        for handler in self.handlers() {
            let report = handler.load_bulk(entities).await;
            total.loaded = total.loaded.saturating_add(report.loaded);
            total.vetoed = total.vetoed.saturating_add(report.vetoed);
            total.failed = total.failed.saturating_add(report.failed);
        }
        total
    }

    /// Save `entity` through every handler, ignoring the throttle, then
    /// clear each handler whose save did not fail.
    ///
    /// A save suppressed by a pre-save hook counts as done: the hook owns
    /// persistence for that entity, so its cached data is cleared without a
    /// write. Only a failed write keeps the cache for a later retry.
    pub async fn end_session(&self, entity: EntityId) -> SessionEndReport {
        let mut report = SessionEndReport::default();
        for handler in self.handlers() {
            match handler.save_now(entity).await {
                SaveOutcome::Failed => {
                    report.failed = report.failed.saturating_add(1);
                    warn!(
                        entity = %entity,
                        module = handler.module().as_str(),
                        "Session-end save failed; keeping cached data"
                    );
                }
                SaveOutcome::Saved | SaveOutcome::Vetoed | SaveOutcome::Throttled => {
                    handler.clear(entity);
                    report.saved = report.saved.saturating_add(1);
                }
            }
        }
        report
    }

    // =========================================================================
    // Bulk persistence
    // =========================================================================

    /// Save the given entities through every handler in one transaction.
    pub async fn save_all(&self, entities: &[EntityId]) -> BatchOutcome {
        save_batch(entities, &self.handlers()).await
    }

    /// Save every cached entity in one transaction, giving up after the
    /// configured shutdown timeout.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let entities = self.shared.cache.entities();
        info!(
            entities = entities.len(),
            timeout_ms = u64::try_from(self.shutdown_timeout.as_millis()).unwrap_or(u64::MAX),
            "Saving all cached entities before shutdown"
        );
        match tokio::time::timeout(self.shutdown_timeout, self.save_all(&entities)).await {
            Ok(outcome) => ShutdownOutcome::Completed(outcome),
            Err(_) => {
                warn!("Shutdown save timed out; unsaved changes are lost");
                ShutdownOutcome::TimedOut
            }
        }
    }

    /// Start the periodic retention cleanup on the current runtime.
    ///
    /// Returns `None` when cleanup is disabled by `config`.
    pub fn spawn_retention(&self, config: &RetentionConfig) -> Option<JoinHandle<()>> {
        spawn_retention_job(Arc::clone(&self.shared.store), config)
    }
}
