//! Per-module, per-data-class access point to entity attributes.
//!
//! A [`Handler`] is the only way a module touches its attributes. Reads and
//! writes are synchronous and go straight to the entity cache; persistence
//! (`load`, `save`) lives in [`crate::persist`] and delta merging in
//! [`crate::tracked`].
//!
//! Writes into another module's namespace, writes to invalid or locked keys,
//! and reads of another module's private keys are refused with a warning.
//! They never panic or return an error, since they happen on gameplay hot
//! paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::{DashMap, DashSet};
use keepsake_db::SqlIdent;
use keepsake_events::{EventContext, EventKind};
use keepsake_types::{
    Attribute, DataClass, EntityId, ModuleName, Value, qualify, validate_attribute_name,
};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::Shared;
use crate::error::RegistrationError;
use crate::registry::{KeySpec, ReadGrant};

/// Result of a write through [`Handler::set`] or [`Handler::set_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The value is in the cache.
    Stored,
    /// The caller tried to write into another module's namespace.
    Denied,
    /// The key is locked against writes.
    Locked,
    /// The attribute name violates the naming grammar.
    InvalidName,
    /// The value could not be encoded.
    InvalidValue,
}

/// Options for [`Handler::set_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions<'a> {
    /// Module the caller claims to write as. Anything other than the
    /// handler's own module is denied.
    pub owning_module: Option<&'a str>,
    /// Spawn an asynchronous save of the entity after the write.
    pub save_immediately: bool,
}

impl<'a> WriteOptions<'a> {
    /// No owner claim, no immediate save.
    pub const fn new() -> Self {
        Self {
            owning_module: None,
            save_immediately: false,
        }
    }

    /// Write on behalf of `module`.
    #[must_use]
    pub const fn as_module(mut self, module: &'a str) -> Self {
        self.owning_module = Some(module);
        self
    }

    /// Save the entity right after the write.
    #[must_use]
    pub const fn with_save(mut self) -> Self {
        self.save_immediately = true;
        self
    }
}

/// Declared defaults for a batch of keys, passed to [`Handler::register`].
///
/// ```
/// use keepsake_core::Defaults;
///
/// let defaults = Defaults::new()
///     .tracked("coins", 0_i64)
///     .public("level", 1_i64)
///     .value("title", "novice");
/// assert_eq!(defaults.len(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Defaults {
    entries: Vec<(String, KeySpec)>,
}

impl Defaults {
    /// An empty batch.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// A private, untracked key.
    #[must_use]
    pub fn value(self, name: &str, default: impl Into<Value>) -> Self {
        self.entry(name, default.into(), false, false)
    }

    /// A private key whose numeric changes are merged by delta on save.
    #[must_use]
    pub fn tracked(self, name: &str, default: impl Into<Value>) -> Self {
        self.entry(name, default.into(), true, false)
    }

    /// An untracked key other modules may read.
    #[must_use]
    pub fn public(self, name: &str, default: impl Into<Value>) -> Self {
        self.entry(name, default.into(), false, true)
    }

    /// A key with explicit flags.
    #[must_use]
    pub fn entry(mut self, name: &str, default: Value, tracked: bool, public: bool) -> Self {
        self.entries.push((
            name.to_owned(),
            KeySpec {
                default,
                tracked,
                public,
            },
        ));
        self
    }

    /// Number of declared keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are declared.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<BTreeMap<String, Value>> for Defaults {
    fn from(map: BTreeMap<String, Value>) -> Self {
        map.into_iter()
            .fold(Self::new(), |d, (name, value)| d.value(&name, value))
    }
}

/// Attribute access for one module in one data-class.
///
/// Created by [`crate::DataEngine::handler`]; always shared as `Arc<Handler>`.
pub struct Handler {
    pub(crate) module: ModuleName,
    pub(crate) class: DataClass,
    pub(crate) column: SqlIdent,
    /// `module:`, the prefix of every key this handler owns.
    pub(crate) prefix: String,
    pub(crate) shared: Arc<Shared>,
    keys: ArcSwap<HashMap<String, KeySpec>>,
    locked: DashSet<String>,
    /// DB value of each tracked attribute as of the last load or save.
    pub(crate) originals: DashMap<(EntityId, String), Value>,
    /// Time of the last save per entity, for throttling.
    pub(crate) last_saved: DashMap<EntityId, Instant>,
    pub(crate) schema_ready: OnceCell<()>,
}

impl core::fmt::Debug for Handler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handler")
            .field("module", &self.module)
            .field("class", &self.class)
            .field("column", &self.column.as_str())
            .field("keys", &self.keys.load().len())
            .finish_non_exhaustive()
    }
}

impl Handler {
    pub(crate) fn new(
        module: ModuleName,
        class: DataClass,
        shared: Arc<Shared>,
    ) -> Result<Self, RegistrationError> {
        let column = SqlIdent::column_for(&module, class)?;
        let prefix = module.key_prefix();
        Ok(Self {
            module,
            class,
            column,
            prefix,
            shared,
            keys: ArcSwap::from_pointee(HashMap::new()),
            locked: DashSet::new(),
            originals: DashMap::new(),
            last_saved: DashMap::new(),
            schema_ready: OnceCell::new(),
        })
    }

    /// Owning module.
    pub const fn module(&self) -> &ModuleName {
        &self.module
    }

    /// Data-class this handler serves.
    pub const fn class(&self) -> DataClass {
        self.class
    }

    /// Backing column (`module.class`).
    pub const fn column(&self) -> &SqlIdent {
        &self.column
    }

    pub(crate) fn qualified(&self, name: &str) -> String {
        qualify(self.module.as_str(), name)
    }

    pub(crate) fn event(&self, kind: EventKind, entity: EntityId) -> EventContext {
        EventContext::new(kind)
            .for_entity(entity)
            .for_handler(self.module.as_str(), self.class)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register defaults and flags for a batch of keys.
    ///
    /// Every name is validated before anything is recorded, so a bad batch
    /// leaves no trace.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::InvalidName`] for a name outside the
    /// grammar and [`RegistrationError::DuplicateKey`] for a name declared
    /// twice in the batch or already registered.
    pub fn register(&self, defaults: Defaults) -> Result<(), RegistrationError> {
        let Defaults { entries } = defaults;
        let current = self.keys.load();
        let mut seen = HashSet::with_capacity(entries.len());
        for (name, _) in &entries {
            validate_attribute_name(name)?;
            if !seen.insert(name.as_str()) || current.contains_key(name) {
                return Err(RegistrationError::DuplicateKey {
                    module: self.module.to_string(),
                    name: name.clone(),
                    class: self.class,
                });
            }
        }

        self.shared
            .registry
            .claim_all(self.class, &self.module, &entries)?;
        self.keys.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.extend(entries.iter().cloned());
            next
        });

        info!(
            module = self.module.as_str(),
            class = %self.class,
            count = entries.len(),
            tracked = entries.iter().filter(|(_, s)| s.tracked).count(),
            "Registered attribute keys"
        );
        Ok(())
    }

    /// Registered spec of one of this handler's keys.
    pub fn key_spec(&self, name: &str) -> Option<KeySpec> {
        self.keys.load().get(name).cloned()
    }

    /// Whether `name` is registered as tracked.
    pub fn is_tracked(&self, name: &str) -> bool {
        self.keys.load().get(name).is_some_and(|s| s.tracked)
    }

    /// Names and defaults of every tracked key.
    pub(crate) fn tracked_keys(&self) -> Vec<(String, Value)> {
        self.keys
            .load()
            .iter()
            .filter(|(_, spec)| spec.tracked)
            .map(|(name, spec)| (name.clone(), spec.default.clone()))
            .collect()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read an attribute, falling back to its registered default.
    ///
    /// The value is coerced to `T` and the coerced form written back to the
    /// cache, except that a stored number is never rewritten by a read.
    /// Returns `None` when the key has neither a value nor a default, or
    /// when coercion fails (logged).
    pub fn get<T: Attribute>(&self, entity: EntityId, name: &str) -> Option<T> {
        let key = self.qualified(name);
        let cached = self
            .shared
            .cache
            .table(entity, self.class)
            .and_then(|t| t.get(&key));
        let from_cache = cached.is_some();
        let raw = match cached {
            Some(value) => value,
            None => self.keys.load().get(name)?.default.clone(),
        };

        let typed = match T::from_value(&raw) {
            Ok(typed) => typed,
            Err(e) => {
                warn!(
                    entity = %entity,
                    module = self.module.as_str(),
                    name,
                    expected = T::TYPE_NAME,
                    error = %e,
                    "Attribute coercion failed"
                );
                return None;
            }
        };

        if let Ok(coerced) = typed.to_value() {
            if !from_cache || (coerced != raw && !raw.is_numeric()) {
                self.shared
                    .cache
                    .get_or_create_table(entity, self.class)
                    .insert(key, coerced);
            }
        }
        Some(typed)
    }

    /// Read a public attribute owned by `owning_module`.
    ///
    /// Reading one's own module behaves like [`Handler::get`]. For another
    /// module the key must be registered public; otherwise the read is
    /// denied with a warning. Foreign values are never re-cached.
    pub fn get_from<T: Attribute>(
        &self,
        entity: EntityId,
        name: &str,
        owning_module: &str,
    ) -> Option<T> {
        if owning_module == self.module.as_str() {
            return self.get(entity, name);
        }
        let owner = match ModuleName::new(owning_module) {
            Ok(owner) => owner,
            Err(e) => {
                warn!(
                    module = self.module.as_str(),
                    owning_module,
                    error = %e,
                    "Denied cross-module read: invalid owner name"
                );
                return None;
            }
        };
        let grant = self
            .shared
            .registry
            .grant_read(&self.module, &owner, self.class, name)?;
        self.read_with(entity, &grant)
    }

    /// Read through a previously issued [`ReadGrant`].
    ///
    /// The grant must have been issued to this handler's module for this
    /// handler's data-class.
    pub fn read_with<T: Attribute>(&self, entity: EntityId, grant: &ReadGrant) -> Option<T> {
        if grant.requester() != &self.module || grant.class() != self.class {
            warn!(
                module = self.module.as_str(),
                class = %self.class,
                requester = grant.requester().as_str(),
                "Denied read through a grant issued to another handler"
            );
            return None;
        }

        let owner = grant.owner().as_str();
        let raw = self
            .shared
            .cache
            .table(entity, self.class)
            .and_then(|t| t.get(&qualify(owner, grant.name())))
            .or_else(|| {
                self.shared
                    .registry
                    .lookup(self.class, owner, grant.name())
                    .map(|spec| spec.default)
            })?;

        T::from_value(&raw)
            .map_err(|e| {
                warn!(
                    entity = %entity,
                    module = self.module.as_str(),
                    owner,
                    name = grant.name(),
                    error = %e,
                    "Cross-module attribute coercion failed"
                );
            })
            .ok()
    }

    /// All of this handler's cached attributes for `entity`, unqualified.
    pub fn snapshot(&self, entity: EntityId) -> BTreeMap<String, Value> {
        self.shared
            .cache
            .table(entity, self.class)
            .map(|t| t.entries_with_prefix(&self.prefix))
            .unwrap_or_default()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write an attribute into the cache as this handler's module.
    #[allow(clippy::needless_pass_by_value)]
    pub fn set<T: Attribute>(&self, entity: EntityId, name: &str, value: T) -> SetOutcome {
        self.store_value(entity, name, &value, None)
    }

    /// Write an attribute with explicit options.
    ///
    /// With `save_immediately`, an asynchronous save is spawned on the
    /// current tokio runtime once the value is cached; outside a runtime
    /// the save is skipped with a warning.
    #[allow(clippy::needless_pass_by_value)]
    pub fn set_with<T: Attribute>(
        self: &Arc<Self>,
        entity: EntityId,
        name: &str,
        value: T,
        options: WriteOptions<'_>,
    ) -> SetOutcome {
        let outcome = self.store_value(entity, name, &value, options.owning_module);
        if outcome == SetOutcome::Stored && options.save_immediately {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let handler = Arc::clone(self);
                    runtime.spawn(async move {
                        handler.save(entity).await;
                    });
                }
                Err(_) => warn!(
                    entity = %entity,
                    module = self.module.as_str(),
                    "No async runtime; immediate save skipped"
                ),
            }
        }
        outcome
    }

    fn store_value<T: Attribute>(
        &self,
        entity: EntityId,
        name: &str,
        value: &T,
        owning_module: Option<&str>,
    ) -> SetOutcome {
        if let Some(owner) = owning_module {
            if owner != self.module.as_str() {
                warn!(
                    entity = %entity,
                    module = self.module.as_str(),
                    owning_module = owner,
                    name,
                    "Denied cross-module write"
                );
                return SetOutcome::Denied;
            }
        }
        if let Err(e) = validate_attribute_name(name) {
            warn!(module = self.module.as_str(), error = %e, "Rejected write to invalid key");
            return SetOutcome::InvalidName;
        }
        if self.locked.contains(name) {
            warn!(
                entity = %entity,
                module = self.module.as_str(),
                name,
                "Rejected write to locked key"
            );
            return SetOutcome::Locked;
        }
        let encoded = match value.to_value() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(
                    entity = %entity,
                    module = self.module.as_str(),
                    name,
                    error = %e,
                    "Rejected write of unencodable value"
                );
                return SetOutcome::InvalidValue;
            }
        };

        self.shared
            .cache
            .get_or_create_table(entity, self.class)
            .insert(self.qualified(name), encoded);
        SetOutcome::Stored
    }

    /// Remove one attribute from the cache; the next save drops it from the
    /// backing column.
    pub fn remove(&self, entity: EntityId, name: &str) -> Option<Value> {
        self.shared
            .cache
            .table(entity, self.class)?
            .remove(&self.qualified(name))
    }

    /// Refuse writes to `name` until [`Handler::unlock_key`]. Returns
    /// `false` if it was already locked.
    pub fn lock_key(&self, name: &str) -> bool {
        self.locked.insert(name.to_owned())
    }

    /// Allow writes to `name` again. Returns `false` if it was not locked.
    pub fn unlock_key(&self, name: &str) -> bool {
        self.locked.remove(name).is_some()
    }

    /// Whether writes to `name` are refused.
    pub fn is_locked(&self, name: &str) -> bool {
        self.locked.contains(name)
    }

    /// Drop this handler's cached data, tracked originals and throttle state
    /// for `entity`. Call after the session's final save.
    pub fn clear(&self, entity: EntityId) -> usize {
        let removed = self
            .shared
            .cache
            .clear_module_class(entity, self.class, &self.module);
        self.originals.retain(|(e, _), _| *e != entity);
        self.last_saved.remove(&entity);
        debug!(
            entity = %entity,
            module = self.module.as_str(),
            class = %self.class,
            removed,
            "Cleared handler data"
        );
        removed
    }
}
