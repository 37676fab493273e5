//! Process-wide entity cache.
//!
//! Two-level concurrent map: `(entity, data-class)` to an [`AttributeTable`],
//! which maps fully-qualified `module:attribute` keys to values. Both levels
//! are sharded [`DashMap`]s, so independent keys never contend and no
//! operation here awaits I/O.
//!
//! Tables are created on first load or write and removed only by explicit
//! clearing.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use keepsake_types::{CacheKey, DataClass, EntityId, ModuleName, Value};

/// Attributes of one entity in one data-class, keyed `module:attribute`.
#[derive(Debug, Default)]
pub struct AttributeTable {
    entries: DashMap<String, Value>,
}

impl AttributeTable {
    /// Clone out the value stored under a qualified key.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    /// Store a value; last write wins. Returns the previous value.
    pub fn insert(&self, key: String, value: Value) -> Option<Value> {
        self.entries.insert(key, value)
    }

    /// Remove a qualified key.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    /// Whether a qualified key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Every entry whose key starts with `prefix`, with the prefix stripped,
    /// ordered by attribute name.
    pub fn entries_with_prefix(&self, prefix: &str) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry
                    .key()
                    .strip_prefix(prefix)
                    .map(|name| (name.to_owned(), entry.value().clone()))
            })
            .collect()
    }

    /// Drop every key starting with `prefix`; returns how many were removed.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        before.saturating_sub(self.entries.len())
    }

    /// Number of attributes across all modules.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no attributes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache of attribute tables for every live entity.
#[derive(Debug, Default)]
pub struct EntityCache {
    tables: DashMap<CacheKey, Arc<AttributeTable>>,
}

impl EntityCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The table for `(entity, class)`, created empty if absent.
    pub fn get_or_create_table(&self, entity: EntityId, class: DataClass) -> Arc<AttributeTable> {
        let table = self
            .tables
            .entry(CacheKey::new(entity, class))
            .or_default();
        Arc::clone(table.value())
    }

    /// The table for `(entity, class)` if one exists.
    pub fn table(&self, entity: EntityId, class: DataClass) -> Option<Arc<AttributeTable>> {
        self.tables
            .get(&CacheKey::new(entity, class))
            .map(|t| Arc::clone(t.value()))
    }

    /// Remove `module`'s keys for `entity` in one data-class. The table is
    /// evicted once empty. Returns how many keys were removed.
    pub fn clear_module_class(
        &self,
        entity: EntityId,
        class: DataClass,
        module: &ModuleName,
    ) -> usize {
        let key = CacheKey::new(entity, class);
        let Some(table) = self.table(entity, class) else {
            return 0;
        };
        let removed = table.remove_prefix(&module.key_prefix());
        self.tables.remove_if(&key, |_, t| t.is_empty());
        removed
    }

    /// Remove `module`'s keys for `entity` in every data-class. Other
    /// modules' keys are untouched.
    pub fn clear_module_data(&self, entity: EntityId, module: &ModuleName) -> usize {
        DataClass::ALL
            .iter()
            .map(|class| self.clear_module_class(entity, *class, module))
            .fold(0, usize::saturating_add)
    }

    /// Remove `module`'s keys for every entity. Returns how many keys were
    /// removed.
    pub fn clear_all_module_data(&self, module: &ModuleName) -> usize {
        let prefix = module.key_prefix();
        let removed = self
            .tables
            .iter()
            .map(|entry| entry.value().remove_prefix(&prefix))
            .fold(0, usize::saturating_add);
        self.tables.retain(|_, t| !t.is_empty());
        removed
    }

    /// Every entity with at least one table, ascending.
    pub fn entities(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.tables.iter().map(|e| e.key().entity).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Number of `(entity, data-class)` tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether the cache holds no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Drop every table.
    pub fn clear(&self) {
        self.tables.clear();
    }
}
