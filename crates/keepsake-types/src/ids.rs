//! Entity identifiers and cache keys.
//!
//! Entities are owned by an external session manager; this workspace only
//! ever refers to them by a stable 64-bit id. A [`CacheKey`] pairs that id
//! with the [`DataClass`] namespace so lookups never build composite strings.

use serde::{Deserialize, Serialize};

/// Stable 64-bit identifier of an external entity (e.g. a connected player).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Wrap a raw identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Return the inner `u64` value.
    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// Reinterpret the id as a signed 64-bit integer for `BIGINT` columns.
    ///
    /// The mapping is a bit-for-bit reinterpretation, so ids above
    /// `i64::MAX` are stored as negative numbers and restored exactly.
    pub const fn to_storage(self) -> i64 {
        i64::from_ne_bytes(self.0.to_ne_bytes())
    }

    /// Inverse of [`EntityId::to_storage`].
    pub const fn from_storage(raw: i64) -> Self {
        Self(u64::from_ne_bytes(raw.to_ne_bytes()))
    }
}

impl core::fmt::Display for EntityId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<EntityId> for u64 {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

/// One of the two attribute namespaces every entity carries.
///
/// Each data-class has its own backing column per module and its own set of
/// registered defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    /// Gameplay state: balances, counters, inventories.
    Storage,
    /// Per-entity preferences.
    Settings,
}

impl DataClass {
    /// Every data-class, in declaration order.
    pub const ALL: [Self; 2] = [Self::Storage, Self::Settings];

    /// Lowercase name used in column names and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Settings => "settings",
        }
    }
}

impl core::fmt::Display for DataClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite cache key: one attribute table per (entity, data-class).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    /// Owning entity.
    pub entity: EntityId,
    /// Attribute namespace.
    pub class: DataClass,
}

impl CacheKey {
    /// Build a key for `entity` in `class`.
    pub const fn new(entity: EntityId, class: DataClass) -> Self {
        Self { entity, class }
    }
}
