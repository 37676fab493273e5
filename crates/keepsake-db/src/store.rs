//! The storage interface the persistence layer talks to.
//!
//! A [`RowStore`] is bound to one table. It knows nothing about attribute
//! values: columns hold opaque JSON text, and parsing belongs to the caller.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keepsake_types::EntityId;

use crate::error::DbError;
use crate::ident::SqlIdent;

/// One queued column upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnWrite {
    /// Row key.
    pub entity: EntityId,
    /// Target column.
    pub column: SqlIdent,
    /// Serialized JSON object text.
    pub json: String,
}

/// Async access to the per-entity backing table.
///
/// Every method may fail with a transient [`DbError`]; callers in the
/// persistence layer log and degrade instead of propagating into hot paths.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// The table this store is bound to.
    fn table(&self) -> &SqlIdent;

    /// Create the table (primary key `entity_id`, indexed `last_seen`) if absent.
    async fn ensure_table(&self) -> Result<(), DbError>;

    /// Add a JSON text column if absent. Never drops or alters columns.
    async fn ensure_column(&self, column: &SqlIdent) -> Result<(), DbError>;

    /// Read one column without touching `last_seen`.
    ///
    /// `Ok(None)` means there is no row or the column is NULL.
    async fn read_column(
        &self,
        column: &SqlIdent,
        entity: EntityId,
    ) -> Result<Option<String>, DbError>;

    /// Read one column and refresh the row's `last_seen`.
    async fn load_column(
        &self,
        column: &SqlIdent,
        entity: EntityId,
    ) -> Result<Option<String>, DbError>;

    /// Read one column for many entities in a single query and refresh
    /// `last_seen` on every row found. Entities without a row are absent
    /// from the result.
    async fn load_columns(
        &self,
        column: &SqlIdent,
        entities: &[EntityId],
    ) -> Result<HashMap<EntityId, Option<String>>, DbError>;

    /// Insert the row or update the column, refreshing `last_seen`.
    async fn upsert(&self, write: &ColumnWrite) -> Result<(), DbError>;

    /// Apply every upsert in one transaction: all or nothing.
    async fn upsert_all(&self, writes: &[ColumnWrite]) -> Result<(), DbError>;

    /// Delete rows whose `last_seen` is older than `cutoff`; returns the count.
    async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError>;
}
