//! In-process [`RowStore`].
//!
//! Mirrors the `PostgreSQL` store's semantics closely enough to run the
//! persistence layer without a database: the table and every column must be
//! ensured before use, batch upserts are all-or-nothing, and `last_seen` is
//! refreshed on load and save. A few extra hooks let tests play the part of
//! an external writer or an unreachable database.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keepsake_types::EntityId;

use crate::error::DbError;
use crate::ident::SqlIdent;
use crate::store::{ColumnWrite, RowStore};

#[derive(Debug)]
struct Row {
    columns: HashMap<String, String>,
    last_seen: DateTime<Utc>,
}

impl Row {
    fn new() -> Self {
        Self {
            columns: HashMap::new(),
            last_seen: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    table_ready: bool,
    columns: HashSet<String>,
    rows: BTreeMap<EntityId, Row>,
    /// Remaining operations that fail before the store recovers.
    failures_remaining: u32,
    /// Column upserts applied so far.
    writes: u64,
}

impl State {
    fn check(&mut self) -> Result<(), DbError> {
        if self.failures_remaining > 0 {
            self.failures_remaining = self.failures_remaining.saturating_sub(1);
            return Err(DbError::Unavailable("injected failure".to_owned()));
        }
        if !self.table_ready {
            return Err(DbError::Unavailable("table does not exist".to_owned()));
        }
        Ok(())
    }

    fn check_column(&self, column: &SqlIdent) -> Result<(), DbError> {
        if self.columns.contains(column.as_str()) {
            Ok(())
        } else {
            Err(DbError::UnknownColumn(column.as_str().to_owned()))
        }
    }

    fn apply(&mut self, write: &ColumnWrite) {
        let row = self.rows.entry(write.entity).or_insert_with(Row::new);
        row.columns
            .insert(write.column.as_str().to_owned(), write.json.clone());
        row.last_seen = Utc::now();
        self.writes = self.writes.saturating_add(1);
    }
}

/// Thread-safe in-memory backing table.
#[derive(Debug)]
pub struct MemoryRowStore {
    table: SqlIdent,
    state: Mutex<State>,
}

impl MemoryRowStore {
    /// Create an empty store for `table`. The table still has to be ensured.
    pub fn new(table: SqlIdent) -> Self {
        Self {
            table,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, DbError> {
        self.state
            .lock()
            .map_err(|_| DbError::Unavailable("memory store lock poisoned".to_owned()))
    }

    /// Make the next `count` operations fail as if the database were down.
    pub fn fail_next(&self, count: u32) {
        if let Ok(mut state) = self.state() {
            state.failures_remaining = count;
        }
    }

    /// Number of column upserts applied so far.
    pub fn write_count(&self) -> u64 {
        self.state().map(|s| s.writes).unwrap_or_default()
    }

    /// Number of rows in the table.
    pub fn row_count(&self) -> usize {
        self.state().map(|s| s.rows.len()).unwrap_or_default()
    }

    /// Whether a row exists for `entity`.
    pub fn contains(&self, entity: EntityId) -> bool {
        self.state()
            .map(|s| s.rows.contains_key(&entity))
            .unwrap_or_default()
    }

    /// Raw column text, bypassing failure injection and `last_seen`.
    pub fn column_value(&self, entity: EntityId, column: &str) -> Option<String> {
        self.state()
            .ok()
            .and_then(|s| s.rows.get(&entity)?.columns.get(column).cloned())
    }

    /// Write raw column text the way an external process would: creates the
    /// table, column and row as needed and does not count as a write.
    pub fn set_column(&self, entity: EntityId, column: &str, json: &str) {
        if let Ok(mut state) = self.state() {
            state.table_ready = true;
            state.columns.insert(column.to_owned());
            state
                .rows
                .entry(entity)
                .or_insert_with(Row::new)
                .columns
                .insert(column.to_owned(), json.to_owned());
        }
    }

    /// Override a row's `last_seen`.
    pub fn set_last_seen(&self, entity: EntityId, at: DateTime<Utc>) {
        if let Ok(mut state) = self.state() {
            if let Some(row) = state.rows.get_mut(&entity) {
                row.last_seen = at;
            }
        }
    }

    /// A row's `last_seen`, if the row exists.
    pub fn last_seen(&self, entity: EntityId) -> Option<DateTime<Utc>> {
        self.state().ok()?.rows.get(&entity).map(|row| row.last_seen)
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    fn table(&self) -> &SqlIdent {
        &self.table
    }

    async fn ensure_table(&self) -> Result<(), DbError> {
        let mut state = self.state()?;
        if state.failures_remaining > 0 {
            state.failures_remaining = state.failures_remaining.saturating_sub(1);
            return Err(DbError::Unavailable("injected failure".to_owned()));
        }
        state.table_ready = true;
        Ok(())
    }

    async fn ensure_column(&self, column: &SqlIdent) -> Result<(), DbError> {
        let mut state = self.state()?;
        state.check()?;
        state.columns.insert(column.as_str().to_owned());
        Ok(())
    }

    async fn read_column(
        &self,
        column: &SqlIdent,
        entity: EntityId,
    ) -> Result<Option<String>, DbError> {
        let mut state = self.state()?;
        state.check()?;
        state.check_column(column)?;
        Ok(state
            .rows
            .get(&entity)
            .and_then(|row| row.columns.get(column.as_str()).cloned()))
    }

    async fn load_column(
        &self,
        column: &SqlIdent,
        entity: EntityId,
    ) -> Result<Option<String>, DbError> {
        let mut state = self.state()?;
        state.check()?;
        state.check_column(column)?;
        Ok(state.rows.get_mut(&entity).and_then(|row| {
            row.last_seen = Utc::now();
            row.columns.get(column.as_str()).cloned()
        }))
    }

    async fn load_columns(
        &self,
        column: &SqlIdent,
        entities: &[EntityId],
    ) -> Result<HashMap<EntityId, Option<String>>, DbError> {
        let mut state = self.state()?;
        state.check()?;
        state.check_column(column)?;
        let now = Utc::now();
        let mut found = HashMap::with_capacity(entities.len());
        for entity in entities {
            if let Some(row) = state.rows.get_mut(entity) {
                row.last_seen = now;
                found.insert(*entity, row.columns.get(column.as_str()).cloned());
            }
        }
        Ok(found)
    }

    async fn upsert(&self, write: &ColumnWrite) -> Result<(), DbError> {
        let mut state = self.state()?;
        state.check()?;
        state.check_column(&write.column)?;
        state.apply(write);
        Ok(())
    }

    async fn upsert_all(&self, writes: &[ColumnWrite]) -> Result<(), DbError> {
        let mut state = self.state()?;
        state.check()?;
        // Validate everything before applying anything.
        for write in writes {
            state.check_column(&write.column)?;
        }
        for write in writes {
            state.apply(write);
        }
        Ok(())
    }

    async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
        let mut state = self.state()?;
        state.check()?;
        let before = state.rows.len();
        state.rows.retain(|_, row| row.last_seen >= cutoff);
        let removed = before.saturating_sub(state.rows.len());
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn ident(name: &str) -> SqlIdent {
        SqlIdent::new(name).unwrap()
    }

    #[tokio::test]
    async fn operations_require_table_and_column() {
        let store = MemoryRowStore::new(ident("players"));
        let column = ident("economy.storage");
        let entity = EntityId::new(1);

        assert!(store.read_column(&column, entity).await.is_err());
        assert!(store.ensure_table().await.is_ok());
        assert!(matches!(
            store.read_column(&column, entity).await,
            Err(DbError::UnknownColumn(_))
        ));
        assert!(store.ensure_column(&column).await.is_ok());
        assert!(matches!(store.read_column(&column, entity).await, Ok(None)));
    }

    #[tokio::test]
    async fn batch_upsert_is_all_or_nothing() {
        let store = MemoryRowStore::new(ident("players"));
        let good = ident("economy.storage");
        store.ensure_table().await.ok();
        store.ensure_column(&good).await.ok();

        let writes = vec![
            ColumnWrite {
                entity: EntityId::new(1),
                column: good.clone(),
                json: "{}".to_owned(),
            },
            ColumnWrite {
                entity: EntityId::new(2),
                column: ident("missing.storage"),
                json: "{}".to_owned(),
            },
        ];
        assert!(store.upsert_all(&writes).await.is_err());
        assert_eq!(store.row_count(), 0);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn injected_failures_recover() {
        let store = MemoryRowStore::new(ident("players"));
        store.ensure_table().await.ok();
        store.fail_next(1);
        assert!(store.delete_stale(Utc::now()).await.is_err());
        assert!(store.delete_stale(Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn delete_stale_respects_cutoff() {
        let store = MemoryRowStore::new(ident("players"));
        store.set_column(EntityId::new(1), "m.storage", "{}");
        store.set_column(EntityId::new(2), "m.storage", "{}");
        store.set_last_seen(EntityId::new(1), Utc::now() - Duration::days(40));

        let removed = store.delete_stale(Utc::now() - Duration::days(30)).await;
        assert_eq!(removed.ok(), Some(1));
        assert!(!store.contains(EntityId::new(1)));
        assert!(store.contains(EntityId::new(2)));
    }
}
