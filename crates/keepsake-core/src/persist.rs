//! Loading and saving handler columns.
//!
//! Each handler owns one JSON text column (`module.class`) in the shared
//! per-entity table. Loads parse that column into the entity cache; saves
//! serialize the handler's cached attributes back into it.
//!
//! Every operation is wrapped in `Load` or `Save` pre/post hooks on the
//! event bus. I/O failures are logged and reported through outcome enums;
//! the cache is never modified by a failed load.
//!
//! # Schema
//!
//! The table and the handler's column are created on first use
//! (`CREATE TABLE IF NOT EXISTS`, `ADD COLUMN IF NOT EXISTS`). A failed
//! bootstrap is retried on the next operation.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use keepsake_db::{ColumnWrite, DbError};
use keepsake_events::EventKind;
use keepsake_types::{EntityId, Value, ValueError, validate_attribute_name};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::handler::Handler;
use crate::tracked::SyncReport;

/// Result of [`Handler::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The column was read into the cache. A missing row loads zero
    /// attributes.
    Loaded {
        /// Number of attributes read from the column.
        attributes: usize,
    },
    /// A pre-load hook suppressed the load.
    Vetoed,
    /// The database could not be reached; the cache is unchanged.
    Failed,
}

/// Tally of a [`Handler::load_bulk`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkLoadReport {
    /// Entities whose column was read.
    pub loaded: usize,
    /// Entities whose load a pre-load hook suppressed.
    pub vetoed: usize,
    /// Entities that could not be loaded.
    pub failed: usize,
}

/// Result of [`Handler::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The column was written.
    Saved,
    /// The entity was saved too recently; nothing was written.
    Throttled,
    /// A pre-save hook suppressed the save.
    Vetoed,
    /// The write failed; the cache still holds the unsaved values.
    Failed,
}

/// Result of [`save_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every queued write was committed.
    Committed {
        /// Columns written.
        written: usize,
        /// `(handler, entity)` pairs a pre-save hook suppressed.
        skipped: usize,
    },
    /// Nothing was written.
    RolledBack {
        /// Why the batch was abandoned.
        reason: String,
    },
}

/// An attribute that could not be encoded.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EncodeFailure {
    name: String,
    source: ValueError,
}

/// Parse a handler column into unqualified attribute values.
///
/// A malformed blob yields an empty map; a bad key is skipped. Both are
/// logged and never affect the rest of the column.
pub(crate) fn parse_column(
    handler: &Handler,
    entity: EntityId,
    json: Option<&str>,
) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    let Some(text) = json.map(str::trim).filter(|t| !t.is_empty()) else {
        return out;
    };
    let object = match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(serde_json::Value::Null) => return out,
        Ok(other) => {
            let found = Value::from_json(other).kind();
            warn!(
                entity = %entity,
                column = handler.column.as_str(),
                found,
                "Backing column is not a JSON object; ignoring it"
            );
            return out;
        }
        Err(e) => {
            warn!(
                entity = %entity,
                column = handler.column.as_str(),
                error = %e,
                "Malformed JSON in backing column; ignoring it"
            );
            return out;
        }
    };

    for (name, json) in object {
        if let Err(e) = validate_attribute_name(&name) {
            warn!(
                entity = %entity,
                column = handler.column.as_str(),
                error = %e,
                "Skipping stored attribute with invalid name"
            );
            continue;
        }
        out.insert(name, Value::from_json(json));
    }
    out
}

impl Handler {
    /// Create the table and this handler's column once.
    pub(crate) async fn ensure_schema(&self) -> Result<(), DbError> {
        self.schema_ready
            .get_or_try_init(|| async {
                self.shared.store.ensure_table().await?;
                self.shared.store.ensure_column(&self.column).await
            })
            .await?;
        Ok(())
    }

    /// Serialize this handler's cached attributes for `entity`, dropping
    /// (with a warning) any attribute that cannot be encoded.
    pub(crate) fn encode_column(&self, entity: EntityId) -> String {
        let values = self.snapshot(entity);
        let mut object = serde_json::Map::with_capacity(values.len());
        for (name, value) in values {
            match value.to_json() {
                Ok(json) => {
                    object.insert(name, json);
                }
                Err(e) => warn!(
                    entity = %entity,
                    module = self.module.as_str(),
                    name = name.as_str(),
                    error = %e,
                    "Dropping attribute that cannot be encoded"
                ),
            }
        }
        serde_json::Value::Object(object).to_string()
    }

    /// Serialize this handler's cached attributes for `entity`, failing on
    /// the first attribute that cannot be encoded.
    pub(crate) fn encode_column_strict(&self, entity: EntityId) -> Result<String, EncodeFailure> {
        let values = self.snapshot(entity);
        let mut object = serde_json::Map::with_capacity(values.len());
        for (name, value) in values {
            match value.to_json() {
                Ok(json) => {
                    object.insert(name, json);
                }
                Err(source) => return Err(EncodeFailure { name, source }),
            }
        }
        Ok(serde_json::Value::Object(object).to_string())
    }

    /// Put parsed column values into the cache and capture tracked
    /// originals. Returns the number of attributes loaded.
    fn apply_loaded(&self, entity: EntityId, json: Option<&str>) -> usize {
        let values = parse_column(self, entity, json);
        let table = self.shared.cache.get_or_create_table(entity, self.class);
        for (name, value) in &values {
            table.insert(self.qualified(name), value.clone());
        }
        self.capture_originals(entity, &values);
        values.len()
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Load this handler's column for `entity` into the cache.
    ///
    /// Refreshes the row's `last_seen`. A missing row is not an error.
    pub async fn load(&self, entity: EntityId) -> LoadOutcome {
        let ctx = self.event(EventKind::Load, entity);
        if !self.shared.bus.pre(&ctx).proceed {
            debug!(entity = %entity, module = self.module.as_str(), "Load vetoed by hook");
            return LoadOutcome::Vetoed;
        }
        let outcome = self.load_unguarded(entity).await;
        if matches!(outcome, LoadOutcome::Loaded { .. }) {
            self.shared.bus.post(&ctx);
        }
        outcome
    }

    async fn load_unguarded(&self, entity: EntityId) -> LoadOutcome {
        if let Err(e) = self.ensure_schema().await {
            warn!(
                entity = %entity,
                column = self.column.as_str(),
                error = %e,
                "Schema bootstrap failed; load skipped"
            );
            return LoadOutcome::Failed;
        }
        match self.shared.store.load_column(&self.column, entity).await {
            Ok(json) => LoadOutcome::Loaded {
                attributes: self.apply_loaded(entity, json.as_deref()),
            },
            Err(e) => {
                warn!(
                    entity = %entity,
                    column = self.column.as_str(),
                    error = %e,
                    "Load failed"
                );
                LoadOutcome::Failed
            }
        }
    }

    /// Load this handler's column for many entities with one query.
    ///
    /// Repeated ids are loaded once. If the query fails, each entity is
    /// loaded on its own.
    pub async fn load_bulk(&self, entities: &[EntityId]) -> BulkLoadReport {
        let mut report = BulkLoadReport::default();
        let entities = distinct(entities);
        let mut allowed = Vec::with_capacity(entities.len());
        for entity in entities {
            if self.shared.bus.pre(&self.event(EventKind::Load, entity)).proceed {
                allowed.push(entity);
            } else {
                report.vetoed = report.vetoed.saturating_add(1);
            }
        }
        if allowed.is_empty() {
            return report;
        }

        let rows = match self.ensure_schema().await {
            Ok(()) => self.shared.store.load_columns(&self.column, &allowed).await,
            Err(e) => Err(e),
        };

        match rows {
            Ok(mut rows) => {
                for entity in allowed {
                    let json = rows.remove(&entity).flatten();
                    self.apply_loaded(entity, json.as_deref());
                    self.shared.bus.post(&self.event(EventKind::Load, entity));
                    report.loaded = report.loaded.saturating_add(1);
                }
            }
            Err(e) => {
                warn!(
                    column = self.column.as_str(),
                    count = allowed.len(),
                    error = %e,
                    "Bulk load failed; falling back to single loads"
                );
                for entity in allowed {
                    if matches!(
                        self.load_unguarded(entity).await,
                        LoadOutcome::Loaded { .. }
                    ) {
                        self.shared.bus.post(&self.event(EventKind::Load, entity));
                        report.loaded = report.loaded.saturating_add(1);
                    } else {
                        report.failed = report.failed.saturating_add(1);
                    }
                }
            }
        }

        debug!(
            column = self.column.as_str(),
            loaded = report.loaded,
            vetoed = report.vetoed,
            failed = report.failed,
            "Bulk load finished"
        );
        report
    }

    // =========================================================================
    // Save
    // =========================================================================

    /// Save `entity` unless it was saved less than the throttle window ago.
    pub async fn save(&self, entity: EntityId) -> SaveOutcome {
        if !self.claim_save_slot(entity) {
            debug!(entity = %entity, module = self.module.as_str(), "Save throttled");
            return SaveOutcome::Throttled;
        }
        let outcome = self.save_now(entity).await;
        if outcome == SaveOutcome::Failed {
            // Let the retry through.
            self.last_saved.remove(&entity);
        }
        outcome
    }

    /// Record a save attempt if the throttle window has passed.
    fn claim_save_slot(&self, entity: EntityId) -> bool {
        let window = self.shared.save_throttle;
        if window.is_zero() {
            return true;
        }
        let now = Instant::now();
        match self.last_saved.entry(entity) {
            Entry::Occupied(mut slot) => {
                if now.duration_since(*slot.get()) < window {
                    return false;
                }
                slot.insert(now);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    /// Save `entity` now, ignoring the throttle.
    ///
    /// Runs the pre-save hook, reconciles tracked attributes, and upserts
    /// the column. Attributes that cannot be encoded are dropped with a
    /// warning.
    pub async fn save_now(&self, entity: EntityId) -> SaveOutcome {
        let ctx = self.event(EventKind::Save, entity);
        if !self.shared.bus.pre(&ctx).proceed {
            debug!(entity = %entity, module = self.module.as_str(), "Save vetoed by hook");
            return SaveOutcome::Vetoed;
        }
        if let Err(e) = self.ensure_schema().await {
            warn!(
                entity = %entity,
                column = self.column.as_str(),
                error = %e,
                "Schema bootstrap failed; save skipped"
            );
            return SaveOutcome::Failed;
        }

        let sync = self.synchronize_tracked(entity).await;
        let write = ColumnWrite {
            entity,
            column: self.column.clone(),
            json: self.encode_column(entity),
        };

        match self.shared.store.upsert(&write).await {
            Ok(()) => {
                self.last_saved.insert(entity, Instant::now());
                self.shared.bus.post(&ctx);
                debug!(entity = %entity, column = self.column.as_str(), "Saved");
                SaveOutcome::Saved
            }
            Err(e) => {
                self.restore_baseline(entity, &sync);
                warn!(
                    entity = %entity,
                    column = self.column.as_str(),
                    error = %e,
                    "Save failed; values kept in cache"
                );
                SaveOutcome::Failed
            }
        }
    }
}

/// Save every `(handler, entity)` pair in one transaction.
///
/// Pairs are visited in handler order, then entity order. A pre-save hook
/// returning `Handled` or `Stop` skips its pair. Attributes are encoded
/// strictly: one value that cannot be encoded rolls the whole batch back,
/// as does any database error. Post-save hooks run after the commit.
///
/// All handlers must belong to the same engine. Repeated entity ids are
/// saved once. The batch ignores the save throttle.
pub async fn save_batch(entities: &[EntityId], handlers: &[Arc<Handler>]) -> BatchOutcome {
    let Some(first) = handlers.first() else {
        return BatchOutcome::Committed {
            written: 0,
            skipped: 0,
        };
    };
    let store = Arc::clone(&first.shared.store);
    let entities = distinct(entities);

    let mut writes = Vec::new();
    let mut pending: Vec<(&Handler, EntityId, SyncReport)> = Vec::new();
    let mut skipped = 0_usize;

    for handler in handlers.iter().map(Arc::as_ref) {
        if let Err(e) = handler.ensure_schema().await {
            let reason = format!("schema bootstrap for {} failed: {e}", handler.column);
            return roll_back(&pending, reason);
        }
        for &entity in &entities {
            let ctx = handler.event(EventKind::Save, entity);
            if !handler.shared.bus.pre(&ctx).proceed {
                skipped = skipped.saturating_add(1);
                continue;
            }
            let sync = handler.synchronize_tracked(entity).await;
            let encoded = handler.encode_column_strict(entity);
            pending.push((handler, entity, sync));
            match encoded {
                Ok(json) => writes.push(ColumnWrite {
                    entity,
                    column: handler.column.clone(),
                    json,
                }),
                Err(failure) => {
                    return roll_back(
                        &pending,
                        format!(
                            "attribute {}:{} of entity {entity} cannot be encoded: {}",
                            handler.module, failure.name, failure.source
                        ),
                    );
                }
            }
        }
    }

    if let Err(e) = store.upsert_all(&writes).await {
        return roll_back(&pending, format!("transaction failed: {e}"));
    }

    let now = Instant::now();
    for (handler, entity, _) in &pending {
        handler.last_saved.insert(*entity, now);
        handler
            .shared
            .bus
            .post(&handler.event(EventKind::Save, *entity));
    }
    info!(written = writes.len(), skipped, "Batch save committed");
    BatchOutcome::Committed {
        written: writes.len(),
        skipped,
    }
}

/// `entities` without repeats, first occurrence kept. A repeated id would
/// be reconciled twice against the same stored value.
fn distinct(entities: &[EntityId]) -> Vec<EntityId> {
    let mut seen = HashSet::with_capacity(entities.len());
    entities
        .iter()
        .copied()
        .filter(|entity| seen.insert(*entity))
        .collect()
}

fn roll_back(pending: &[(&Handler, EntityId, SyncReport)], reason: String) -> BatchOutcome {
    for (handler, entity, sync) in pending {
        handler.restore_baseline(*entity, sync);
    }
    error!(reason = reason.as_str(), "Batch save rolled back");
    BatchOutcome::RolledBack { reason }
}
