//! Delta reconciliation for tracked attributes.
//!
//! Several processes may share one backing row. For a tracked numeric
//! attribute the handler remembers the value the database held at the last
//! load or save (the *original*). Before saving, it re-reads the column and
//! applies its own change on top of whatever the database holds now:
//!
//! ```text
//! delta  = current - original
//! merged = fresh + delta
//! ```
//!
//! so concurrent increments from other writers survive. Non-numeric tracked
//! attributes fall back to last-write-wins.

use std::collections::BTreeMap;

use keepsake_types::{EntityId, Value};
use tracing::{debug, warn};

use crate::handler::Handler;
use crate::persist::parse_column;

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// The re-read failed; the cache was left as it was.
    pub skipped: bool,
    /// Attributes merged as `fresh + delta`.
    pub merged: usize,
    /// Attributes that adopted the database value outright.
    pub adopted: usize,
    /// Database values read during the pass. If the following write fails,
    /// these become the originals again so the next pass recomputes the
    /// same deltas.
    pub(crate) baseline: Vec<(String, Value)>,
}

/// A numeric difference between two values.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Delta {
    Int(i64),
    Float(f64),
}

/// `current - original`, or `None` when either side is not numeric or the
/// integer difference overflows.
fn numeric_delta(current: &Value, original: &Value) -> Option<Delta> {
    match (current, original) {
        (Value::Int(c), Value::Int(o)) => c.checked_sub(*o).map(Delta::Int),
        (Value::Float(c), Value::Float(o)) => Some(Delta::Float(c - o)),
        (Value::Int(c), Value::Float(o)) => Some(Delta::Float(int_to_f64(*c) - o)),
        (Value::Float(c), Value::Int(o)) => Some(Delta::Float(c - int_to_f64(*o))),
        _ => None,
    }
}

/// `fresh + delta`, or `None` when `fresh` is not numeric or the integer sum
/// overflows.
fn apply_delta(fresh: &Value, delta: Delta) -> Option<Value> {
    match (fresh, delta) {
        (Value::Int(f), Delta::Int(d)) => f.checked_add(d).map(Value::Int),
        (Value::Int(f), Delta::Float(d)) => Some(Value::Float(int_to_f64(*f) + d)),
        (Value::Float(f), Delta::Int(d)) => Some(Value::Float(f + int_to_f64(d))),
        (Value::Float(f), Delta::Float(d)) => Some(Value::Float(f + d)),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
const fn int_to_f64(i: i64) -> f64 {
    i as f64
}

impl Handler {
    /// Record the original of every tracked attribute from freshly loaded
    /// values; attributes absent from the database take their default.
    pub(crate) fn capture_originals(&self, entity: EntityId, loaded: &BTreeMap<String, Value>) {
        for (name, default) in self.tracked_keys() {
            let original = loaded.get(&name).cloned().unwrap_or(default);
            self.originals.insert((entity, name), original);
        }
    }

    /// Restore originals to the database values read by a reconciliation
    /// pass whose write then failed.
    pub(crate) fn restore_baseline(&self, entity: EntityId, report: &SyncReport) {
        for (name, fresh) in &report.baseline {
            self.originals.insert((entity, name.clone()), fresh.clone());
        }
    }

    /// Merge this process's changes to tracked attributes with concurrent
    /// changes made by other writers to the backing column.
    ///
    /// Updates both the cache and the recorded originals. A failed re-read
    /// is logged and skips the pass; the save then proceeds with the
    /// in-memory state.
    pub async fn synchronize_tracked(&self, entity: EntityId) -> SyncReport {
        let mut report = SyncReport::default();
        let tracked = self.tracked_keys();
        if tracked.is_empty() {
            return report;
        }

        let fresh = match self.shared.store.read_column(&self.column, entity).await {
            Ok(json) => parse_column(self, entity, json.as_deref()),
            Err(e) => {
                warn!(
                    entity = %entity,
                    column = self.column.as_str(),
                    error = %e,
                    "Tracked re-read failed; saving in-memory values"
                );
                report.skipped = true;
                return report;
            }
        };

        let table = self.shared.cache.get_or_create_table(entity, self.class);
        for (name, default) in tracked {
            let key = self.qualified(&name);
            let fresh_value = fresh.get(&name);
            if let Some(f) = fresh_value {
                report.baseline.push((name.clone(), f.clone()));
            }

            let Some(current) = table.get(&key) else {
                // Never touched in this process: take the database value.
                if let Some(f) = fresh_value {
                    table.insert(key, f.clone());
                    self.originals.insert((entity, name), f.clone());
                    report.adopted = report.adopted.saturating_add(1);
                }
                continue;
            };

            let original = self
                .originals
                .get(&(entity, name.clone()))
                .map_or(default, |o| o.value().clone());
            let merged = fresh_value.and_then(|f| {
                numeric_delta(&current, &original).and_then(|delta| apply_delta(f, delta))
            });

            let next = match merged {
                Some(value) => {
                    report.merged = report.merged.saturating_add(1);
                    value
                }
                None => current,
            };
            table.insert(key, next.clone());
            self.originals.insert((entity, name), next);
        }

        debug!(
            entity = %entity,
            module = self.module.as_str(),
            merged = report.merged,
            adopted = report.adopted,
            "Synchronized tracked attributes"
        );
        report
    }
}
