//! End-to-end behavior of the data engine over the in-memory row store.
//!
//! The in-memory store stands in for `PostgreSQL`; `set_column` plays the
//! part of another process writing to the same row.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    clippy::arithmetic_side_effects,
    clippy::float_cmp
)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use keepsake_core::config::PersistenceConfig;
use keepsake_core::{
    BatchOutcome, DataEngine, Defaults, EngineConfig, LoadOutcome, SaveOutcome, SetOutcome,
    ShutdownOutcome, WriteOptions, run_retention_once,
};
use keepsake_db::{MemoryRowStore, SqlIdent};
use keepsake_events::{EventKind, HookPhase, HookSignal};
use keepsake_types::{DataClass, EntityId, Value};

const ECONOMY: &str = "economy.storage";

fn new_store() -> Arc<MemoryRowStore> {
    Arc::new(MemoryRowStore::new(SqlIdent::new("players").unwrap()))
}

/// An engine without save throttling, so tests can save repeatedly.
fn engine_over(store: &Arc<MemoryRowStore>) -> DataEngine {
    let config = EngineConfig {
        persistence: PersistenceConfig {
            save_throttle_ms: 0,
            ..PersistenceConfig::default()
        },
        ..EngineConfig::default()
    };
    DataEngine::new(store.clone(), &config)
}

fn stored_json(store: &MemoryRowStore, entity: EntityId, column: &str) -> serde_json::Value {
    let text = store.column_value(entity, column).expect("column written");
    serde_json::from_str(&text).expect("column holds JSON")
}

// =============================================================================
// Cache semantics
// =============================================================================

#[tokio::test]
async fn set_and_get_need_no_database() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    let id = EntityId::new(1);

    assert_eq!(economy.set(id, "coins", 40_i64), SetOutcome::Stored);
    assert_eq!(economy.get::<i64>(id, "coins"), Some(40));
    assert_eq!(economy.get::<f64>(id, "coins"), Some(40.0));
    assert_eq!(store.write_count(), 0);
    assert_eq!(store.row_count(), 0);
}

#[tokio::test]
async fn identical_keys_in_different_modules_never_collide() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    let quests = engine.handler("quests", DataClass::Storage).unwrap();
    let id = EntityId::new(1);

    economy.set(id, "points", 10_i64);
    quests.set(id, "points", 99_i64);
    assert_eq!(economy.get::<i64>(id, "points"), Some(10));
    assert_eq!(quests.get::<i64>(id, "points"), Some(99));

    assert_eq!(economy.save(id).await, SaveOutcome::Saved);
    assert_eq!(quests.save(id).await, SaveOutcome::Saved);
    assert_eq!(stored_json(&store, id, ECONOMY), serde_json::json!({"points": 10}));
    assert_eq!(
        stored_json(&store, id, "quests.storage"),
        serde_json::json!({"points": 99})
    );
}

// =============================================================================
// Round trip
// =============================================================================

#[tokio::test]
async fn save_then_load_in_a_fresh_engine_reproduces_the_table() {
    let store = new_store();
    let id = EntityId::new(u64::MAX);

    let mut nested = BTreeMap::new();
    nested.insert("slot".to_owned(), Value::Int(3));
    nested.insert(
        "tags".to_owned(),
        Value::List(vec![Value::Str("rare".to_owned()), Value::Bool(false)]),
    );
    let expected: BTreeMap<String, Value> = [
        ("count", Value::Int(-12)),
        ("big", Value::Int(i64::MAX)),
        ("ratio", Value::Float(0.25)),
        ("whole", Value::Float(3.0)),
        ("flag", Value::Bool(true)),
        ("name", Value::Str("Ayla".to_owned())),
        ("gear", Value::Struct(nested)),
        ("empty", Value::List(Vec::new())),
        ("nothing", Value::Null),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v))
    .collect();

    {
        let engine = engine_over(&store);
        let economy = engine.handler("economy", DataClass::Storage).unwrap();
        for (name, value) in &expected {
            assert_eq!(economy.set(id, name, value.clone()), SetOutcome::Stored);
        }
        assert_eq!(economy.save(id).await, SaveOutcome::Saved);
    }

    let restarted = engine_over(&store);
    let economy = restarted.handler("economy", DataClass::Storage).unwrap();
    assert_eq!(
        economy.load(id).await,
        LoadOutcome::Loaded {
            attributes: expected.len()
        }
    );
    assert_eq!(economy.snapshot(id), expected);
}

#[tokio::test]
async fn malformed_column_loads_nothing_and_other_columns_still_load() {
    let store = new_store();
    let id = EntityId::new(5);
    store.set_column(id, ECONOMY, "{broken");
    store.set_column(id, "quests.storage", r#"{"done":4}"#);

    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    let quests = engine.handler("quests", DataClass::Storage).unwrap();

    assert_eq!(economy.load(id).await, LoadOutcome::Loaded { attributes: 0 });
    assert_eq!(quests.load(id).await, LoadOutcome::Loaded { attributes: 1 });
    assert_eq!(quests.get::<i64>(id, "done"), Some(4));
}

#[tokio::test]
async fn non_object_column_loads_nothing() {
    let store = new_store();
    let id = EntityId::new(6);
    store.set_column(id, ECONOMY, "[1,2,3]");

    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();

    assert_eq!(economy.load(id).await, LoadOutcome::Loaded { attributes: 0 });
    assert!(economy.snapshot(id).is_empty());
}

// =============================================================================
// Tracked reconciliation
// =============================================================================

#[tokio::test]
async fn tracked_counters_keep_both_deltas() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    economy.register(Defaults::new().tracked("coins", 0_i64)).unwrap();

    let original = 100_i64;
    let cases = [(25_i64, -30_i64), (-10, 40), (-50, -20), (0, 5), (7, 0)];
    for (raw, (external, local)) in (1_u64..).zip(cases) {
        let id = EntityId::new(raw);
        store.set_column(id, ECONOMY, &format!(r#"{{"coins":{original}}}"#));
        assert!(matches!(economy.load(id).await, LoadOutcome::Loaded { .. }));

        let coins = economy.get::<i64>(id, "coins").unwrap();
        economy.set(id, "coins", coins + local);
        store.set_column(id, ECONOMY, &format!(r#"{{"coins":{}}}"#, original + external));

        assert_eq!(economy.save(id).await, SaveOutcome::Saved);
        assert_eq!(
            stored_json(&store, id, ECONOMY),
            serde_json::json!({ "coins": original + external + local }),
            "external {external}, local {local}"
        );
        assert_eq!(
            economy.get::<i64>(id, "coins"),
            Some(original + external + local)
        );
    }
}

#[tokio::test]
async fn untracked_attributes_overwrite_external_changes() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    economy.register(Defaults::new().value("coins", 0_i64)).unwrap();
    let id = EntityId::new(1);

    store.set_column(id, ECONOMY, r#"{"coins":100}"#);
    economy.load(id).await;
    economy.set(id, "coins", 130_i64);
    store.set_column(id, ECONOMY, r#"{"coins":110}"#);

    assert_eq!(economy.save(id).await, SaveOutcome::Saved);
    assert_eq!(stored_json(&store, id, ECONOMY), serde_json::json!({"coins": 130}));
}

#[tokio::test]
async fn tracked_value_untouched_locally_adopts_database_value() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    economy
        .register(Defaults::new().tracked("coins", 0_i64).tracked("gems", 0_i64))
        .unwrap();
    let id = EntityId::new(1);

    store.set_column(id, ECONOMY, r#"{"coins":10}"#);
    economy.load(id).await;
    store.set_column(id, ECONOMY, r#"{"coins":12,"gems":3}"#);

    let report = economy.synchronize_tracked(id).await;
    assert!(!report.skipped);
    assert_eq!(economy.get::<i64>(id, "coins"), Some(12));
    assert_eq!(economy.get::<i64>(id, "gems"), Some(3));
}

#[tokio::test]
async fn tracked_floats_and_mixed_numbers_merge() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    economy.register(Defaults::new().tracked("balance", 0.0_f64)).unwrap();
    let id = EntityId::new(1);

    store.set_column(id, ECONOMY, r#"{"balance":10}"#);
    economy.load(id).await;
    economy.set(id, "balance", 12.5_f64);
    store.set_column(id, ECONOMY, r#"{"balance":11}"#);

    economy.save(id).await;
    assert_eq!(economy.get::<f64>(id, "balance"), Some(13.5));
}

#[tokio::test]
async fn failed_reread_saves_memory_state() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    economy.register(Defaults::new().tracked("coins", 0_i64)).unwrap();
    let id = EntityId::new(1);

    store.set_column(id, ECONOMY, r#"{"coins":100}"#);
    economy.load(id).await;
    economy.set(id, "coins", 105_i64);

    // The re-read fails; the upsert goes through.
    store.fail_next(1);
    assert_eq!(economy.save(id).await, SaveOutcome::Saved);
    assert_eq!(stored_json(&store, id, ECONOMY), serde_json::json!({"coins": 105}));
}

// =============================================================================
// Batch saves
// =============================================================================

#[tokio::test]
async fn batch_with_one_unencodable_value_writes_nothing() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    let quests = engine.handler("quests", DataClass::Storage).unwrap();
    let ids = [EntityId::new(1), EntityId::new(2)];
    for id in ids {
        economy.set(id, "coins", 1_i64);
        quests.set(id, "done", 1_i64);
    }
    quests.set(ids[1], "ratio", f64::NAN);

    let outcome = engine.save_all(&ids).await;
    assert!(matches!(outcome, BatchOutcome::RolledBack { .. }));
    assert_eq!(store.row_count(), 0);
    assert_eq!(store.write_count(), 0);

    quests.remove(ids[1], "ratio");
    assert_eq!(
        engine.save_all(&ids).await,
        BatchOutcome::Committed {
            written: 4,
            skipped: 0
        }
    );
    assert_eq!(store.row_count(), 2);
}

#[tokio::test]
async fn rolled_back_batch_keeps_tracked_deltas_for_the_retry() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    let quests = engine.handler("quests", DataClass::Storage).unwrap();
    economy.register(Defaults::new().tracked("coins", 0_i64)).unwrap();
    let id = EntityId::new(1);

    store.set_column(id, ECONOMY, r#"{"coins":100}"#);
    economy.load(id).await;
    economy.set(id, "coins", 105_i64);
    store.set_column(id, ECONOMY, r#"{"coins":110}"#);
    quests.set(id, "ratio", f64::INFINITY);

    assert!(matches!(
        engine.save_all(&[id]).await,
        BatchOutcome::RolledBack { .. }
    ));
    quests.remove(id, "ratio");
    assert!(matches!(
        engine.save_all(&[id]).await,
        BatchOutcome::Committed { .. }
    ));
    assert_eq!(stored_json(&store, id, ECONOMY), serde_json::json!({"coins": 115}));
}

#[tokio::test]
async fn repeated_ids_in_a_session_keep_tracked_counters_exact() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    economy.register(Defaults::new().tracked("coins", 0_i64)).unwrap();
    let id = EntityId::new(1);
    store.set_column(id, ECONOMY, r#"{"coins":100}"#);

    let report = engine.begin_session(&[id, id]).await;
    assert_eq!(report.loaded, 1);
    economy.set(id, "coins", 105_i64);
    store.set_column(id, ECONOMY, r#"{"coins":110}"#);

    assert_eq!(
        engine.save_all(&[id, id, id]).await,
        BatchOutcome::Committed {
            written: 1,
            skipped: 0
        }
    );
    assert_eq!(stored_json(&store, id, ECONOMY), serde_json::json!({"coins": 115}));
}

#[tokio::test]
async fn batch_skips_pairs_a_hook_handled() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    let quests = engine.handler("quests", DataClass::Storage).unwrap();
    let ids = [EntityId::new(1), EntityId::new(2)];
    for id in ids {
        economy.set(id, "coins", 1_i64);
        quests.set(id, "done", 1_i64);
    }
    engine
        .bus()
        .subscribe(EventKind::Save, HookPhase::Pre, "audit", |ctx| {
            if ctx.module.as_deref() == Some("quests") {
                Ok(HookSignal::Handled)
            } else {
                Ok(HookSignal::Continue)
            }
        })
        .unwrap();

    assert_eq!(
        engine.save_all(&ids).await,
        BatchOutcome::Committed {
            written: 2,
            skipped: 2
        }
    );
    assert!(store.column_value(ids[0], "quests.storage").is_none());
}

// =============================================================================
// Hooks
// =============================================================================

#[tokio::test]
async fn pre_save_stop_suppresses_the_write_and_post_hooks() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    let id = EntityId::new(1);
    economy.set(id, "coins", 1_i64);

    let posts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&posts);
    engine
        .bus()
        .subscribe(EventKind::Save, HookPhase::Post, "audit", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(HookSignal::Continue)
        })
        .unwrap();
    let veto = engine
        .bus()
        .subscribe(EventKind::Save, HookPhase::Pre, "audit", |_| Ok(HookSignal::Stop))
        .unwrap();

    assert_eq!(economy.save(id).await, SaveOutcome::Vetoed);
    assert_eq!(store.write_count(), 0);
    assert_eq!(posts.load(Ordering::SeqCst), 0);

    assert!(engine.bus().unsubscribe(veto));
    assert_eq!(economy.save(id).await, SaveOutcome::Saved);
    assert_eq!(posts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn post_hook_result_never_undoes_the_action() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    let id = EntityId::new(1);
    economy.set(id, "coins", 1_i64);
    engine
        .bus()
        .subscribe(EventKind::Save, HookPhase::Post, "audit", |_| Ok(HookSignal::Stop))
        .unwrap();

    assert_eq!(economy.save(id).await, SaveOutcome::Saved);
    assert_eq!(store.write_count(), 1);
}

#[tokio::test]
async fn pre_load_veto_leaves_cache_empty() {
    let store = new_store();
    store.set_column(EntityId::new(1), ECONOMY, r#"{"coins":9}"#);
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    engine
        .bus()
        .subscribe(EventKind::Load, HookPhase::Pre, "gate", |_| Ok(HookSignal::Handled))
        .unwrap();

    assert_eq!(economy.load(EntityId::new(1)).await, LoadOutcome::Vetoed);
    assert!(engine.cache().is_empty());
}

// =============================================================================
// Throttling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn saves_within_the_throttle_window_write_once() {
    let store = new_store();
    let engine = DataEngine::new(store.clone(), &EngineConfig::default());
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    let id = EntityId::new(1);
    economy.set(id, "coins", 1_i64);

    assert_eq!(economy.save(id).await, SaveOutcome::Saved);
    economy.set(id, "coins", 2_i64);
    assert_eq!(economy.save(id).await, SaveOutcome::Throttled);
    assert_eq!(store.write_count(), 1);

    tokio::time::advance(Duration::from_millis(1001)).await;
    assert_eq!(economy.save(id).await, SaveOutcome::Saved);
    assert_eq!(store.write_count(), 2);
    assert_eq!(stored_json(&store, id, ECONOMY), serde_json::json!({"coins": 2}));
}

#[tokio::test(start_paused = true)]
async fn throttle_is_per_entity() {
    let store = new_store();
    let engine = DataEngine::new(store.clone(), &EngineConfig::default());
    let economy = engine.handler("economy", DataClass::Storage).unwrap();

    assert_eq!(economy.save(EntityId::new(1)).await, SaveOutcome::Saved);
    assert_eq!(economy.save(EntityId::new(2)).await, SaveOutcome::Saved);
    assert_eq!(store.write_count(), 2);
}

#[tokio::test]
async fn immediate_save_runs_in_the_background() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    let id = EntityId::new(1);

    let outcome = economy.set_with(id, "coins", 3_i64, WriteOptions::new().with_save());
    assert_eq!(outcome, SetOutcome::Stored);
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    assert_eq!(stored_json(&store, id, ECONOMY), serde_json::json!({"coins": 3}));
}

// =============================================================================
// Sessions, shutdown, retention
// =============================================================================

#[tokio::test]
async fn session_loads_every_handler_and_clears_on_end() {
    let store = new_store();
    let id = EntityId::new(1);
    store.set_column(id, ECONOMY, r#"{"coins":7}"#);
    store.set_column(id, "economy.settings", r#"{"notify":true}"#);

    let engine = engine_over(&store);
    let storage = engine.handler("economy", DataClass::Storage).unwrap();
    let settings = engine.handler("economy", DataClass::Settings).unwrap();

    let report = engine.begin_session(&[id]).await;
    assert_eq!(report.loaded, 2);
    assert_eq!(storage.get::<i64>(id, "coins"), Some(7));
    assert_eq!(settings.get::<bool>(id, "notify"), Some(true));

    storage.set(id, "coins", 8_i64);
    let end = engine.end_session(id).await;
    assert_eq!(end.saved, 2);
    assert_eq!(end.failed, 0);
    assert!(engine.cache().is_empty());
    assert_eq!(stored_json(&store, id, ECONOMY), serde_json::json!({"coins": 8}));
}

#[tokio::test]
async fn session_end_under_a_save_veto_clears_without_writing() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    let id = EntityId::new(1);
    economy.set(id, "coins", 3_i64);
    engine
        .bus()
        .subscribe(EventKind::Save, HookPhase::Pre, "archive", |_| Ok(HookSignal::Stop))
        .unwrap();

    let end = engine.end_session(id).await;
    assert_eq!(end.saved, 1);
    assert_eq!(end.failed, 0);
    assert_eq!(store.write_count(), 0);
    assert!(engine.cache().is_empty());
}

#[tokio::test]
async fn shutdown_saves_every_cached_entity() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    for raw in 1..=3 {
        economy.set(EntityId::new(raw), "coins", i64::try_from(raw).unwrap());
    }

    let outcome = engine.shutdown().await;
    assert_eq!(
        outcome,
        ShutdownOutcome::Completed(BatchOutcome::Committed {
            written: 3,
            skipped: 0
        })
    );
    assert_eq!(store.row_count(), 3);
}

#[tokio::test]
async fn retention_removes_only_stale_rows_written_by_the_engine() {
    let store = new_store();
    let engine = engine_over(&store);
    let economy = engine.handler("economy", DataClass::Storage).unwrap();
    for raw in 1..=2 {
        economy.set(EntityId::new(raw), "coins", 1_i64);
        economy.save(EntityId::new(raw)).await;
    }
    store.set_last_seen(
        EntityId::new(1),
        chrono::Utc::now() - chrono::Duration::days(45),
    );

    let deleted = run_retention_once(engine.store().as_ref(), chrono::Duration::days(30)).await;
    assert_eq!(deleted.unwrap(), 1);
    assert!(store.contains(EntityId::new(2)));

    let disabled = keepsake_core::config::RetentionConfig {
        interval_hours: 6,
        retention_days: 0,
    };
    assert!(engine.spawn_retention(&disabled).is_none());
}

#[tokio::test]
async fn custom_events_must_be_registered() {
    let store = new_store();
    let engine = engine_over(&store);
    let bus = engine.bus();
    let ctx = keepsake_events::EventContext::custom("level_up").for_entity(EntityId::new(1));

    assert!(bus.trigger(&ctx).is_err());
    assert!(
        bus.subscribe(EventKind::custom("level_up"), HookPhase::Post, "quests", |_| {
            Ok(HookSignal::Continue)
        })
        .is_err()
    );

    bus.register_event("level_up", "economy").unwrap();
    let outcome = bus.trigger(&ctx).unwrap();
    assert!(outcome.proceed);
}
