//! Periodic deletion of rows for entities that have not been seen lately.
//!
//! Every load and save refreshes a row's `last_seen`. Rows older than the
//! retention window are deleted on a fixed interval. A window of zero days
//! disables cleanup entirely.

use std::sync::Arc;

use chrono::Utc;
use keepsake_db::{DbError, RowStore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RetentionConfig;

/// Delete rows not seen within `window`. Returns the number deleted.
///
/// # Errors
///
/// Returns [`DbError`] if the table cannot be bootstrapped or the delete
/// fails.
pub async fn run_retention_once(
    store: &dyn RowStore,
    window: chrono::Duration,
) -> Result<u64, DbError> {
    store.ensure_table().await?;
    let cutoff = Utc::now()
        .checked_sub_signed(window)
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
    let deleted = store.delete_stale(cutoff).await?;
    info!(
        table = store.table().as_str(),
        deleted,
        cutoff = %cutoff,
        "Retention cleanup finished"
    );
    Ok(deleted)
}

/// Spawn the cleanup loop on the current runtime.
///
/// The first pass runs immediately, then once per configured interval.
/// Failures are logged and retried on the next tick. Returns `None` when
/// cleanup is disabled.
pub fn spawn_retention_job(
    store: Arc<dyn RowStore>,
    config: &RetentionConfig,
) -> Option<JoinHandle<()>> {
    let Some(window) = config.window() else {
        info!(
            retention_days = config.retention_days,
            "Retention cleanup disabled"
        );
        return None;
    };
    let Some(period) = config.interval() else {
        warn!(
            interval_hours = config.interval_hours,
            "Retention interval must be positive; cleanup disabled"
        );
        return None;
    };

    info!(
        retention_days = config.retention_days,
        interval_hours = config.interval_hours,
        "Starting retention cleanup"
    );
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = run_retention_once(store.as_ref(), window).await {
                warn!(error = %e, "Retention cleanup failed; will retry");
            }
        }
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use chrono::Duration;
    use keepsake_db::{MemoryRowStore, SqlIdent};
    use keepsake_types::EntityId;

    use super::*;

    fn store() -> Arc<MemoryRowStore> {
        Arc::new(MemoryRowStore::new(SqlIdent::new("players").unwrap()))
    }

    #[tokio::test]
    async fn deletes_only_rows_outside_the_window() {
        let store = store();
        store.set_column(EntityId::new(1), "economy.storage", "{}");
        store.set_column(EntityId::new(2), "economy.storage", "{}");
        store.set_last_seen(EntityId::new(1), Utc::now() - Duration::days(31));
        store.set_last_seen(EntityId::new(2), Utc::now() - Duration::days(29));

        let deleted = run_retention_once(store.as_ref(), Duration::days(30)).await;
        assert_eq!(deleted.unwrap(), 1);
        assert!(!store.contains(EntityId::new(1)));
        assert!(store.contains(EntityId::new(2)));
    }

    #[tokio::test]
    async fn zero_day_window_disables_the_job() {
        let config = RetentionConfig {
            interval_hours: 6,
            retention_days: 0,
        };
        assert!(spawn_retention_job(store(), &config).is_none());

        let config = RetentionConfig {
            interval_hours: 0,
            retention_days: 30,
        };
        assert!(spawn_retention_job(store(), &config).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn job_runs_on_start_and_each_interval() {
        let store = store();
        store.set_column(EntityId::new(1), "economy.storage", "{}");
        store.set_last_seen(EntityId::new(1), Utc::now() - Duration::days(90));

        let config = RetentionConfig {
            interval_hours: 1,
            retention_days: 30,
        };
        let job = spawn_retention_job(store.clone(), &config).unwrap();
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!(!store.contains(EntityId::new(1)));

        store.set_column(EntityId::new(2), "economy.storage", "{}");
        store.set_last_seen(EntityId::new(2), Utc::now() - Duration::days(90));
        tokio::time::sleep(std::time::Duration::from_secs(3601)).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!(!store.contains(EntityId::new(2)));
        job.abort();
    }
}
