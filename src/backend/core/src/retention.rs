//! Retention pruning for client spans.
//!
//! A background task periodically deletes rows older than the configured
//! window. Deletes run in bounded batches so a large backlog never turns
//! into one giant write.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tracing::{debug, warn};

use crate::config::IngestConfig;
use crate::db::Database;

/// One pruning pass. Returns the total rows removed.
pub async fn prune_once(db: &Database, config: &IngestConfig) -> u64 {
    let cutoff = Utc::now() - chrono::Duration::days(config.retention_days as i64);
    let mut total = 0u64;

    loop {
        match db
            .prune_client_spans(cutoff, config.retention_delete_batch)
            .await
        {
            Ok(0) => break,
            Ok(removed) => {
                total += removed;
                counter!("telemetry_retention_rows_pruned_total").increment(removed);
            }
            Err(e) => {
                warn!(error = %e, "retention prune failed, will retry next sweep");
                break;
            }
        }
    }

    if total > 0 {
        debug!(rows = total, retention_days = config.retention_days, "pruned client spans");
    }
    total
}

/// Spawn the periodic retention sweeper.
pub fn start_retention_task(db: Arc<Database>, config: IngestConfig) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(config.retention_sweep_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            prune_once(&db, &config).await;
        }
    });
}
