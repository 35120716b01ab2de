use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::model::Ms;
use crate::observability::PRUNED_TOTAL;
use crate::validate::now_ms;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that rewrites the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that removes reservations which ended more than
/// `retention_ms` ago.
pub async fn run_pruner(engine: Arc<Engine>, retention_ms: Ms) {
    let mut interval = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        interval.tick().await;
        prune_finished(&engine, now_ms() - retention_ms).await;
    }
}

async fn prune_finished(engine: &Engine, cutoff: Ms) -> usize {
    let mut pruned = 0;
    for (id, resource_id) in engine.collect_finished(cutoff) {
        match engine.remove_reservation(id).await {
            Ok(true) => {
                pruned += 1;
                metrics::counter!(PRUNED_TOTAL).increment(1);
                tracing::debug!(%id, resource_id, "pruned finished reservation");
            }
            // Cancelled between collection and removal.
            Ok(false) => {}
            Err(e) => tracing::error!(%id, "prune failed: {e}"),
        }
    }
    if pruned > 0 {
        info!("pruned {pruned} finished reservations");
    }
    pruned
}
