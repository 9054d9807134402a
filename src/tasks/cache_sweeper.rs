//! Cache sweeper task - drops expired entries between reads

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::facade::MetricsOrchestrator;

/// Background task that periodically purges expired cache entries.
///
/// Reads already skip stale entries; sweeping keeps them from holding
/// capacity until the next LRU pass.
pub async fn cache_sweeper_task(orchestrator: Arc<MetricsOrchestrator>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // first tick completes immediately
    interval.tick().await;

    info!(interval_secs = every.as_secs(), "Cache sweeper started");

    loop {
        interval.tick().await;

        let purged = orchestrator.purge_expired();
        if purged > 0 {
            let stats = orchestrator.cache_stats();
            info!(purged = purged, remaining = stats.size, "Purged expired cache entries");
        } else {
            debug!("No expired cache entries");
        }
    }
}
