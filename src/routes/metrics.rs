//! Prometheus metrics endpoint

use axum::{extract::State, response::IntoResponse};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::state::AppState;

/// Request counters for Prometheus
#[derive(Default)]
pub struct Metrics {
    /// Metric view requests served
    pub metric_requests_total: AtomicU64,
    /// Entity list requests served
    pub entity_requests_total: AtomicU64,
    /// Requests answered with an error
    pub failed_requests_total: AtomicU64,
    /// Cache entries dropped through the invalidation endpoint
    pub invalidated_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_metric_requests(&self) {
        self.metric_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_entity_requests(&self) {
        self.entity_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.failed_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_invalidated(&self, count: u64) {
        self.invalidated_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            metric_requests_total: self.metric_requests_total.load(Ordering::Relaxed),
            entity_requests_total: self.entity_requests_total.load(Ordering::Relaxed),
            failed_requests_total: self.failed_requests_total.load(Ordering::Relaxed),
            invalidated_total: self.invalidated_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct MetricsSnapshot {
    pub metric_requests_total: u64,
    pub entity_requests_total: u64,
    pub failed_requests_total: u64,
    pub invalidated_total: u64,
}

/// GET /metrics
///
/// Returns Prometheus-format metrics
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let requests = state.metrics.get_metrics();
    let cache = state.orchestrator.cache_stats();
    let batching = state.orchestrator.coordinator_stats();
    let execution = state.orchestrator.executor_stats();

    let output = format!(
        r#"# HELP kafkalens_requests_total Requests served by endpoint
# TYPE kafkalens_requests_total counter
kafkalens_requests_total{{endpoint="metrics"}} {}
kafkalens_requests_total{{endpoint="entities"}} {}

# HELP kafkalens_failed_requests_total Requests answered with an error
# TYPE kafkalens_failed_requests_total counter
kafkalens_failed_requests_total {}

# HELP kafkalens_cache_hits_total Cache lookups served from a valid entry
# TYPE kafkalens_cache_hits_total counter
kafkalens_cache_hits_total {}

# HELP kafkalens_cache_misses_total Cache lookups that found no valid entry
# TYPE kafkalens_cache_misses_total counter
kafkalens_cache_misses_total {}

# HELP kafkalens_cache_evictions_total Entries evicted under capacity pressure
# TYPE kafkalens_cache_evictions_total counter
kafkalens_cache_evictions_total {}

# HELP kafkalens_cache_invalidations_total Entries dropped by invalidation
# TYPE kafkalens_cache_invalidations_total counter
kafkalens_cache_invalidations_total {}

# HELP kafkalens_cache_expirations_total Entries dropped after their TTL
# TYPE kafkalens_cache_expirations_total counter
kafkalens_cache_expirations_total {}

# HELP kafkalens_cache_entries Current number of cached entries
# TYPE kafkalens_cache_entries gauge
kafkalens_cache_entries {}

# HELP kafkalens_executions_total Batched executor calls started
# TYPE kafkalens_executions_total counter
kafkalens_executions_total {}

# HELP kafkalens_deduplicated_total Requests that joined an in-flight execution
# TYPE kafkalens_deduplicated_total counter
kafkalens_deduplicated_total {}

# HELP kafkalens_batch_merges_total Requests merged into another request's batch
# TYPE kafkalens_batch_merges_total counter
kafkalens_batch_merges_total {}

# HELP kafkalens_in_flight Requests currently executing
# TYPE kafkalens_in_flight gauge
kafkalens_in_flight {}

# HELP kafkalens_service_attempts_total Calls made to the query services
# TYPE kafkalens_service_attempts_total counter
kafkalens_service_attempts_total {}

# HELP kafkalens_service_retries_total Calls that were retries of a failed attempt
# TYPE kafkalens_service_retries_total counter
kafkalens_service_retries_total {}

# HELP kafkalens_info Build information
# TYPE kafkalens_info gauge
kafkalens_info{{version="{}",source="{}"}} 1
"#,
        requests.metric_requests_total,
        requests.entity_requests_total,
        requests.failed_requests_total,
        cache.hits,
        cache.misses,
        cache.evictions,
        cache.invalidations,
        cache.expirations,
        cache.size,
        batching.executions,
        batching.deduplicated,
        batching.merged,
        batching.in_flight,
        execution.attempts,
        execution.retries,
        env!("CARGO_PKG_VERSION"),
        state.data_source,
    );

    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        output,
    )
}
