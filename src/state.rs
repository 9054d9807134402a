//! Application state shared across handlers

use std::sync::Arc;

use crate::facade::MetricsOrchestrator;
use crate::routes::metrics::Metrics;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Facade over builder, cache, batching and execution
    pub orchestrator: Arc<MetricsOrchestrator>,
    /// Application metrics for Prometheus
    pub metrics: Arc<Metrics>,
    /// Where query results come from ("nerdgraph" or "fixture")
    pub data_source: &'static str,
}

impl AppState {
    pub fn new(orchestrator: MetricsOrchestrator, data_source: &'static str) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            metrics: Arc::new(Metrics::new()),
            data_source,
        }
    }
}
