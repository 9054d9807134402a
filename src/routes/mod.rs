//! HTTP surface

pub mod cache;
pub mod health;
pub mod metrics;
pub mod views;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Application routes; middleware layers are added by the binary.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health and metrics (Kubernetes probes + Prometheus)
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/metrics", get(metrics::prometheus_metrics))
        // Views
        .route("/api/v1/metrics", post(views::fetch_metrics))
        .route("/api/v1/entities", post(views::fetch_entities))
        // Topology-change hook
        .route("/api/v1/cache/invalidate", post(cache::invalidate))
        .with_state(state)
}
