//! Metric and entity view endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::facade::FetchState;
use crate::models::{EntityQuery, MetricRequest};
use crate::state::AppState;

/// Failed states keep the FetchState body but carry the error's status.
fn respond<T: Serialize>(state: &AppState, fetched: FetchState<T>) -> Response {
    let status = match &fetched.error {
        Some(e) => {
            state.metrics.inc_failed();
            e.status_code()
        }
        None => StatusCode::OK,
    };
    (status, Json(fetched)).into_response()
}

/// POST /api/v1/metrics
///
/// Returns `{loading, error, data}` for the requested metric view.
pub async fn fetch_metrics(
    State(state): State<AppState>,
    Json(request): Json<MetricRequest>,
) -> Response {
    state.metrics.inc_metric_requests();
    let fetched = state.orchestrator.fetch_metrics(&request).await;

    match &fetched.error {
        Some(e) => warn!(kind = %request.entity_kind, error = %e, "Metric view failed"),
        None => info!(
            kind = %request.entity_kind,
            metrics = request.metrics.len(),
            groups = fetched.data.as_ref().map_or(0, |d| d.groups.len()),
            "Metric view served"
        ),
    }
    respond(&state, fetched)
}

/// POST /api/v1/entities
///
/// Returns `{loading, error, data}` for the requested entity list.
pub async fn fetch_entities(
    State(state): State<AppState>,
    Json(query): Json<EntityQuery>,
) -> Response {
    state.metrics.inc_entity_requests();
    let fetched = state.orchestrator.fetch_entities(&query).await;

    if let Some(e) = &fetched.error {
        warn!(kind = %query.entity_kind, error = %e, "Entity lookup failed");
    }
    respond(&state, fetched)
}
