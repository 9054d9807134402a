//! Cache invalidation hook for topology-change notifications

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AppError, Result};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    /// Entity GUIDs or `kind:`/`cluster:` scope tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Exact cache keys
    #[serde(default)]
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub evicted: usize,
}

/// POST /api/v1/cache/invalidate
///
/// Drops the named entries and everything derived from them.
pub async fn invalidate(
    State(state): State<AppState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>> {
    if request.tags.is_empty() && request.keys.is_empty() {
        return Err(AppError::InvalidRequest(
            "Provide at least one tag or key".into(),
        ));
    }

    let mut evicted = state.orchestrator.invalidate_by_tags(&request.tags);
    for key in &request.keys {
        evicted += state.orchestrator.invalidate(key);
    }
    state.metrics.add_invalidated(evicted as u64);

    info!(
        tags = request.tags.len(),
        keys = request.keys.len(),
        evicted = evicted,
        "Cache invalidated"
    );
    Ok(Json(InvalidateResponse { evicted }))
}
