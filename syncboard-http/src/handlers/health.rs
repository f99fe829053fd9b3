use axum::{extract::State, Json};
use std::sync::Arc;
use syncboard_replication::types::HealthResponse;

use super::AppState;

/// Liveness probe used by peers' health monitors
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(state.replication.health_response())
}
