use axum::{extract::State, Json};
use std::sync::Arc;
use syncboard_replication::types::SyncStatusReport;

use super::AppState;

/// GET /api/sync_status
/// Offline backlog per peer, last hour of delivery outcomes, peer health and watermarks.
pub async fn sync_status(State(state): State<Arc<AppState>>) -> Json<SyncStatusReport> {
    Json(state.replication.sync_status())
}
