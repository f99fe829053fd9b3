use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use syncboard::SyncboardError;
use syncboard_replication::types::{SyncMessageRequest, SyncMessageResponse};

use super::AppState;

/// POST /sync_message
/// Apply a message pushed by a peer. Replays of an already applied message
/// answer the same way as the first delivery. Every failure, malformed input
/// included, answers 5xx.
pub async fn sync_message(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SyncMessageRequest>, JsonRejection>,
) -> Result<Json<SyncMessageResponse>, Response> {
    let snapshot = payload
        .map_err(|e| SyncboardError::MalformedInput(e.body_text()))
        .and_then(|Json(req)| req.into_snapshot())
        .map_err(|e| {
            tracing::warn!("[INGEST] rejected sync request: {}", e);
            server_error(e)
        })?;

    let outcome = state
        .replication
        .ingest(&snapshot)
        .map_err(server_error)?;

    Ok(Json(SyncMessageResponse {
        status: "success".to_string(),
        local_id: outcome.local_id(),
        applied: outcome.is_applied(),
    }))
}

fn server_error(e: SyncboardError) -> Response {
    let mut response = e.into_response();
    if !response.status().is_server_error() {
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    }
    response
}
