use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use syncboard::{MessageSnapshot, SyncboardError};
use syncboard_replication::types::MessagesQuery;

use super::AppState;
use crate::dto::{CreateMessageRequest, CreateMessageResponse};

/// GET /api/messages?since=<rfc3339>
/// Messages created at or after `since` (all of them without it), oldest first.
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    query: Result<Query<MessagesQuery>, QueryRejection>,
) -> Result<Json<Vec<MessageSnapshot>>, SyncboardError> {
    let Query(query) = query.map_err(|e| SyncboardError::MalformedInput(e.body_text()))?;

    let messages = state
        .replication
        .messages_since(query.since)
        .iter()
        .map(|m| m.snapshot())
        .collect();
    Ok(Json(messages))
}

/// POST /api/messages
/// Store a message authored on this node and hand it to the replication sender.
pub async fn create_message(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateMessageRequest>, JsonRejection>,
) -> Result<impl IntoResponse, SyncboardError> {
    let Json(req) = payload.map_err(|e| SyncboardError::MalformedInput(e.body_text()))?;

    let message = state.replication.create_message(&req.author, &req.body)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateMessageResponse {
            status: "success".to_string(),
            message,
        }),
    ))
}
