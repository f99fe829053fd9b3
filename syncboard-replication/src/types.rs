use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use syncboard::{DeliveryStatus, MessageSnapshot, SyncboardError};

use crate::config::NodeRole;
use crate::health::PeerHealth;

/// Body of `POST /sync_message`.
///
/// Every field is optional on the wire so that a missing field is reported
/// as malformed input rather than a deserializer error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncMessageRequest {
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_local_id: Option<u64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl SyncMessageRequest {
    pub fn into_snapshot(self) -> Result<MessageSnapshot, SyncboardError> {
        let author = required(self.author, "author")?;
        let body = required(self.body, "body")?;
        let created_at = self
            .created_at
            .ok_or_else(|| SyncboardError::MalformedInput("missing field: created_at".into()))?;

        // Half an origin is as good as none; fall back to the content tuple.
        let (origin_node_id, origin_local_id) = match (self.origin_node_id, self.origin_local_id) {
            (Some(node), Some(id)) if !node.trim().is_empty() => (Some(node), Some(id)),
            _ => (None, None),
        };

        Ok(MessageSnapshot {
            origin_node_id,
            origin_local_id,
            author,
            body,
            created_at,
        })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, SyncboardError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(SyncboardError::MalformedInput(format!(
            "missing field: {}",
            field
        ))),
    }
}

impl From<&MessageSnapshot> for SyncMessageRequest {
    fn from(snapshot: &MessageSnapshot) -> Self {
        Self {
            author: Some(snapshot.author.clone()),
            body: Some(snapshot.body.clone()),
            origin_node_id: snapshot.origin_node_id.clone(),
            origin_local_id: snapshot.origin_local_id,
            created_at: Some(snapshot.created_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessageResponse {
    pub status: String,
    pub local_id: u64,
    /// False when the message was already present.
    #[serde(default)]
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub node_role: NodeRole,
    pub timestamp: DateTime<Utc>,
    pub message_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagesQuery {
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatistic {
    pub peer_id: String,
    pub status: DeliveryStatus,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub peer_id: String,
    pub addr: String,
    pub health: PeerHealth,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Diagnostic snapshot served by `GET /api/sync_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatusReport {
    pub node_id: String,
    pub node_role: NodeRole,
    pub offline_messages: BTreeMap<String, usize>,
    pub sync_statistics: Vec<SyncStatistic>,
    pub peers: Vec<PeerStatus>,
    pub watermarks: BTreeMap<String, DateTime<Utc>>,
    pub message_count: usize,
    pub timestamp: DateTime<Utc>,
}
