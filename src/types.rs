use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Last known delivery outcome of a message, kept for display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Synced,
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Pending => write!(f, "pending"),
            SyncState::Synced => write!(f, "synced"),
            SyncState::Failed => write!(f, "failed"),
        }
    }
}

/// A stored row of the message log.
///
/// `local_id` is assigned by the node holding the row and never leaves it as an
/// identity; `(origin_node_id, origin_local_id)` is the global identity carried
/// unchanged through every hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub local_id: u64,
    pub origin_node_id: String,
    pub origin_local_id: u64,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub sync_state: SyncState,
}

impl Message {
    pub fn snapshot(&self) -> MessageSnapshot {
        MessageSnapshot {
            origin_node_id: Some(self.origin_node_id.clone()),
            origin_local_id: Some(self.origin_local_id),
            author: self.author.clone(),
            body: self.body.clone(),
            created_at: self.created_at,
        }
    }

    pub fn is_from(&self, node_id: &str) -> bool {
        self.origin_node_id == node_id
    }
}

/// Wire form of a message: what is pushed, pulled and queued.
///
/// Origin fields are optional only so that legacy senders which omit them can
/// still be deduplicated on `(author, body, created_at)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_local_id: Option<u64>,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl MessageSnapshot {
    /// The global identity, present only when both halves are.
    pub fn origin(&self) -> Option<(&str, u64)> {
        match (&self.origin_node_id, self.origin_local_id) {
            (Some(node), Some(id)) if !node.is_empty() => Some((node.as_str(), id)),
            _ => None,
        }
    }
}

/// Outcome of the latest delivery attempt of one message to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Success => write!(f, "success"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// At most one current record per `(message_id, peer_id)`; replaced on every attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub message_id: u64,
    pub peer_id: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_attempt_at: DateTime<Utc>,
}

/// Durable copy of a message awaiting delivery to one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineQueueEntry {
    pub queue_id: u64,
    pub message_id: u64,
    pub peer_id: String,
    pub message_snapshot: MessageSnapshot,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub peer_id: String,
    pub last_synced_at: DateTime<Utc>,
}
