use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::journal::Journal;
use crate::error::{Result, SyncboardError};
use crate::types::{Message, MessageSnapshot, SyncState};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum MessageEvent {
    Stored { message: Message },
    SyncState { local_id: u64, state: SyncState },
}

/// Result of handing a replicated message to the log.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The message was new and is now stored under this row.
    Applied(Message),
    /// An equivalent row already existed; nothing was written.
    Duplicate(u64),
}

impl ApplyOutcome {
    pub fn local_id(&self) -> u64 {
        match self {
            ApplyOutcome::Applied(message) => message.local_id,
            ApplyOutcome::Duplicate(local_id) => *local_id,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(_))
    }
}

type ContentKey = (String, String, DateTime<Utc>);

#[derive(Default)]
struct MessageTable {
    rows: BTreeMap<u64, Message>,
    by_origin: HashMap<(String, u64), u64>,
    by_content: HashMap<ContentKey, u64>,
    next_id: u64,
}

impl MessageTable {
    fn index(&mut self, message: Message) {
        self.by_origin
            .insert((message.origin_node_id.clone(), message.origin_local_id), message.local_id);
        self.by_content
            .entry((
                message.author.clone(),
                message.body.clone(),
                message.created_at,
            ))
            .or_insert(message.local_id);
        self.next_id = self.next_id.max(message.local_id + 1);
        self.rows.insert(message.local_id, message);
    }

    /// Origin identity first; the content tuple only when the candidate has none.
    fn find_duplicate(&self, candidate: &MessageSnapshot) -> Option<u64> {
        match candidate.origin() {
            Some((node, id)) => self.by_origin.get(&(node.to_string(), id)).copied(),
            None => self
                .by_content
                .get(&(
                    candidate.author.clone(),
                    candidate.body.clone(),
                    candidate.created_at,
                ))
                .copied(),
        }
    }
}

/// The local message log: append-only rows plus the dedup indexes over them.
///
/// Every check-then-write runs under the table lock, so two concurrent
/// appliers of the same origin id cannot both decide "not a duplicate".
pub struct MessageLog {
    node_id: String,
    journal: Journal<MessageEvent>,
    table: Mutex<MessageTable>,
}

impl MessageLog {
    pub fn open(dir: &Path, node_id: &str) -> Result<Self> {
        let (journal, events) = Journal::<MessageEvent>::open(dir, "messages")?;

        let mut table = MessageTable {
            next_id: 1,
            ..Default::default()
        };
        for event in events {
            match event {
                MessageEvent::Stored { message } => table.index(message),
                MessageEvent::SyncState { local_id, state } => {
                    if let Some(row) = table.rows.get_mut(&local_id) {
                        row.sync_state = state;
                    }
                }
            }
        }

        tracing::info!(
            "[STORE messages] opened for node {} with {} rows (next local_id {})",
            node_id,
            table.rows.len(),
            table.next_id
        );

        Ok(MessageLog {
            node_id: node_id.to_string(),
            journal,
            table: Mutex::new(table),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MessageTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Store a message created on this node. Its origin is `(this node, local_id)`.
    pub fn insert_local(&self, author: &str, body: &str) -> Result<Message> {
        let author = author.trim();
        let body = body.trim();
        if author.is_empty() {
            return Err(SyncboardError::MalformedInput("author is required".into()));
        }
        if body.is_empty() {
            return Err(SyncboardError::MalformedInput("body is required".into()));
        }

        let mut table = self.lock();
        let local_id = table.next_id;
        let message = Message {
            local_id,
            origin_node_id: self.node_id.clone(),
            origin_local_id: local_id,
            author: author.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
            sync_state: SyncState::Pending,
        };

        self.journal.append(&MessageEvent::Stored {
            message: message.clone(),
        })?;
        table.index(message.clone());
        Ok(message)
    }

    /// Atomically check for an equivalent row and insert the candidate if none exists.
    ///
    /// Applied rows are stored as `synced`. A candidate without an origin id is
    /// adopted under this node's identity once the content check passes.
    pub fn apply_replicated(&self, candidate: &MessageSnapshot) -> Result<ApplyOutcome> {
        let mut table = self.lock();
        if let Some(existing) = table.find_duplicate(candidate) {
            return Ok(ApplyOutcome::Duplicate(existing));
        }

        let local_id = table.next_id;
        let (origin_node_id, origin_local_id) = match candidate.origin() {
            Some((node, id)) => (node.to_string(), id),
            None => (self.node_id.clone(), local_id),
        };
        let message = Message {
            local_id,
            origin_node_id,
            origin_local_id,
            author: candidate.author.clone(),
            body: candidate.body.clone(),
            created_at: candidate.created_at,
            sync_state: SyncState::Synced,
        };

        self.journal.append(&MessageEvent::Stored {
            message: message.clone(),
        })?;
        table.index(message.clone());
        Ok(ApplyOutcome::Applied(message))
    }

    pub fn find_duplicate(&self, candidate: &MessageSnapshot) -> Option<u64> {
        self.lock().find_duplicate(candidate)
    }

    pub fn set_sync_state(&self, local_id: u64, state: SyncState) -> Result<()> {
        let mut table = self.lock();
        let current = match table.rows.get(&local_id) {
            Some(row) => row.sync_state,
            None => return Err(SyncboardError::MessageNotFound(local_id)),
        };
        if current == state {
            return Ok(());
        }

        self.journal
            .append(&MessageEvent::SyncState { local_id, state })?;
        if let Some(row) = table.rows.get_mut(&local_id) {
            row.sync_state = state;
        }
        Ok(())
    }

    pub fn get(&self, local_id: u64) -> Option<Message> {
        self.lock().rows.get(&local_id).cloned()
    }

    pub fn count(&self) -> usize {
        self.lock().rows.len()
    }

    /// All rows ascending by `created_at`, ties broken by `local_id`.
    pub fn list(&self) -> Vec<Message> {
        self.list_since(None)
    }

    /// Rows with `created_at >= since`, ascending by `created_at`.
    pub fn list_since(&self, since: Option<DateTime<Utc>>) -> Vec<Message> {
        let table = self.lock();
        let mut rows: Vec<Message> = table
            .rows
            .values()
            .filter(|m| since.map_or(true, |s| m.created_at >= s))
            .cloned()
            .collect();
        drop(table);
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.local_id.cmp(&b.local_id))
        });
        rows
    }
}
