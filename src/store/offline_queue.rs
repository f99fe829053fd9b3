use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::journal::Journal;
use crate::error::Result;
use crate::types::{MessageSnapshot, OfflineQueueEntry};

const COMPACT_MIN_LINES: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum QueueEvent {
    Enqueued { entry: OfflineQueueEntry },
    Removed { queue_id: u64 },
}

struct QueueState {
    entries: BTreeMap<u64, OfflineQueueEntry>,
    next_id: u64,
    journal_lines: usize,
}

/// Durable backlog of undelivered messages, FIFO per peer.
///
/// `queue_id` grows monotonically, so ascending `queue_id` within a peer is
/// enqueue order.
pub struct OfflineQueueTable {
    journal: Journal<QueueEvent>,
    state: Mutex<QueueState>,
}

impl OfflineQueueTable {
    pub fn open(dir: &Path) -> Result<Self> {
        let (journal, events) = Journal::<QueueEvent>::open(dir, "offline_queue")?;
        let journal_lines = events.len();

        let mut entries = BTreeMap::new();
        let mut next_id = 1;
        for event in events {
            match event {
                QueueEvent::Enqueued { entry } => {
                    next_id = next_id.max(entry.queue_id + 1);
                    entries.insert(entry.queue_id, entry);
                }
                QueueEvent::Removed { queue_id } => {
                    entries.remove(&queue_id);
                }
            }
        }

        if !entries.is_empty() {
            tracing::info!(
                "[STORE offline_queue] {} entries awaiting delivery",
                entries.len()
            );
        }

        let table = OfflineQueueTable {
            journal,
            state: Mutex::new(QueueState {
                entries,
                next_id,
                journal_lines,
            }),
        };
        {
            let mut state = table.lock();
            table.maybe_compact(&mut state)?;
        }
        Ok(table)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn maybe_compact(&self, state: &mut QueueState) -> Result<()> {
        if state.journal_lines < COMPACT_MIN_LINES || state.journal_lines <= state.entries.len() * 2
        {
            return Ok(());
        }
        let live: Vec<QueueEvent> = state
            .entries
            .values()
            .cloned()
            .map(|entry| QueueEvent::Enqueued { entry })
            .collect();
        self.journal.compact(&live)?;
        state.journal_lines = live.len();
        Ok(())
    }

    /// Append an entry. Enqueuing the same `(peer, message)` twice is allowed;
    /// both copies get delivered and the receiver deduplicates.
    pub fn enqueue(
        &self,
        peer_id: &str,
        message_id: u64,
        snapshot: MessageSnapshot,
    ) -> Result<OfflineQueueEntry> {
        let mut state = self.lock();
        let entry = OfflineQueueEntry {
            queue_id: state.next_id,
            message_id,
            peer_id: peer_id.to_string(),
            message_snapshot: snapshot,
            enqueued_at: Utc::now(),
        };
        self.journal.append(&QueueEvent::Enqueued {
            entry: entry.clone(),
        })?;
        state.journal_lines += 1;
        state.next_id += 1;
        state.entries.insert(entry.queue_id, entry.clone());
        Ok(entry)
    }

    /// Oldest entry for `peer_id`, if any.
    pub fn front(&self, peer_id: &str) -> Option<OfflineQueueEntry> {
        self.peek(peer_id, 1).into_iter().next()
    }

    /// Up to `limit` oldest entries for `peer_id`, oldest first.
    pub fn peek(&self, peer_id: &str, limit: usize) -> Vec<OfflineQueueEntry> {
        self.lock()
            .entries
            .values()
            .filter(|e| e.peer_id == peer_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Remove a delivered entry. Returns false if it was already gone.
    pub fn remove(&self, queue_id: u64) -> Result<bool> {
        let mut state = self.lock();
        if !state.entries.contains_key(&queue_id) {
            return Ok(false);
        }
        self.journal.append(&QueueEvent::Removed { queue_id })?;
        state.journal_lines += 1;
        state.entries.remove(&queue_id);
        self.maybe_compact(&mut state)?;
        Ok(true)
    }

    /// Whether `message_id` is queued for `peer_id` at least once.
    pub fn contains(&self, peer_id: &str, message_id: u64) -> bool {
        self.lock()
            .entries
            .values()
            .any(|e| e.peer_id == peer_id && e.message_id == message_id)
    }

    pub fn pending_for(&self, peer_id: &str) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| e.peer_id == peer_id)
            .count()
    }

    pub fn pending_by_peer(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.lock().entries.values() {
            *counts.entry(entry.peer_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
