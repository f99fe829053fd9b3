use dashmap::DashMap;
use std::sync::Arc;
use syncboard::{MessageSnapshot, OfflineQueueEntry, Store};

use crate::error::ReplicationError;
use crate::peer::PeerClient;
use crate::sender::{DeliveryOutcome, ReplicationSender};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub remaining: usize,
}

/// Delivers the durable backlog for a peer, oldest entry first.
pub struct OfflineQueue {
    store: Arc<Store>,
    sender: Arc<ReplicationSender>,
    /// One drain at a time per peer
    drain_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl OfflineQueue {
    pub fn new(store: Arc<Store>, sender: Arc<ReplicationSender>) -> Self {
        Self {
            store,
            sender,
            drain_locks: DashMap::new(),
        }
    }

    /// Always appends, even if the same (peer, message) is already queued.
    pub fn enqueue(
        &self,
        peer_id: &str,
        message_id: u64,
        snapshot: MessageSnapshot,
    ) -> Result<OfflineQueueEntry, ReplicationError> {
        let entry = self
            .store
            .offline_queue()
            .enqueue(peer_id, message_id, snapshot)?;
        tracing::info!(
            "[QUEUE {}] queued message {} as {}",
            peer_id,
            message_id,
            entry.queue_id
        );
        Ok(entry)
    }

    pub fn pending_for(&self, peer_id: &str) -> usize {
        self.store.offline_queue().pending_for(peer_id)
    }

    /// Deliver queued entries with one attempt each, stopping at the first failure.
    pub async fn drain(&self, peer: &PeerClient) -> Result<DrainReport, ReplicationError> {
        let peer_id = peer.peer_id();
        let lock = self
            .drain_locks
            .entry(peer_id.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let queue = self.store.offline_queue();
        let policy = self.sender.policy().single_attempt();
        let mut delivered = 0;

        while let Some(entry) = queue.front(peer_id) {
            let outcome = self
                .sender
                .attempt(entry.message_id, &entry.message_snapshot, peer, policy)
                .await?;
            match outcome {
                DeliveryOutcome::Delivered { .. } => {
                    queue.remove(entry.queue_id)?;
                    delivered += 1;
                }
                DeliveryOutcome::Failed { last_error, .. } => {
                    tracing::warn!(
                        "[QUEUE {}] drain stopped at entry {} (message {}): {}",
                        peer_id,
                        entry.queue_id,
                        entry.message_id,
                        last_error
                    );
                    break;
                }
            }
        }

        let report = DrainReport {
            delivered,
            remaining: queue.pending_for(peer_id),
        };
        if report.delivered > 0 || report.remaining > 0 {
            tracing::info!(
                "[QUEUE {}] drained {} entries, {} remaining",
                peer_id,
                report.delivered,
                report.remaining
            );
        }
        Ok(report)
    }
}
