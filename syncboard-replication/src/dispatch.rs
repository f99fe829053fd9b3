use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use syncboard::{MessageSnapshot, SyncboardError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::error::ReplicationError;
use crate::offline::OfflineQueue;
use crate::peer::PeerClient;
use crate::sender::ReplicationSender;

#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub message_id: u64,
    pub snapshot: MessageSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Handed to the peer's delivery workers
    Lane,
    /// Lane was full or closed; written straight to the offline queue
    Queued(u64),
}

struct Lane {
    tx: mpsc::Sender<DeliveryJob>,
    rx: Option<mpsc::Receiver<DeliveryJob>>,
}

/// One bounded channel per peer, served by a fixed number of workers.
///
/// Channels exist from construction; workers only run after `start`. A full
/// lane never blocks the caller, the job spills to the offline queue instead.
pub struct Dispatcher {
    lanes: Mutex<HashMap<String, Lane>>,
    offline_queue: Arc<OfflineQueue>,
}

impl Dispatcher {
    pub fn new(peer_ids: &[String], capacity: usize, offline_queue: Arc<OfflineQueue>) -> Self {
        let lanes = peer_ids
            .iter()
            .map(|peer_id| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (peer_id.clone(), Lane { tx, rx: Some(rx) })
            })
            .collect();
        Self {
            lanes: Mutex::new(lanes),
            offline_queue,
        }
    }

    /// Spawn `workers_per_peer` delivery tasks for each peer. Only the first call spawns.
    pub fn start(
        &self,
        peers: &[Arc<PeerClient>],
        sender: Arc<ReplicationSender>,
        workers_per_peer: usize,
    ) -> Vec<JoinHandle<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let mut handles = Vec::new();

        for peer in peers {
            let Some(rx) = lanes.get_mut(peer.peer_id()).and_then(|lane| lane.rx.take()) else {
                continue;
            };
            let rx = Arc::new(tokio::sync::Mutex::new(rx));

            for _ in 0..workers_per_peer.max(1) {
                let rx = Arc::clone(&rx);
                let peer = Arc::clone(peer);
                let sender = Arc::clone(&sender);
                handles.push(tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        if let Err(e) = sender.deliver(job.message_id, &job.snapshot, &peer).await {
                            tracing::error!(
                                "[SEND {}] delivery of message {} aborted: {}",
                                peer.peer_id(),
                                job.message_id,
                                e
                            );
                        }
                    }
                }));
            }
        }
        handles
    }

    pub fn dispatch(&self, peer_id: &str, job: DeliveryJob) -> Result<Dispatched, ReplicationError> {
        let tx = {
            let lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            lanes.get(peer_id).map(|lane| lane.tx.clone())
        };
        let Some(tx) = tx else {
            return Err(SyncboardError::Config(format!("no lane for peer {}", peer_id)).into());
        };

        match tx.try_send(job) {
            Ok(()) => Ok(Dispatched::Lane),
            Err(TrySendError::Full(job)) | Err(TrySendError::Closed(job)) => {
                tracing::warn!(
                    "[SEND {}] lane saturated, message {} goes to the offline queue",
                    peer_id,
                    job.message_id
                );
                let entry = self
                    .offline_queue
                    .enqueue(peer_id, job.message_id, job.snapshot)?;
                Ok(Dispatched::Queued(entry.queue_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::testing::{peer_client, success_body};
    use std::time::Duration;
    use syncboard::{Store, SyncState};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer};

    fn setup(tmp: &TempDir, capacity: usize) -> (Arc<Store>, Arc<ReplicationSender>, Dispatcher) {
        let store = Store::open(tmp.path(), "m").unwrap();
        let sender = Arc::new(ReplicationSender::new(
            Arc::clone(&store),
            vec!["s1".into()],
            RetryPolicy::new(1, Duration::from_millis(5), Duration::from_millis(5)),
        ));
        let queue = Arc::new(OfflineQueue::new(Arc::clone(&store), Arc::clone(&sender)));
        let dispatcher = Dispatcher::new(&["s1".to_string()], capacity, queue);
        (store, sender, dispatcher)
    }

    #[tokio::test]
    async fn test_full_lane_spills_to_offline_queue() {
        let tmp = TempDir::new().unwrap();
        let (store, _sender, dispatcher) = setup(&tmp, 1);

        let mut outcomes = Vec::new();
        for body in ["a", "b", "c"] {
            let message = store.messages().insert_local("bob", body).unwrap();
            outcomes.push(
                dispatcher
                    .dispatch(
                        "s1",
                        DeliveryJob {
                            message_id: message.local_id,
                            snapshot: message.snapshot(),
                        },
                    )
                    .unwrap(),
            );
        }

        // No workers yet: one job fits, the rest spill
        assert_eq!(outcomes[0], Dispatched::Lane);
        assert!(matches!(outcomes[1], Dispatched::Queued(_)));
        assert!(matches!(outcomes[2], Dispatched::Queued(_)));
        assert_eq!(store.offline_queue().pending_for("s1"), 2);
    }

    #[tokio::test]
    async fn test_workers_deliver_lane_jobs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync_message"))
            .respond_with(success_body(1))
            .expect(2)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let (store, sender, dispatcher) = setup(&tmp, 8);
        let peers = vec![Arc::new(peer_client("s1", &server.uri()))];
        assert_eq!(dispatcher.start(&peers, Arc::clone(&sender), 2).len(), 2);
        // Second start is a no-op
        assert!(dispatcher.start(&peers, sender, 2).is_empty());

        for body in ["a", "b"] {
            let message = store.messages().insert_local("bob", body).unwrap();
            dispatcher
                .dispatch(
                    "s1",
                    DeliveryJob {
                        message_id: message.local_id,
                        snapshot: message.snapshot(),
                    },
                )
                .unwrap();
        }

        for _ in 0..100 {
            let synced = store
                .messages()
                .list()
                .iter()
                .all(|m| m.sync_state == SyncState::Synced);
            if synced {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(store
            .messages()
            .list()
            .iter()
            .all(|m| m.sync_state == SyncState::Synced));
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let tmp = TempDir::new().unwrap();
        let (store, _sender, dispatcher) = setup(&tmp, 1);
        let message = store.messages().insert_local("bob", "x").unwrap();
        let job = DeliveryJob {
            message_id: message.local_id,
            snapshot: message.snapshot(),
        };
        assert!(dispatcher.dispatch("nobody", job).is_err());
    }
}
