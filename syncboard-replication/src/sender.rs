use chrono::Utc;
use std::sync::Arc;
use syncboard::{DeliveryStatus, MessageSnapshot, Store, SyncRecord, SyncState};

use crate::error::ReplicationError;
use crate::peer::PeerClient;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Failed { attempts: u32, last_error: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// Pushes stored messages to peers with bounded retries.
///
/// Every attempt replaces the `(message, peer)` SyncRecord. A storage failure
/// aborts the delivery unit and is returned as `ReplicationError::Storage`.
pub struct ReplicationSender {
    store: Arc<Store>,
    peer_ids: Vec<String>,
    policy: RetryPolicy,
}

impl ReplicationSender {
    pub fn new(store: Arc<Store>, peer_ids: Vec<String>, policy: RetryPolicy) -> Self {
        Self {
            store,
            peer_ids,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Fresh delivery with the full retry budget. On exhaustion the message
    /// goes to the offline queue for `peer` and is marked `failed`.
    pub async fn deliver(
        &self,
        message_id: u64,
        snapshot: &MessageSnapshot,
        peer: &PeerClient,
    ) -> Result<DeliveryOutcome, ReplicationError> {
        let outcome = self.attempt(message_id, snapshot, peer, self.policy).await?;

        if let DeliveryOutcome::Failed { attempts, last_error } = &outcome {
            let entry =
                self.store
                    .offline_queue()
                    .enqueue(peer.peer_id(), message_id, snapshot.clone())?;
            self.store
                .messages()
                .set_sync_state(message_id, SyncState::Failed)?;
            tracing::warn!(
                "[SEND {}] message {} failed after {} attempts ({}), queued as {}",
                peer.peer_id(),
                message_id,
                attempts,
                last_error,
                entry.queue_id
            );
        }
        Ok(outcome)
    }

    /// Run up to `policy.max_attempts` sequential attempts without queueing.
    pub async fn attempt(
        &self,
        message_id: u64,
        snapshot: &MessageSnapshot,
        peer: &PeerClient,
        policy: RetryPolicy,
    ) -> Result<DeliveryOutcome, ReplicationError> {
        let mut last_error = String::new();

        for attempt in 0..policy.max_attempts {
            let attempts = attempt + 1;
            match peer.push_message(snapshot).await {
                Ok(resp) => {
                    self.record(message_id, peer.peer_id(), DeliveryStatus::Success, attempts)?;
                    self.settle(message_id, snapshot)?;
                    tracing::info!(
                        "[SEND {}] message {} delivered as remote {} (attempt {})",
                        peer.peer_id(),
                        message_id,
                        resp.local_id,
                        attempts
                    );
                    return Ok(DeliveryOutcome::Delivered { attempts });
                }
                Err(e) => {
                    let exhausted = attempts == policy.max_attempts;
                    let status = if exhausted {
                        DeliveryStatus::Failed
                    } else {
                        DeliveryStatus::Pending
                    };
                    self.record(message_id, peer.peer_id(), status, attempts)?;
                    tracing::debug!(
                        "[SEND {}] attempt {}/{} for message {} failed: {}",
                        peer.peer_id(),
                        attempts,
                        policy.max_attempts,
                        message_id,
                        e
                    );
                    last_error = e.to_string();
                    if !exhausted {
                        tokio::time::sleep(policy.delay_after(attempt)).await;
                    }
                }
            }
        }

        Ok(DeliveryOutcome::Failed {
            attempts: policy.max_attempts,
            last_error,
        })
    }

    fn record(
        &self,
        message_id: u64,
        peer_id: &str,
        status: DeliveryStatus,
        attempts: u32,
    ) -> Result<(), ReplicationError> {
        self.store.sync_records().upsert(SyncRecord {
            message_id,
            peer_id: peer_id.to_string(),
            status,
            attempts,
            last_attempt_at: Utc::now(),
        })?;
        Ok(())
    }

    /// Mark the message `synced` once every peer it targets has a success record.
    fn settle(&self, message_id: u64, snapshot: &MessageSnapshot) -> Result<(), ReplicationError> {
        let origin = snapshot.origin_node_id.as_deref();
        let records = self.store.sync_records();
        let all_delivered = self
            .peer_ids
            .iter()
            .filter(|peer_id| Some(peer_id.as_str()) != origin)
            .all(|peer_id| {
                records
                    .get(message_id, peer_id)
                    .is_some_and(|r| r.status == DeliveryStatus::Success)
            });

        if all_delivered {
            self.store
                .messages()
                .set_sync_state(message_id, SyncState::Synced)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{peer_client, success_body};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(5), Duration::from_millis(20))
    }

    /// Fails every push and notes the stored record as each request arrives.
    struct RecordWatcher {
        store: Arc<Store>,
        message_id: u64,
        seen: Arc<Mutex<Vec<Option<(u32, DeliveryStatus)>>>>,
    }

    impl Respond for RecordWatcher {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            let record = self
                .store
                .sync_records()
                .get(self.message_id, "m")
                .map(|r| (r.attempts, r.status));
            self.seen.lock().unwrap().push(record);
            ResponseTemplate::new(500)
        }
    }

    #[tokio::test]
    async fn test_retry_terminates_and_queues() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path(), "s1").unwrap();
        let message = store.messages().insert_local("alice", "hi").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync_message"))
            .respond_with(RecordWatcher {
                store: Arc::clone(&store),
                message_id: message.local_id,
                seen: Arc::clone(&seen),
            })
            .expect(3)
            .mount(&server)
            .await;

        let sender = ReplicationSender::new(Arc::clone(&store), vec!["m".into()], fast_policy(3));
        let peer = peer_client("m", &server.uri());

        let outcome = sender
            .deliver(message.local_id, &message.snapshot(), &peer)
            .await
            .unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Failed { attempts: 3, .. }));

        // Each attempt is recorded before the next one goes out
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                None,
                Some((1, DeliveryStatus::Pending)),
                Some((2, DeliveryStatus::Pending)),
            ]
        );
        let record = store.sync_records().get(message.local_id, "m").unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempts, 3);

        assert_eq!(store.offline_queue().pending_for("m"), 1);
        assert_eq!(
            store.messages().get(message.local_id).unwrap().sync_state,
            SyncState::Failed
        );
    }

    #[tokio::test]
    async fn test_success_after_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync_message"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sync_message"))
            .respond_with(success_body(11))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path(), "s1").unwrap();
        let message = store.messages().insert_local("alice", "hi").unwrap();
        let sender = ReplicationSender::new(Arc::clone(&store), vec!["m".into()], fast_policy(3));
        let peer = peer_client("m", &server.uri());

        let outcome = sender
            .deliver(message.local_id, &message.snapshot(), &peer)
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 2 });

        let record = store.sync_records().get(message.local_id, "m").unwrap();
        assert_eq!(record.status, DeliveryStatus::Success);
        assert_eq!(record.attempts, 2);
        assert!(store.offline_queue().is_empty());
        assert_eq!(
            store.messages().get(message.local_id).unwrap().sync_state,
            SyncState::Synced
        );
    }

    #[tokio::test]
    async fn test_synced_only_after_every_target() {
        let up = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync_message"))
            .respond_with(success_body(1))
            .mount(&up)
            .await;

        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path(), "m").unwrap();
        let message = store.messages().insert_local("bob", "yo").unwrap();
        let sender = ReplicationSender::new(
            Arc::clone(&store),
            vec!["s1".into(), "s2".into()],
            fast_policy(1),
        );

        sender
            .deliver(message.local_id, &message.snapshot(), &peer_client("s1", &up.uri()))
            .await
            .unwrap();
        assert_eq!(
            store.messages().get(message.local_id).unwrap().sync_state,
            SyncState::Pending
        );

        sender
            .deliver(message.local_id, &message.snapshot(), &peer_client("s2", &up.uri()))
            .await
            .unwrap();
        assert_eq!(
            store.messages().get(message.local_id).unwrap().sync_state,
            SyncState::Synced
        );
    }

    #[tokio::test]
    async fn test_relayed_message_skips_origin_when_settling() {
        let up = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync_message"))
            .respond_with(success_body(1))
            .mount(&up)
            .await;

        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path(), "m").unwrap();
        let relayed = MessageSnapshot {
            origin_node_id: Some("s1".into()),
            origin_local_id: Some(1),
            author: "alice".into(),
            body: "hi".into(),
            created_at: Utc::now(),
        };
        let local_id = store.messages().apply_replicated(&relayed).unwrap().local_id();
        store
            .messages()
            .set_sync_state(local_id, SyncState::Pending)
            .unwrap();

        let sender = ReplicationSender::new(
            Arc::clone(&store),
            vec!["s1".into(), "s2".into()],
            fast_policy(1),
        );
        sender
            .deliver(local_id, &relayed, &peer_client("s2", &up.uri()))
            .await
            .unwrap();
        assert_eq!(
            store.messages().get(local_id).unwrap().sync_state,
            SyncState::Synced
        );
    }
}
