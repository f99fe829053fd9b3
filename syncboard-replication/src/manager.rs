use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use syncboard::{
    ApplyOutcome, DeliveryStatus, Message, MessageSnapshot, Store, SyncState, SyncboardError,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::catchup::CatchUpPuller;
use super::config::{NodeConfig, NodeRole};
use super::dedup::DedupGuard;
use super::dispatch::{DeliveryJob, Dispatcher};
use super::error::ReplicationError;
use super::health::{HealthMonitor, Transition};
use super::offline::{DrainReport, OfflineQueue};
use super::peer::PeerClient;
use super::sender::ReplicationSender;
use super::types::{HealthResponse, PeerStatus, SyncStatistic, SyncStatusReport};

/// Orchestrates replication to all peers: dispatch of new messages, ingest of
/// replicated ones, and the health / catch-up / drain background loops.
pub struct ReplicationManager {
    node_config: NodeConfig,
    store: Arc<Store>,
    peers: Vec<Arc<PeerClient>>,
    guard: DedupGuard,
    sender: Arc<ReplicationSender>,
    offline_queue: Arc<OfflineQueue>,
    dispatcher: Dispatcher,
    health: HealthMonitor,
    puller: CatchUpPuller,
    shutdown: Notify,
    stopping: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationManager {
    pub fn new(node_config: NodeConfig, store: Arc<Store>) -> Arc<Self> {
        let settings = &node_config.sync;
        let peers: Vec<Arc<PeerClient>> = node_config
            .peers
            .iter()
            .map(|peer_config| {
                Arc::new(PeerClient::new(
                    peer_config.node_id.clone(),
                    peer_config.addr.clone(),
                    settings.request_timeout(),
                    settings.probe_timeout(),
                ))
            })
            .collect();
        let peer_ids: Vec<String> = peers.iter().map(|p| p.peer_id().to_string()).collect();

        let guard = DedupGuard::new(Arc::clone(&store));
        let sender = Arc::new(ReplicationSender::new(
            Arc::clone(&store),
            peer_ids.clone(),
            settings.retry_policy(),
        ));
        let offline_queue = Arc::new(OfflineQueue::new(Arc::clone(&store), Arc::clone(&sender)));
        let dispatcher = Dispatcher::new(&peer_ids, settings.lane_capacity, Arc::clone(&offline_queue));
        let health = HealthMonitor::new(peers.clone());
        let puller = CatchUpPuller::new(Arc::clone(&store), guard.clone());

        Arc::new(Self {
            node_config,
            store,
            peers,
            guard,
            sender,
            offline_queue,
            dispatcher,
            health,
            puller,
            shutdown: Notify::new(),
            stopping: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_config.node_id
    }

    pub fn role(&self) -> NodeRole {
        self.node_config.role
    }

    pub fn config(&self) -> &NodeConfig {
        &self.node_config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn peer(&self, peer_id: &str) -> Option<&Arc<PeerClient>> {
        self.peers.iter().find(|p| p.peer_id() == peer_id)
    }

    /// Spawn delivery workers and background loops. Later calls do nothing.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() || self.peers.is_empty() {
            return;
        }

        if let Err(e) = self.requeue_unsent() {
            tracing::error!("[QUEUE] could not requeue undelivered messages: {}", e);
        }

        let settings = &self.node_config.sync;
        tasks.extend(self.dispatcher.start(
            &self.peers,
            Arc::clone(&self.sender),
            settings.workers_per_peer,
        ));
        tasks.push(tokio::spawn(Arc::clone(self).run_health_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).run_drain_loop()));
        if self.node_config.pulls_from_peers() {
            tasks.push(tokio::spawn(Arc::clone(self).run_catchup_loop()));
        }

        tracing::info!(
            "[REPL {}] started as {} with {} peers ({} tasks)",
            self.node_id(),
            self.role(),
            self.peers.len(),
            tasks.len()
        );
    }

    /// Stop the background loops and abandon in-flight deliveries.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Store a message created on this node and hand it to every peer.
    pub fn create_message(&self, author: &str, body: &str) -> Result<Message, SyncboardError> {
        let message = self.store.messages().insert_local(author, body)?;
        tracing::info!(
            "[INGEST] created local message {} by {}",
            message.local_id,
            message.author
        );
        self.replicate(&message)?;
        Ok(self
            .store
            .messages()
            .get(message.local_id)
            .unwrap_or(message))
    }

    /// Apply a message pushed by a peer. A master relays newly applied
    /// messages to every peer except the one it originated on.
    ///
    /// Only the apply can fail the call. Once the row is stored the push is
    /// acknowledged, since a retry from the peer would be deduplicated.
    pub fn ingest(&self, snapshot: &MessageSnapshot) -> Result<ApplyOutcome, SyncboardError> {
        let outcome = self.guard.apply(snapshot)?;
        if let ApplyOutcome::Applied(message) = &outcome {
            tracing::info!(
                "[INGEST] stored {}#{} as local {}",
                message.origin_node_id,
                message.origin_local_id,
                message.local_id
            );
            if self.role() == NodeRole::Master {
                self.relay(message);
            }
        }
        Ok(outcome)
    }

    /// A relayed row stays `pending` until every target acknowledged it, so a
    /// relay that fails here is picked up by `requeue_unsent` on restart.
    fn relay(&self, message: &Message) {
        if let Err(e) = self.replicate(message) {
            tracing::error!(
                "[INGEST] relay of {}#{} (local {}) failed: {}",
                message.origin_node_id,
                message.origin_local_id,
                message.local_id,
                e
            );
        }
    }

    fn targets<'a>(
        &'a self,
        message: &'a Message,
    ) -> impl Iterator<Item = &'a Arc<PeerClient>> + 'a {
        self.peers
            .iter()
            .filter(move |peer| !message.is_from(peer.peer_id()))
    }

    /// Dispatch to every peer except the message's origin. Returns the number of targets.
    fn replicate(&self, message: &Message) -> Result<usize, SyncboardError> {
        let targets: Vec<&Arc<PeerClient>> = self.targets(message).collect();

        let state = if targets.is_empty() {
            SyncState::Synced
        } else {
            SyncState::Pending
        };
        if message.sync_state != state {
            self.store.messages().set_sync_state(message.local_id, state)?;
        }
        if targets.is_empty() {
            return Ok(0);
        }

        let snapshot = message.snapshot();
        for peer in &targets {
            self.dispatcher.dispatch(
                peer.peer_id(),
                DeliveryJob {
                    message_id: message.local_id,
                    snapshot: snapshot.clone(),
                },
            )?;
        }
        Ok(targets.len())
    }

    /// Queue every unsettled message for each target that has neither a
    /// success record nor a queued entry. Lane jobs live only in memory, so
    /// this runs before the workers start and recovers pushes a restart lost.
    pub fn requeue_unsent(&self) -> Result<usize, ReplicationError> {
        let queue = self.store.offline_queue();
        let mut requeued = 0;

        for message in self.store.messages().list() {
            if message.sync_state == SyncState::Synced {
                continue;
            }
            let records = self.store.sync_records().for_message(message.local_id);
            for peer in self.targets(&message) {
                let peer_id = peer.peer_id();
                let delivered = records
                    .iter()
                    .any(|r| r.peer_id == peer_id && r.status == DeliveryStatus::Success);
                if delivered || queue.contains(peer_id, message.local_id) {
                    continue;
                }
                self.offline_queue
                    .enqueue(peer_id, message.local_id, message.snapshot())?;
                requeued += 1;
            }
        }

        if requeued > 0 {
            tracing::info!("[QUEUE] requeued {} undelivered pushes", requeued);
        }
        Ok(requeued)
    }

    pub fn messages_since(&self, since: Option<DateTime<Utc>>) -> Vec<Message> {
        self.store.messages().list_since(since)
    }

    pub async fn drain_peer(&self, peer_id: &str) -> Result<DrainReport, ReplicationError> {
        let peer = self.peer(peer_id).ok_or_else(|| {
            SyncboardError::Config(format!("unknown peer {}", peer_id))
        })?;
        self.offline_queue.drain(peer).await
    }

    pub async fn pull_peer(&self, peer_id: &str) -> Result<usize, ReplicationError> {
        let peer = self.peer(peer_id).ok_or_else(|| {
            SyncboardError::Config(format!("unknown peer {}", peer_id))
        })?;
        self.puller.pull(peer).await
    }

    /// One probe round. Recovered peers get a drain and, when pulling, a
    /// catch-up run, both spawned so the caller never waits on them.
    pub async fn check_peers(self: &Arc<Self>) -> Vec<(String, Transition)> {
        let transitions = self.health.check_all().await;
        let mut changed = Vec::with_capacity(transitions.len());

        for (peer, transition) in transitions {
            let peer_id = peer.peer_id().to_string();
            if transition == Transition::Recovered {
                self.spawn_drain(peer_id.clone());
                if self.node_config.pulls_from_peers() {
                    self.spawn_pull(peer_id.clone());
                }
            }
            changed.push((peer_id, transition));
        }
        changed
    }

    fn spawn_drain(self: &Arc<Self>, peer_id: String) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.drain_peer(&peer_id).await {
                tracing::error!("[QUEUE {}] drain aborted: {}", peer_id, e);
            }
        });
    }

    fn spawn_pull(self: &Arc<Self>, peer_id: String) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.pull_peer(&peer_id).await {
                log_pull_error(&peer_id, &e);
            }
        });
    }

    async fn run_health_loop(self: Arc<Self>) {
        // First tick fires immediately so peers leave Unknown right away
        let mut ticker = tokio::time::interval(self.node_config.sync.health_check_interval());

        loop {
            if self.is_stopping() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_peers().await;
                }
                _ = self.shutdown.notified() => break,
            }
        }
        tracing::info!("[HEALTH] monitor loop shutting down");
    }

    async fn run_catchup_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.node_config.sync.catchup_interval());

        loop {
            if self.is_stopping() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    for peer in &self.peers {
                        if self.health.is_unhealthy(peer.peer_id()) {
                            continue;
                        }
                        if let Err(e) = self.puller.pull(peer).await {
                            log_pull_error(peer.peer_id(), &e);
                        }
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }
        tracing::info!("[CATCHUP] puller loop shutting down");
    }

    async fn run_drain_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.node_config.sync.drain_interval());
        ticker.tick().await; // skip the first immediate tick

        loop {
            if self.is_stopping() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    for peer in &self.peers {
                        let peer_id = peer.peer_id();
                        if self.offline_queue.pending_for(peer_id) > 0
                            && !self.health.is_unhealthy(peer_id)
                        {
                            self.spawn_drain(peer_id.to_string());
                        }
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }
        tracing::info!("[QUEUE] drain loop shutting down");
    }

    pub fn health_response(&self) -> HealthResponse {
        HealthResponse {
            status: "healthy".to_string(),
            node_id: self.node_id().to_string(),
            node_role: self.role(),
            timestamp: Utc::now(),
            message_count: self.store.messages().count(),
        }
    }

    pub fn sync_status(&self) -> SyncStatusReport {
        let now = Utc::now();

        let mut counts: HashMap<(String, String), SyncStatistic> = HashMap::new();
        for record in self
            .store
            .sync_records()
            .recent(now - chrono::Duration::hours(1))
        {
            counts
                .entry((record.peer_id.clone(), record.status.to_string()))
                .or_insert_with(|| SyncStatistic {
                    peer_id: record.peer_id.clone(),
                    status: record.status,
                    count: 0,
                })
                .count += 1;
        }
        let mut sync_statistics: Vec<(_, SyncStatistic)> = counts.into_iter().collect();
        sync_statistics.sort_by(|a, b| a.0.cmp(&b.0));

        let peers = self
            .peers
            .iter()
            .filter_map(|peer| {
                self.health.state(peer.peer_id()).map(|state| PeerStatus {
                    peer_id: peer.peer_id().to_string(),
                    addr: peer.base_url().to_string(),
                    health: state.health,
                    last_checked_at: state.last_checked_at,
                    last_success_at: peer.last_success_at(),
                })
            })
            .collect();

        let watermarks: BTreeMap<String, DateTime<Utc>> = self
            .store
            .watermarks()
            .all()
            .into_iter()
            .map(|w| (w.peer_id, w.last_synced_at))
            .collect();

        SyncStatusReport {
            node_id: self.node_id().to_string(),
            node_role: self.role(),
            offline_messages: self.store.offline_queue().pending_by_peer(),
            sync_statistics: sync_statistics.into_iter().map(|(_, s)| s).collect(),
            peers,
            watermarks,
            message_count: self.store.messages().count(),
            timestamp: now,
        }
    }
}

fn log_pull_error(peer_id: &str, e: &ReplicationError) {
    if e.is_retryable() {
        tracing::debug!("[CATCHUP {}] pull failed: {}", peer_id, e);
    } else {
        tracing::error!("[CATCHUP {}] pull aborted: {}", peer_id, e);
    }
}

impl From<ReplicationError> for SyncboardError {
    fn from(e: ReplicationError) -> Self {
        match e {
            ReplicationError::Storage(inner) => inner,
            other => SyncboardError::Storage(other.to_string()),
        }
    }
}
