use std::sync::Arc;
use std::time::Duration;
use syncboard::Store;
use syncboard_replication::{NodeConfig, NodeRole, PeerConfig, ReplicationManager, SyncSettings};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A live node: real store, real replication loops, real HTTP listener.
pub struct TestNode {
    pub url: String,
    pub manager: Arc<ReplicationManager>,
    pub store: Arc<Store>,
    shutdown: Option<oneshot::Sender<()>>,
    _dir: TempDir,
}

impl Drop for TestNode {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.manager.shutdown();
    }
}

/// Reserve a loopback address for a node that will be started later.
/// Until then nothing listens there, so peers see connection refused.
pub fn reserve_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

pub fn fast_settings() -> SyncSettings {
    SyncSettings {
        max_retries: 2,
        base_delay_ms: 10,
        max_delay_ms: 50,
        request_timeout_ms: 2_000,
        probe_timeout_ms: 500,
        health_check_interval_secs: 1,
        catchup_interval_secs: 1,
        drain_interval_secs: 1,
        ..SyncSettings::default()
    }
}

pub async fn spawn_node(
    node_id: &str,
    role: NodeRole,
    addr: &str,
    peers: &[(&str, &str)],
) -> TestNode {
    let dir = TempDir::new().unwrap();
    let config = NodeConfig {
        node_id: node_id.to_string(),
        role,
        bind_addr: addr.to_string(),
        peers: peers
            .iter()
            .map(|(id, addr)| PeerConfig {
                node_id: id.to_string(),
                addr: format!("http://{}", addr),
            })
            .collect(),
        sync: fast_settings(),
    };
    config.validate().unwrap();

    let store = Store::open(dir.path(), node_id).unwrap();
    let manager = ReplicationManager::new(config, Arc::clone(&store));
    let listener = TcpListener::bind(addr).await.unwrap();
    manager.start();

    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(syncboard_http::run(listener, Arc::clone(&manager), async {
        let _ = rx.await;
    }));

    TestNode {
        url: format!("http://{}", addr),
        manager,
        store,
        shutdown: Some(tx),
        _dir: dir,
    }
}

/// Poll `condition` every 50ms until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

/// Rows in `store` carrying the given global identity.
pub fn copies_of(store: &Store, origin_node_id: &str, origin_local_id: u64) -> usize {
    store
        .messages()
        .list()
        .iter()
        .filter(|m| m.origin_node_id == origin_node_id && m.origin_local_id == origin_local_id)
        .count()
}
