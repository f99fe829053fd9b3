use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use syncboard::SyncboardError;

use crate::retry::RetryPolicy;

/// Fixed at configuration time; never negotiated between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Master,
    Slave,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Slave => write!(f, "slave"),
        }
    }
}

impl FromStr for NodeRole {
    type Err = SyncboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(NodeRole::Master),
            "slave" => Ok(NodeRole::Slave),
            other => Err(SyncboardError::Config(format!(
                "unknown node role '{}', expected 'master' or 'slave'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    #[serde(default)]
    pub role: NodeRole,
    pub bind_addr: String,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: String,
    pub addr: String, // e.g., "http://10.0.1.2:5000"
}

/// Timing and sizing knobs of the replication engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Attempts per fresh delivery of one message to one peer.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Per push / pull call.
    pub request_timeout_ms: u64,
    /// Per health probe.
    pub probe_timeout_ms: u64,
    pub health_check_interval_secs: u64,
    pub catchup_interval_secs: u64,
    pub drain_interval_secs: u64,
    pub workers_per_peer: usize,
    pub lane_capacity: usize,
    /// Run the catch-up puller against peers. Unset means: slaves pull, masters don't.
    pub pull_from_peers: Option<bool>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            request_timeout_ms: 10_000,
            probe_timeout_ms: 5_000,
            health_check_interval_secs: 30,
            catchup_interval_secs: 3,
            drain_interval_secs: 30,
            workers_per_peer: 2,
            lane_capacity: 256,
            pull_from_peers: None,
        }
    }
}

impl SyncSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn catchup_interval(&self) -> Duration {
        Duration::from_secs(self.catchup_interval_secs.max(1))
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs.max(1))
    }
}

impl NodeConfig {
    /// Load node configuration from {data_dir}/node.json or fall back to the environment
    pub fn load_or_default(data_dir: &Path) -> Self {
        let node_json = data_dir.join("node.json");

        if node_json.exists() {
            match std::fs::read_to_string(&node_json) {
                Ok(content) => match serde_json::from_str::<NodeConfig>(&content) {
                    Ok(config) => {
                        tracing::info!(
                            "Loaded node config: node_id={}, role={}, peers={}",
                            config.node_id,
                            config.role,
                            config.peers.len()
                        );
                        return config;
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse node.json: {}, using environment", e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read node.json: {}, using environment", e);
                }
            }
        }

        let config = Self::from_env();
        tracing::info!(
            "No usable node.json, configured from environment: node_id={}, role={}, peers={}",
            config.node_id,
            config.role,
            config.peers.len()
        );
        config
    }

    /// Build a config from `SYNCBOARD_*` variables. Malformed values are logged and ignored.
    pub fn from_env() -> Self {
        let node_id = std::env::var("SYNCBOARD_NODE_ID").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string())
        });

        let role = match std::env::var("SYNCBOARD_ROLE") {
            Ok(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::error!("{}, defaulting to master", e);
                NodeRole::Master
            }),
            Err(_) => NodeRole::Master,
        };

        let bind_addr =
            std::env::var("SYNCBOARD_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:5000".to_string());

        let peers = match std::env::var("SYNCBOARD_PEERS") {
            Ok(raw) => parse_peers(&raw).unwrap_or_else(|e| {
                tracing::error!("{}, starting without peers", e);
                vec![]
            }),
            Err(_) => vec![],
        };

        NodeConfig {
            node_id,
            role,
            bind_addr,
            peers,
            sync: SyncSettings::default(),
        }
    }

    pub fn validate(&self) -> Result<(), SyncboardError> {
        if self.node_id.trim().is_empty() {
            return Err(SyncboardError::Config("node_id must not be empty".into()));
        }
        if self.role == NodeRole::Slave && self.peers.len() != 1 {
            return Err(SyncboardError::Config(format!(
                "a slave replicates with exactly one master, got {} peers",
                self.peers.len()
            )));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.node_id == self.node_id {
                return Err(SyncboardError::Config(format!(
                    "peer {} has this node's own id",
                    peer.node_id
                )));
            }
            if !seen.insert(peer.node_id.as_str()) {
                return Err(SyncboardError::Config(format!(
                    "duplicate peer id {}",
                    peer.node_id
                )));
            }
            if !peer.addr.starts_with("http://") && !peer.addr.starts_with("https://") {
                return Err(SyncboardError::Config(format!(
                    "peer {} address must be an http(s) URL, got {}",
                    peer.node_id, peer.addr
                )));
            }
        }

        if self.sync.max_retries == 0 {
            return Err(SyncboardError::Config("max_retries must be at least 1".into()));
        }
        if self.sync.workers_per_peer == 0 || self.sync.lane_capacity == 0 {
            return Err(SyncboardError::Config(
                "workers_per_peer and lane_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn pulls_from_peers(&self) -> bool {
        self.sync
            .pull_from_peers
            .unwrap_or(self.role == NodeRole::Slave)
    }
}

/// Parse `id=url` pairs separated by commas, e.g. `master=http://10.0.0.1:5000`.
pub fn parse_peers(raw: &str) -> Result<Vec<PeerConfig>, SyncboardError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (node_id, addr) = pair.split_once('=').ok_or_else(|| {
                SyncboardError::Config(format!("peer '{}' is not in id=url form", pair))
            })?;
            let node_id = node_id.trim();
            let addr = addr.trim().trim_end_matches('/');
            if node_id.is_empty() || addr.is_empty() {
                return Err(SyncboardError::Config(format!(
                    "peer '{}' is not in id=url form",
                    pair
                )));
            }
            Ok(PeerConfig {
                node_id: node_id.to_string(),
                addr: addr.to_string(),
            })
        })
        .collect()
}
