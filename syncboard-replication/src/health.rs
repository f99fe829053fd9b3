use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::peer::PeerClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerHealth {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHealthState {
    pub peer_id: String,
    pub health: PeerHealth,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl PeerHealthState {
    pub fn reachable(&self) -> bool {
        self.health == PeerHealth::Healthy
    }
}

/// A change of a peer's health. Repeated identical observations produce none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Unknown/Unhealthy -> Healthy
    Recovered,
    /// Unknown/Healthy -> Unhealthy
    Lost,
}

/// In-memory per-peer liveness, recomputed on every probe round.
pub struct HealthMonitor {
    peers: Vec<Arc<PeerClient>>,
    states: DashMap<String, PeerHealthState>,
}

impl HealthMonitor {
    pub fn new(peers: Vec<Arc<PeerClient>>) -> Self {
        let states = DashMap::new();
        for peer in &peers {
            states.insert(
                peer.peer_id().to_string(),
                PeerHealthState {
                    peer_id: peer.peer_id().to_string(),
                    health: PeerHealth::Unknown,
                    last_checked_at: None,
                },
            );
        }
        Self { peers, states }
    }

    /// Record one probe result and return the transition it caused, if any.
    pub fn observe(&self, peer_id: &str, reachable: bool) -> Option<Transition> {
        let mut state = self
            .states
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerHealthState {
                peer_id: peer_id.to_string(),
                health: PeerHealth::Unknown,
                last_checked_at: None,
            });

        state.last_checked_at = Some(Utc::now());
        let next = if reachable {
            PeerHealth::Healthy
        } else {
            PeerHealth::Unhealthy
        };
        if state.health == next {
            return None;
        }
        state.health = next;

        if reachable {
            Some(Transition::Recovered)
        } else {
            Some(Transition::Lost)
        }
    }

    /// Probe every peer concurrently and fold the results into the state machine.
    pub async fn check_all(&self) -> Vec<(Arc<PeerClient>, Transition)> {
        let mut probes = JoinSet::new();
        for peer in &self.peers {
            let peer = Arc::clone(peer);
            probes.spawn(async move {
                let result = peer.probe().await;
                (peer, result)
            });
        }

        let mut transitions = Vec::new();
        while let Some(joined) = probes.join_next().await {
            let (peer, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("[HEALTH] probe task failed: {}", e);
                    continue;
                }
            };

            let transition = self.observe(peer.peer_id(), result.is_ok());
            match (&transition, &result) {
                (Some(Transition::Recovered), _) => {
                    tracing::info!("[HEALTH {}] peer is reachable", peer.peer_id())
                }
                (Some(Transition::Lost), Err(e)) => {
                    tracing::warn!("[HEALTH {}] peer is unreachable: {}", peer.peer_id(), e)
                }
                (None, Err(e)) => {
                    tracing::debug!("[HEALTH {}] still unreachable: {}", peer.peer_id(), e)
                }
                _ => {}
            }
            if let Some(transition) = transition {
                transitions.push((peer, transition));
            }
        }
        transitions
    }

    pub fn state(&self, peer_id: &str) -> Option<PeerHealthState> {
        self.states.get(peer_id).map(|s| s.clone())
    }

    pub fn is_unhealthy(&self, peer_id: &str) -> bool {
        self.states
            .get(peer_id)
            .is_some_and(|s| s.health == PeerHealth::Unhealthy)
    }

    /// Current states in configured peer order.
    pub fn states(&self) -> Vec<PeerHealthState> {
        self.peers
            .iter()
            .filter_map(|peer| self.state(peer.peer_id()))
            .collect()
    }
}
