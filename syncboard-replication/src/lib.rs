//! Replication engine for syncboard nodes.
//!
//! New local messages go out through per-peer [`dispatch`] lanes to the
//! [`sender`], which retries with backoff and falls back to the durable
//! [`offline`] queue. The [`health`] monitor drains that queue when a peer
//! comes back, and the [`catchup`] puller repairs anything the push path
//! missed. Every replicated insert passes through the [`dedup`] guard.

pub mod catchup;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod manager;
pub mod offline;
pub mod peer;
pub mod retry;
pub mod sender;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{NodeConfig, NodeRole, PeerConfig, SyncSettings};
pub use error::ReplicationError;
pub use manager::ReplicationManager;
