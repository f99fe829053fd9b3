//! # Syncboard
//!
//! A replicated, append-only log of short text messages shared between one
//! master node and one or more slave nodes. Every node keeps its own durable
//! copy; messages created anywhere eventually show up everywhere, across
//! transient partitions.
//!
//! This crate holds the data model and the durable local [`Store`]. The
//! replication engine lives in `syncboard-replication`, the HTTP surface in
//! `syncboard-http`, and the `syncboard` binary in `syncboard-server`.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use syncboard::{ApplyOutcome, Store};
//!
//! # fn main() -> syncboard::Result<()> {
//! let store = Store::open(std::path::Path::new("./data"), "slave-1")?;
//!
//! // A local message carries (this node, local_id) as its global identity.
//! let message = store.messages().insert_local("alice", "hi")?;
//! assert_eq!(message.origin_node_id, "slave-1");
//!
//! // Applying the same origin twice stores exactly one row.
//! let snapshot = message.snapshot();
//! assert!(matches!(
//!     store.messages().apply_replicated(&snapshot)?,
//!     ApplyOutcome::Duplicate(_)
//! ));
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! | Feature | Dependencies | Use case |
//! |---------|-------------|----------|
//! | `axum-support` | axum | [`SyncboardError`] implements `IntoResponse` |

pub mod error;
pub mod store;
pub mod types;

pub use error::{Result, SyncboardError};
pub use store::{ApplyOutcome, Store};
pub use types::*;
