use chrono::{DateTime, Utc};
use std::sync::Arc;
use syncboard::{ApplyOutcome, Store};

use crate::dedup::DedupGuard;
use crate::error::ReplicationError;
use crate::peer::PeerClient;

/// Receiver-side repair: pulls what a peer created since our watermark for it.
pub struct CatchUpPuller {
    store: Arc<Store>,
    guard: DedupGuard,
}

impl CatchUpPuller {
    pub fn new(store: Arc<Store>, guard: DedupGuard) -> Self {
        Self { store, guard }
    }

    /// Returns how many rows were applied.
    ///
    /// The watermark only moves when something was applied, and then to the
    /// newest applied `created_at`. A pull of nothing but duplicates leaves it
    /// where it was.
    pub async fn pull(&self, peer: &PeerClient) -> Result<usize, ReplicationError> {
        let peer_id = peer.peer_id();
        let since = self.store.watermarks().get(peer_id);
        let batch = peer.fetch_since(since).await?;

        let mut applied = 0;
        let mut newest: Option<DateTime<Utc>> = None;
        for candidate in &batch {
            if let ApplyOutcome::Applied(message) = self.guard.apply(candidate)? {
                applied += 1;
                newest = newest.max(Some(message.created_at));
            }
        }

        if let Some(ts) = newest {
            self.store.watermarks().advance(peer_id, ts)?;
            tracing::info!(
                "[CATCHUP {}] applied {} of {} messages, watermark {}",
                peer_id,
                applied,
                batch.len(),
                ts
            );
        } else {
            tracing::debug!(
                "[CATCHUP {}] nothing new in {} messages since {:?}",
                peer_id,
                batch.len(),
                since
            );
        }
        Ok(applied)
    }
}
