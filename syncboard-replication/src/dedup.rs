use std::sync::Arc;
use syncboard::{ApplyOutcome, MessageSnapshot, Store, SyncboardError};

/// Gate in front of every replicated insert, pushed or pulled.
///
/// Matches on `(origin_node_id, origin_local_id)` first and falls back to
/// `(author, body, created_at)` only for candidates without an origin.
#[derive(Clone)]
pub struct DedupGuard {
    store: Arc<Store>,
}

impl DedupGuard {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Advisory check. `apply` repeats it atomically with the insert.
    pub fn should_apply(&self, candidate: &MessageSnapshot) -> bool {
        self.store.messages().find_duplicate(candidate).is_none()
    }

    pub fn apply(&self, candidate: &MessageSnapshot) -> Result<ApplyOutcome, SyncboardError> {
        let outcome = self.store.messages().apply_replicated(candidate)?;
        match &outcome {
            ApplyOutcome::Applied(message) => tracing::debug!(
                "[INGEST] applied {}#{} as local {}",
                message.origin_node_id,
                message.origin_local_id,
                message.local_id
            ),
            ApplyOutcome::Duplicate(local_id) => tracing::debug!(
                "[INGEST] duplicate of local {} suppressed ({:?})",
                local_id,
                candidate.origin()
            ),
        }
        Ok(outcome)
    }
}
