use syncboard::SyncboardError;
use thiserror::Error;

/// Failure of one replication step against one peer.
///
/// Everything but `Storage` is contained inside the replication engine and
/// only ever shows up as a failed attempt.
#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("peer {peer_id} rejected request with status {status}")]
    PeerRejected { peer_id: String, status: u16 },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Storage(#[from] SyncboardError),
}

impl ReplicationError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReplicationError::Storage(_))
    }
}
