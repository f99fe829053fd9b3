use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncboard::MessageSnapshot;

use crate::error::ReplicationError;
use crate::types::{SyncMessageRequest, SyncMessageResponse};

/// HTTP client wrapper for communicating with a single peer node
pub struct PeerClient {
    peer_id: String,
    base_url: String,
    http_client: reqwest::Client,
    probe_timeout: Duration,
    last_success: Arc<AtomicU64>, // Unix timestamp in seconds
}

impl PeerClient {
    pub fn new(
        peer_id: String,
        base_url: String,
        request_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            peer_id,
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            probe_timeout,
            last_success: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn last_success_timestamp(&self) -> u64 {
        self.last_success.load(Ordering::Relaxed)
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        match self.last_success_timestamp() {
            0 => None,
            secs => DateTime::from_timestamp(secs as i64, 0),
        }
    }

    fn mark_success(&self) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.last_success.store(now, Ordering::Relaxed);
    }

    fn network_error(&self, e: reqwest::Error) -> ReplicationError {
        ReplicationError::TransientNetwork(format!("{}: {}", self.peer_id, e))
    }

    fn check_status(&self, response: &reqwest::Response) -> Result<(), ReplicationError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ReplicationError::PeerRejected {
                peer_id: self.peer_id.clone(),
                status: response.status().as_u16(),
            })
        }
    }

    /// Push one message to the peer's ingest endpoint. One attempt, no retry.
    pub async fn push_message(
        &self,
        snapshot: &MessageSnapshot,
    ) -> Result<SyncMessageResponse, ReplicationError> {
        let url = format!("{}/sync_message", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .json(&SyncMessageRequest::from(snapshot))
            .send()
            .await
            .map_err(|e| self.network_error(e))?;
        self.check_status(&response)?;

        let resp: SyncMessageResponse = response.json().await.map_err(|e| {
            ReplicationError::MalformedResponse(format!("{}: {}", self.peer_id, e))
        })?;

        self.mark_success();
        Ok(resp)
    }

    /// Liveness probe. Anything but a 200 within the probe timeout is a failure.
    pub async fn probe(&self) -> Result<(), ReplicationError> {
        let url = format!("{}/health", self.base_url);

        let response = self
            .http_client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| self.network_error(e))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(ReplicationError::PeerRejected {
                peer_id: self.peer_id.clone(),
                status: response.status().as_u16(),
            });
        }

        self.mark_success();
        Ok(())
    }

    /// Fetch messages created at or after `since` (everything when `None`), oldest first.
    pub async fn fetch_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageSnapshot>, ReplicationError> {
        let url = format!("{}/api/messages", self.base_url);

        let mut request = self.http_client.get(&url);
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339_opts(SecondsFormat::AutoSi, true))]);
        }

        let response = request.send().await.map_err(|e| self.network_error(e))?;
        self.check_status(&response)?;

        let messages: Vec<MessageSnapshot> = response.json().await.map_err(|e| {
            ReplicationError::MalformedResponse(format!("{}: {}", self.peer_id, e))
        })?;

        self.mark_success();
        Ok(messages)
    }
}
