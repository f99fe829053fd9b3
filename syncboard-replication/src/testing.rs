//! Fake-peer helpers shared by the unit tests.

use std::time::Duration;
use wiremock::ResponseTemplate;

use crate::peer::PeerClient;

pub(crate) fn peer_client(peer_id: &str, url: &str) -> PeerClient {
    PeerClient::new(
        peer_id.to_string(),
        url.to_string(),
        Duration::from_secs(2),
        Duration::from_millis(500),
    )
}

pub(crate) fn success_body(local_id: u64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "status": "success",
        "local_id": local_id,
        "applied": true
    }))
}
