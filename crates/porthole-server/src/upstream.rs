//! Client for the upstream "give me everything" sync API.
//!
//! Only two calls are consumed: `WhoAmI` to resolve the credential to a
//! user ID, and the long-poll `Sync`. The trait exists so the poller can
//! be driven by a mock in tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The credential was rejected. Not retryable until the client
    /// re-authenticates.
    #[error("upstream rejected credential: {0}")]
    Auth(String),

    /// Anything transient: connection refused, timeout, 5xx, bad JSON.
    /// Retried with backoff, never surfaced to the sync client.
    #[error("upstream transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub rooms: SyncRooms,
    #[serde(default)]
    pub to_device: EventBlock,
    pub next_batch: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: HashMap<String, JoinedRoom>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub state: EventBlock,
    #[serde(default)]
    pub timeline: EventBlock,
    #[serde(default)]
    pub ephemeral: EventBlock,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventBlock {
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
}

#[async_trait]
pub trait UpstreamClient: Send + Sync + 'static {
    /// Resolve an opaque credential to the user it belongs to.
    async fn who_am_i(&self, credential: &str) -> Result<String, UpstreamError>;

    /// One long-poll round. `since` is empty on the very first call.
    async fn sync(
        &self,
        credential: &str,
        since: &str,
        timeout: Duration,
    ) -> Result<SyncResponse, UpstreamError>;
}

pub struct HttpUpstream {
    base_url: String,
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn who_am_i(&self, credential: &str) -> Result<String, UpstreamError> {
        let url = format!("{}/_matrix/client/r0/account/whoami", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", credential)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(UpstreamError::Auth(format!("whoami returned {status}")));
        }
        if !status.is_success() {
            return Err(UpstreamError::Transport(format!("whoami returned {status}")));
        }

        #[derive(Deserialize)]
        struct WhoAmI {
            user_id: String,
        }
        let body: WhoAmI = resp
            .json()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        Ok(body.user_id)
    }

    async fn sync(
        &self,
        credential: &str,
        since: &str,
        timeout: Duration,
    ) -> Result<SyncResponse, UpstreamError> {
        let url = format!("{}/_matrix/client/r0/sync", self.base_url);
        let mut req = self
            .client
            .get(&url)
            .header("Authorization", credential)
            .query(&[("timeout", timeout.as_millis().to_string())])
            // the HTTP round must outlive the server-side long-poll
            .timeout(timeout + Duration::from_secs(10));
        if !since.is_empty() {
            req = req.query(&[("since", since)]);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(UpstreamError::Auth(format!("sync returned {status}")));
        }
        if !status.is_success() {
            return Err(UpstreamError::Transport(format!("sync returned {status}")));
        }

        resp.json()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sync_response_tolerates_missing_blocks() {
        let resp: SyncResponse = serde_json::from_value(json!({
            "next_batch": "s_1",
            "rooms": {
                "join": {
                    "!a:hs": {
                        "timeline": {"events": [{"event_id": "$1"}]}
                    }
                }
            }
        }))
        .unwrap();
        assert_eq!(resp.next_batch, "s_1");
        let room = &resp.rooms.join["!a:hs"];
        assert!(room.state.events.is_empty());
        assert_eq!(room.timeline.events.len(), 1);
        assert!(room.ephemeral.events.is_empty());
        assert!(resp.to_device.events.is_empty());
    }
}
