//! The upstream poller fleet: one long-poll loop per device.
//!
//! Each poller folds upstream batches into a [`DataReceiver`] and only
//! advances its `since` cursor after the whole batch was accepted, so a
//! crash or store failure replays the batch (the fold paths are
//! idempotent). Transport errors back off exponentially; a rejected
//! credential or a failure to persist to-device messages stops the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use porthole_store::StoreError;

use crate::upstream::{SyncResponse, UpstreamClient, UpstreamError};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// The capability set a poller dispatches into: the accumulator plus the
/// device bookkeeping. Implemented by the sync handler.
#[async_trait]
pub trait DataReceiver: Send + Sync + 'static {
    /// Upstream reported the room for the first time: fold its state block.
    async fn initialise(&self, room_id: &str, state: &[serde_json::Value])
        -> Result<(), StoreError>;

    /// Fold a live timeline batch.
    async fn accumulate(
        &self,
        room_id: &str,
        timeline: &[serde_json::Value],
    ) -> Result<(), StoreError>;

    async fn set_typing(&self, room_id: &str, user_ids: Vec<String>) -> Result<i64, StoreError>;

    /// Persist to-device messages. A failure here is fatal to the poll
    /// loop: carrying on would silently acknowledge lost messages.
    async fn add_to_device_messages(
        &self,
        user_id: &str,
        device_id: &str,
        msgs: &[serde_json::Value],
    ) -> Result<(), StoreError>;

    /// Persist the upstream cursor. Called only after everything above
    /// succeeded for the batch.
    async fn update_device_since(&self, device_id: &str, since: &str) -> Result<(), StoreError>;
}

enum PollError {
    /// Retry the same `since` after backoff.
    Retry(StoreError),
    /// Stop the loop.
    Fatal(StoreError),
}

struct Poller {
    credential: String,
    user_id: String,
    device_id: String,
    upstream: Arc<dyn UpstreamClient>,
    receiver: Arc<dyn DataReceiver>,
    poll_timeout: Duration,
}

impl Poller {
    async fn run(self, mut since: String, initialised: watch::Sender<bool>) {
        let mut backoff = INITIAL_BACKOFF;
        info!(device_id = %self.device_id, user_id = %self.user_id, "starting poll loop");
        loop {
            let resp = match self
                .upstream
                .sync(&self.credential, &since, self.poll_timeout)
                .await
            {
                Ok(resp) => resp,
                Err(UpstreamError::Auth(e)) => {
                    error!(device_id = %self.device_id, error = %e,
                           "credential rejected, stopping poll loop");
                    return;
                }
                Err(UpstreamError::Transport(e)) => {
                    warn!(device_id = %self.device_id, error = %e,
                          backoff_secs = backoff.as_secs(), "upstream transport error");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            match self.dispatch(&resp).await {
                Ok(()) => {
                    backoff = INITIAL_BACKOFF;
                    since = resp.next_batch.clone();
                    initialised.send_replace(true);
                }
                Err(PollError::Fatal(e)) => {
                    error!(device_id = %self.device_id, error = %e,
                           "terminating poll loop");
                    return;
                }
                Err(PollError::Retry(e)) => {
                    // since is not advanced: the batch replays
                    warn!(device_id = %self.device_id, error = %e,
                          backoff_secs = backoff.as_secs(), "failed to fold batch, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn dispatch(&self, resp: &SyncResponse) -> Result<(), PollError> {
        for (room_id, room) in &resp.rooms.join {
            if !room.state.events.is_empty() {
                self.receiver
                    .initialise(room_id, &room.state.events)
                    .await
                    .map_err(PollError::Retry)?;
            }
            if !room.timeline.events.is_empty() {
                self.receiver
                    .accumulate(room_id, &room.timeline.events)
                    .await
                    .map_err(PollError::Retry)?;
            }
            for ephemeral in &room.ephemeral.events {
                if ephemeral.get("type").and_then(|t| t.as_str()) != Some("m.typing") {
                    continue;
                }
                let user_ids: Vec<String> = ephemeral
                    .pointer("/content/user_ids")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|u| u.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default();
                self.receiver
                    .set_typing(room_id, user_ids)
                    .await
                    .map_err(PollError::Retry)?;
            }
        }

        if !resp.to_device.events.is_empty() {
            self.receiver
                .add_to_device_messages(&self.user_id, &self.device_id, &resp.to_device.events)
                .await
                .map_err(PollError::Fatal)?;
        }

        self.receiver
            .update_device_since(&self.device_id, &resp.next_batch)
            .await
            .map_err(PollError::Retry)?;
        Ok(())
    }
}

struct PollerHandle {
    task: JoinHandle<()>,
    initialised: watch::Receiver<bool>,
}

/// The poller fleet, keyed by device ID.
pub struct PollerMap {
    upstream: Arc<dyn UpstreamClient>,
    receiver: Arc<dyn DataReceiver>,
    poll_timeout: Duration,
    pollers: Mutex<HashMap<String, PollerHandle>>,
}

impl PollerMap {
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        receiver: Arc<dyn DataReceiver>,
        poll_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            receiver,
            poll_timeout,
            pollers: Mutex::new(HashMap::new()),
        })
    }

    /// Start a poll loop for the device unless one is already running,
    /// then wait until that loop has folded in its first batch, so a
    /// brand-new connection sees its rooms immediately. Idempotent: a
    /// second caller joins the first poller.
    pub async fn ensure_polling(&self, credential: &str, user_id: &str, device_id: &str, since: &str) {
        let mut initialised = {
            let mut pollers = self.pollers.lock().await;
            match pollers.get(device_id) {
                Some(handle) => handle.initialised.clone(),
                None => {
                    let (tx, rx) = watch::channel(false);
                    let poller = Poller {
                        credential: credential.to_string(),
                        user_id: user_id.to_string(),
                        device_id: device_id.to_string(),
                        upstream: self.upstream.clone(),
                        receiver: self.receiver.clone(),
                        poll_timeout: self.poll_timeout,
                    };
                    let task = tokio::spawn(poller.run(since.to_string(), tx));
                    pollers.insert(
                        device_id.to_string(),
                        PollerHandle { task, initialised: rx.clone() },
                    );
                    rx
                }
            }
        };

        while !*initialised.borrow() {
            // a closed channel means the poller died before its first
            // successful round; the caller proceeds with whatever is stored
            if initialised.changed().await.is_err() {
                break;
            }
        }
    }

    pub async fn poller_count(&self) -> usize {
        self.pollers.lock().await.len()
    }

    pub async fn shutdown(&self) {
        let mut pollers = self.pollers.lock().await;
        for (device_id, handle) in pollers.drain() {
            handle.task.abort();
            tracing::debug!(device_id = %device_id, "stopped poller");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Serves queued responses, then parks forever.
    struct MockUpstream {
        responses: StdMutex<VecDeque<Result<SyncResponse, UpstreamError>>>,
    }

    impl MockUpstream {
        fn new(responses: Vec<Result<SyncResponse, UpstreamError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl UpstreamClient for MockUpstream {
        async fn who_am_i(&self, _credential: &str) -> Result<String, UpstreamError> {
            Ok("@me:hs".to_string())
        }

        async fn sync(
            &self,
            _credential: &str,
            _since: &str,
            _timeout: Duration,
        ) -> Result<SyncResponse, UpstreamError> {
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some(resp) => resp,
                None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    /// Records dispatched calls; optionally fails to persist to-device.
    #[derive(Default)]
    struct MockReceiver {
        calls: StdMutex<Vec<String>>,
        fail_to_device: bool,
    }

    impl MockReceiver {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl DataReceiver for MockReceiver {
        async fn initialise(
            &self,
            room_id: &str,
            state: &[serde_json::Value],
        ) -> Result<(), StoreError> {
            self.record(format!("initialise {room_id} {}", state.len()));
            Ok(())
        }

        async fn accumulate(
            &self,
            room_id: &str,
            timeline: &[serde_json::Value],
        ) -> Result<(), StoreError> {
            self.record(format!("accumulate {room_id} {}", timeline.len()));
            Ok(())
        }

        async fn set_typing(
            &self,
            room_id: &str,
            user_ids: Vec<String>,
        ) -> Result<i64, StoreError> {
            self.record(format!("set_typing {room_id} {}", user_ids.len()));
            Ok(1)
        }

        async fn add_to_device_messages(
            &self,
            _user_id: &str,
            device_id: &str,
            msgs: &[serde_json::Value],
        ) -> Result<(), StoreError> {
            self.record(format!("to_device {device_id} {}", msgs.len()));
            if self.fail_to_device {
                return Err(StoreError::NotFound);
            }
            Ok(())
        }

        async fn update_device_since(
            &self,
            device_id: &str,
            since: &str,
        ) -> Result<(), StoreError> {
            self.record(format!("since {device_id} {since}"));
            Ok(())
        }
    }

    fn response_with_room() -> SyncResponse {
        serde_json::from_value(json!({
            "next_batch": "s_1",
            "rooms": {
                "join": {
                    "!a:hs": {
                        "state": {"events": [
                            {"event_id": "$1", "type": "m.room.create", "state_key": ""}
                        ]},
                        "timeline": {"events": [
                            {"event_id": "$2", "type": "m.room.message"}
                        ]},
                        "ephemeral": {"events": [
                            {"type": "m.typing", "content": {"user_ids": ["@me:hs"]}}
                        ]}
                    }
                }
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn first_batch_is_dispatched_before_ensure_polling_returns() {
        let upstream = MockUpstream::new(vec![Ok(response_with_room())]);
        let receiver = Arc::new(MockReceiver::default());
        let map = PollerMap::new(upstream, receiver.clone(), Duration::from_secs(30));

        map.ensure_polling("Bearer t", "@me:hs", "DEV", "").await;

        let calls = receiver.calls();
        assert_eq!(
            calls,
            vec![
                "initialise !a:hs 1",
                "accumulate !a:hs 1",
                "set_typing !a:hs 1",
                "since DEV s_1",
            ]
        );

        // a second caller joins the existing poller
        map.ensure_polling("Bearer t", "@me:hs", "DEV", "").await;
        assert_eq!(map.poller_count().await, 1);

        map.shutdown().await;
    }

    #[tokio::test]
    async fn to_device_failure_terminates_the_loop_without_acking() {
        let resp: SyncResponse = serde_json::from_value(json!({
            "next_batch": "s_9",
            "to_device": {"events": [{"type": "m.x", "content": {}}]}
        }))
        .unwrap();
        let upstream = MockUpstream::new(vec![Ok(resp)]);
        let receiver = Arc::new(MockReceiver {
            fail_to_device: true,
            ..Default::default()
        });
        let map = PollerMap::new(upstream, receiver.clone(), Duration::from_secs(30));

        // the poller dies before its first success; ensure_polling returns
        // once the watch channel closes
        map.ensure_polling("Bearer t", "@me:hs", "DEV", "").await;

        let calls = receiver.calls();
        assert_eq!(calls, vec!["to_device DEV 1"]);
        assert!(!calls.iter().any(|c| c.starts_with("since")));

        map.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_credential_stops_the_poller() {
        let upstream = MockUpstream::new(vec![Err(UpstreamError::Auth("401".into()))]);
        let receiver = Arc::new(MockReceiver::default());
        let map = PollerMap::new(upstream, receiver.clone(), Duration::from_secs(30));

        map.ensure_polling("Bearer t", "@me:hs", "DEV", "").await;
        assert!(receiver.calls().is_empty());

        map.shutdown().await;
    }
}
