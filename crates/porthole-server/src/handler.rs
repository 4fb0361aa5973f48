//! Glue between the HTTP layer, the poller fleet, the store and the
//! notifier. The handler is the poller's [`DataReceiver`]: folds go into
//! the store first, then the genuinely-new events are fanned out.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use porthole_shared::ConnId;
use porthole_store::StoreError;

use crate::conn::{Conn, SharedStore};
use crate::error::ServerError;
use crate::notifier::Notifier;
use crate::poller::{DataReceiver, PollerMap};
use crate::upstream::{UpstreamClient, UpstreamError};

pub struct SyncHandler {
    store: SharedStore,
    notifier: Arc<Notifier>,
    upstream: Arc<dyn UpstreamClient>,
}

impl SyncHandler {
    pub fn new(
        store: SharedStore,
        notifier: Arc<Notifier>,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Arc<Self> {
        Arc::new(Self { store, notifier, upstream })
    }

    /// Rebuild the notifier's joined-users index from the store. Called
    /// once at startup, before serving requests.
    pub async fn load_joined_users(&self) -> Result<(), ServerError> {
        let joined = self.store.lock().await.all_joined_members()?;
        info!(num_rooms = joined.len(), "loaded joined members");
        self.notifier.load_joined_users(joined);
        Ok(())
    }

    /// Associate a request with an existing connection or make a new one,
    /// making sure the upstream side is polling first. When this returns,
    /// the connection is alive and its rooms are in the store.
    pub async fn setup_connection(
        &self,
        poller_map: &PollerMap,
        credential: &str,
        session_id: Option<String>,
    ) -> Result<Arc<Conn>, ServerError> {
        let device_id = device_id_from_credential(credential);

        // client thinks it has a connection
        if let Some(session_id) = session_id.filter(|s| !s.is_empty()) {
            let conn_id = ConnId::new(device_id, session_id);
            return match self.notifier.conn(&conn_id) {
                Some(conn) => Ok(conn),
                // the connection was evicted or the process restarted
                None => Err(ServerError::ExpiredSession),
            };
        }

        // new connection: hook up the upstream side first
        let device = self.store.lock().await.insert_device(&device_id)?;
        let mut user_id = device.user_id;
        if user_id.is_empty() {
            user_id = match self.upstream.who_am_i(credential).await {
                Ok(user_id) => user_id,
                Err(UpstreamError::Auth(e)) => return Err(ServerError::UpstreamAuth(e)),
                Err(UpstreamError::Transport(e)) => return Err(ServerError::Internal(e)),
            };
            if let Err(e) = self
                .store
                .lock()
                .await
                .update_device_user_id(&device_id, &user_id)
            {
                // non-fatal, we can still work without the cached mapping
                warn!(device_id = %device_id, error = %e,
                      "failed to persist user ID for device");
            }
        }
        poller_map
            .ensure_polling(credential, &user_id, &device_id, &device.since)
            .await;

        let conn_id = ConnId::new(device_id, ConnId::generate_session_id());
        let (conn, created) = self.notifier.get_or_create_conn(conn_id, &user_id);
        if created {
            info!(conn_id = %conn.conn_id, user_id = %user_id, "created new connection");
        }
        Ok(conn)
    }
}

/// The session ID alone is guessable, so connections are keyed on a value
/// derived from the authenticated credential.
fn device_id_from_credential(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

#[async_trait]
impl DataReceiver for SyncHandler {
    async fn initialise(
        &self,
        room_id: &str,
        state: &[serde_json::Value],
    ) -> Result<(), StoreError> {
        let res = self.store.lock().await.initialise(room_id, state)?;
        if res.added {
            for ev in &res.new_events {
                self.notifier.on_new_event(ev);
            }
        }
        Ok(())
    }

    async fn accumulate(
        &self,
        room_id: &str,
        timeline: &[serde_json::Value],
    ) -> Result<(), StoreError> {
        let res = self.store.lock().await.accumulate(room_id, timeline)?;
        for ev in &res.new_events {
            self.notifier.on_new_event(ev);
        }
        Ok(())
    }

    async fn set_typing(&self, room_id: &str, user_ids: Vec<String>) -> Result<i64, StoreError> {
        self.store.lock().await.set_typing(room_id, &user_ids)
    }

    async fn add_to_device_messages(
        &self,
        _user_id: &str,
        device_id: &str,
        msgs: &[serde_json::Value],
    ) -> Result<(), StoreError> {
        self.store
            .lock()
            .await
            .insert_to_device_messages(device_id, msgs)?;
        Ok(())
    }

    async fn update_device_since(&self, device_id: &str, since: &str) -> Result<(), StoreError> {
        self.store.lock().await.update_device_since(device_id, since)
    }
}
