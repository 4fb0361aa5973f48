use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for one client sync connection.
///
/// The session ID on its own is not hard to guess, so connections are always
/// addressed by the pair: the device ID is derived from the (authenticated)
/// access token, the session ID distinguishes concurrent sessions on the
/// same device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConnId {
    pub device_id: String,
    pub session_id: String,
}

impl ConnId {
    pub fn new(device_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Mint a fresh, collision-resistant session ID.
    pub fn generate_session_id() -> String {
        Uuid::new_v4().to_string()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.device_id, self.session_id)
    }
}
