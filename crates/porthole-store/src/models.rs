use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// A stored event row. `nid` is the server-assigned numeric ID: strictly
/// increasing in insertion order and never reused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub nid: i64,
    pub event_id: String,
    pub room_id: String,
    pub event_type: String,
    pub state_key: Option<String>,
    pub sender: String,
    pub membership: Option<String>,
    pub json: String,
}

impl Event {
    /// Parse the stored JSON back into a value for response assembly.
    pub fn raw(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.json)?)
    }

    /// An event is a state event iff it carries a state key.
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }
}

/// A parsed-but-not-yet-inserted event: the fields we cache in columns at
/// insert time, plus the original JSON.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_id: String,
    pub room_id: String,
    pub event_type: String,
    pub state_key: Option<String>,
    pub sender: String,
    pub membership: Option<String>,
    /// `prev_content.membership` for member events: used to tell real
    /// membership transitions apart from profile-only updates.
    pub prev_membership: Option<String>,
    pub json: String,
}

impl NewEvent {
    /// Extract the cached columns from an opaque upstream event.
    ///
    /// The `membership` column is only populated for `m.room.member`
    /// events, where it mirrors `content.membership`.
    pub fn from_raw(room_id: &str, raw: &serde_json::Value) -> Result<Self> {
        let event_id = raw
            .get("event_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StoreError::BadEvent(raw.to_string()))?
            .to_string();
        let event_type = raw
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let state_key = raw
            .get("state_key")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let sender = raw
            .get("sender")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let (membership, prev_membership) = if event_type == "m.room.member" {
            (
                raw.pointer("/content/membership")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                raw.pointer("/prev_content/membership")
                    .or_else(|| raw.pointer("/unsigned/prev_content/membership"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            event_id,
            room_id: room_id.to_string(),
            event_type,
            state_key,
            sender,
            membership,
            prev_membership,
            json: raw.to_string(),
        })
    }
}

/// One upstream polling device. `user_id` is empty until the first
/// `WhoAmI` answer is cached; `since` is the upstream cursor, advanced only
/// after a batch has been folded in successfully.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub device_id: String,
    pub user_id: String,
    pub since: String,
}
