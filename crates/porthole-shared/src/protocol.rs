//! Wire types for the windowed sync endpoint.
//!
//! A client declares one or more ordered room lists, each with a set of
//! index ranges (the window) and a timeline limit. The server answers with
//! a new position, per-list delta operations and the payloads of any rooms
//! those operations reference.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An inclusive index range `[lo, hi]` into a sorted room list.
pub type SliceRange = [i64; 2];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub lists: Vec<RequestList>,
}

/// One requested list. All fields are sticky: an omitted field re-uses the
/// value from the previous request on the same connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Vec<SliceRange>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
}

impl RequestList {
    /// Ranges must be non-negative, ordered pairs, and must not overlap
    /// one another.
    pub fn validate(&self) -> Result<(), String> {
        let Some(ranges) = &self.ranges else {
            return Ok(());
        };
        for r in ranges {
            if r[0] < 0 || r[1] < r[0] {
                return Err(format!("invalid range [{},{}]", r[0], r[1]));
            }
        }
        let mut sorted = ranges.clone();
        sorted.sort_unstable();
        for pair in sorted.windows(2) {
            if pair[1][0] <= pair[0][1] {
                return Err(format!(
                    "overlapping ranges [{},{}] and [{},{}]",
                    pair[0][0], pair[0][1], pair[1][0], pair[1][1]
                ));
            }
        }
        if let Some(limit) = self.timeline_limit {
            if limit < 0 {
                return Err(format!("negative timeline_limit {limit}"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub pos: i64,
    pub lists: Vec<ResponseList>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rooms: BTreeMap<String, Room>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseList {
    /// Total number of rooms in the list, independent of the window.
    pub count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<Op>,
}

/// A delta operation transforming the client's cached window toward the
/// server's current view. Indices are absolute indices into the list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Op {
    /// Reset a range to the given rooms. Emitted on the first response for
    /// newly covered indices.
    #[serde(rename = "SYNC")]
    Sync { range: SliceRange, room_ids: Vec<String> },
    /// The client should forget the rooms at these indices.
    #[serde(rename = "INVALIDATE")]
    Invalidate { range: SliceRange },
    /// Remove the room at `index`; rooms after it shift left.
    #[serde(rename = "DELETE")]
    Delete { index: i64 },
    /// Insert `room_id` at `index`; rooms from `index` onward shift right
    /// and the overflow off the right edge of the window is discarded.
    #[serde(rename = "INSERT")]
    Insert { index: i64, room_id: String },
    /// The room at `index` is unchanged in identity but its payload changed.
    #[serde(rename = "UPDATE")]
    Update { index: i64, room_id: String },
}

/// Payload for a single room referenced by one or more ops.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Room {
    /// True the first time this room is delivered on a connection; tells
    /// the client to replace its local state for the room.
    pub initial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timeline: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_tags_serialize_upper_case() {
        let op = Op::Insert {
            index: 3,
            room_id: "!a:localhost".into(),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "INSERT");
        assert_eq!(json["index"], 3);
        assert_eq!(json["room_id"], "!a:localhost");

        let op = Op::Sync {
            range: [0, 3],
            room_ids: vec!["!a:localhost".into()],
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "SYNC");
        assert_eq!(json["range"][1], 3);
    }

    #[test]
    fn request_tolerates_missing_fields() {
        let req: Request = serde_json::from_str(r#"{"lists":[{}]}"#).unwrap();
        assert_eq!(req.lists.len(), 1);
        assert!(req.lists[0].ranges.is_none());
        assert!(req.lists[0].timeline_limit.is_none());

        let req: Request = serde_json::from_str("{}").unwrap();
        assert!(req.lists.is_empty());
    }

    #[test]
    fn validate_rejects_bad_ranges() {
        let list = RequestList {
            ranges: Some(vec![[3, 0]]),
            ..Default::default()
        };
        assert!(list.validate().is_err());

        let list = RequestList {
            ranges: Some(vec![[-1, 4]]),
            ..Default::default()
        };
        assert!(list.validate().is_err());

        let list = RequestList {
            ranges: Some(vec![[0, 5], [5, 9]]),
            ..Default::default()
        };
        assert!(list.validate().is_err());

        let list = RequestList {
            ranges: Some(vec![[0, 5], [6, 9]]),
            timeline_limit: Some(0),
            ..Default::default()
        };
        assert!(list.validate().is_ok());
    }

    #[test]
    fn validate_rejects_negative_timeline_limit() {
        let list = RequestList {
            timeline_limit: Some(-1),
            ..Default::default()
        };
        assert!(list.validate().is_err());
    }

    #[test]
    fn empty_room_payload_omits_timeline() {
        let room = Room {
            initial: true,
            name: None,
            timeline: vec![],
        };
        let json = serde_json::to_string(&room).unwrap();
        assert!(!json.contains("timeline"));
        assert!(!json.contains("name"));
    }
}
