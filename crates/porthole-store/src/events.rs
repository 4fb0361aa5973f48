//! The event table: insertion with NID assignment, dedup, and the
//! NID-ordered queries the sync engine is built on.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::models::{Event, NewEvent};

/// Sentinel position: a delta query from `EVENTS_START` draws from the
/// beginning of the room's history.
pub const EVENTS_START: i64 = 0;

/// Outcome of a batch insert. `nids` is in 1:1 order with the input;
/// `new` marks which of those rows were genuinely inserted (as opposed to
/// deduplicated against an existing `event_id`).
#[derive(Debug, Clone)]
pub struct InsertResult {
    pub nids: Vec<i64>,
    pub new: Vec<bool>,
}

impl InsertResult {
    pub fn num_new(&self) -> usize {
        self.new.iter().filter(|n| **n).count()
    }
}

/// Parse a batch of opaque upstream events, rejecting any without a usable
/// `event_id`. Parsing is split from insertion so callers can do it before
/// opening a write transaction.
pub fn parse_events(room_id: &str, raws: &[serde_json::Value]) -> Result<Vec<NewEvent>> {
    raws.iter().map(|raw| NewEvent::from_raw(room_id, raw)).collect()
}

/// Insert parsed events, deduplicating by `event_id`. Existing rows keep
/// their NID; new rows draw NIDs from the global sequence in input order.
pub fn insert_parsed(conn: &Connection, events: &[NewEvent]) -> Result<InsertResult> {
    let mut nids = Vec::with_capacity(events.len());
    let mut new = Vec::with_capacity(events.len());
    for ev in events {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO events (event_id, room_id, event_type, state_key, sender, membership, json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ev.event_id,
                ev.room_id,
                ev.event_type,
                ev.state_key,
                ev.sender,
                ev.membership,
                ev.json,
            ],
        )?;
        let nid: i64 = conn.query_row(
            "SELECT nid FROM events WHERE event_id = ?1",
            params![ev.event_id],
            |row| row.get(0),
        )?;
        nids.push(nid);
        new.push(inserted > 0);
    }
    Ok(InsertResult { nids, new })
}

pub fn insert_events(
    conn: &Connection,
    room_id: &str,
    raws: &[serde_json::Value],
) -> Result<InsertResult> {
    let parsed = parse_events(room_id, raws)?;
    insert_parsed(conn, &parsed)
}

/// Fetch events by NID, ordered by NID ascending.
pub fn select_by_nids(conn: &Connection, nids: &[i64]) -> Result<Vec<Event>> {
    if nids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; nids.len()].join(",");
    let sql = format!(
        "SELECT nid, event_id, room_id, event_type, state_key, sender, membership, json
         FROM events WHERE nid IN ({placeholders}) ORDER BY nid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(nids.iter()), row_to_event)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StoreError::Sqlite)
}

/// Fetch events by event ID, ordered by NID ascending.
pub fn select_by_ids(conn: &Connection, ids: &[&str]) -> Result<Vec<Event>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(",");
    let sql = format!(
        "SELECT nid, event_id, room_id, event_type, state_key, sender, membership, json
         FROM events WHERE event_id IN ({placeholders}) ORDER BY nid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(ids.iter()), row_to_event)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StoreError::Sqlite)
}

/// Up to `limit` events in the room with `nid > from_excl`, NID ascending.
/// The returned position is the NID of the last event, or `from_excl` if
/// there were none.
pub fn delta(
    conn: &Connection,
    room_id: &str,
    from_excl: i64,
    limit: usize,
) -> Result<(Vec<Event>, i64)> {
    let mut stmt = conn.prepare(
        "SELECT nid, event_id, room_id, event_type, state_key, sender, membership, json
         FROM events WHERE room_id = ?1 AND nid > ?2 ORDER BY nid ASC LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![room_id, from_excl, limit as i64], row_to_event)?;
    let events = rows
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StoreError::Sqlite)?;
    let pos = events.last().map(|e| e.nid).unwrap_or(from_excl);
    Ok((events, pos))
}

/// The most recent `limit` events in the room, returned in ascending NID
/// order. A limit of zero yields an empty vector.
pub fn latest_in_room(conn: &Connection, room_id: &str, limit: usize) -> Result<Vec<Event>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT nid, event_id, room_id, event_type, state_key, sender, membership, json
         FROM events WHERE room_id = ?1 ORDER BY nid DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![room_id, limit as i64], row_to_event)?;
    let mut events = rows
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StoreError::Sqlite)?;
    events.reverse();
    Ok(events)
}

/// NID of the newest event in the room, if any.
pub fn latest_nid(conn: &Connection, room_id: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT MAX(nid) FROM events WHERE room_id = ?1",
        params![room_id],
        |row| row.get::<_, Option<i64>>(0),
    )
    .optional()
    .map(Option::flatten)
    .map_err(StoreError::Sqlite)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        nid: row.get(0)?,
        event_id: row.get(1)?,
        room_id: row.get(2)?,
        event_type: row.get(3)?,
        state_key: row.get(4)?,
        sender: row.get(5)?,
        membership: row.get(6)?,
        json: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use serde_json::json;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn msg(event_id: &str, body: &str) -> serde_json::Value {
        json!({"event_id": event_id, "type": "m.room.message", "sender": "@me:hs",
               "content": {"body": body, "msgtype": "m.text"}})
    }

    #[test]
    fn nids_are_monotonic_in_input_order() {
        let (_dir, db) = test_db();
        let raws = vec![msg("$1", "a"), msg("$2", "b"), msg("$3", "c")];
        let res = insert_events(db.conn(), "!r:hs", &raws).unwrap();
        assert_eq!(res.num_new(), 3);
        assert!(res.nids[0] < res.nids[1]);
        assert!(res.nids[1] < res.nids[2]);
    }

    #[test]
    fn duplicate_events_keep_their_nid() {
        let (_dir, db) = test_db();
        let first = insert_events(db.conn(), "!r:hs", &[msg("$1", "a")]).unwrap();
        let second =
            insert_events(db.conn(), "!r:hs", &[msg("$1", "a"), msg("$2", "b")]).unwrap();
        assert_eq!(second.nids[0], first.nids[0]);
        assert_eq!(second.num_new(), 1);
        assert_eq!(second.new, vec![false, true]);
    }

    #[test]
    fn delta_paginates_in_nid_order() {
        let (_dir, db) = test_db();
        let raws = vec![msg("$1", "a"), msg("$2", "b"), msg("$3", "c")];
        insert_events(db.conn(), "!r:hs", &raws).unwrap();

        let (events, pos) = delta(db.conn(), "!r:hs", EVENTS_START, 1).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, "$1");
        assert!(pos > 0);

        let (events, pos2) = delta(db.conn(), "!r:hs", pos, 1000).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, "$2");
        assert_eq!(events[1].event_id, "$3");
        assert_eq!(pos2, events[1].nid);

        // nothing beyond the end: position sticks
        let (events, pos3) = delta(db.conn(), "!r:hs", pos2, 10).unwrap();
        assert!(events.is_empty());
        assert_eq!(pos3, pos2);
    }

    #[test]
    fn latest_in_room_respects_limit_and_order() {
        let (_dir, db) = test_db();
        let raws = vec![msg("$1", "a"), msg("$2", "b"), msg("$3", "c")];
        insert_events(db.conn(), "!r:hs", &raws).unwrap();

        let events = latest_in_room(db.conn(), "!r:hs", 2).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, "$2");
        assert_eq!(events[1].event_id, "$3");

        assert!(latest_in_room(db.conn(), "!r:hs", 0).unwrap().is_empty());
    }

    #[test]
    fn latest_nid_tracks_newest_event() {
        let (_dir, db) = test_db();
        assert_eq!(latest_nid(db.conn(), "!r:hs").unwrap(), None);
        let res = insert_events(db.conn(), "!r:hs", &[msg("$1", "a")]).unwrap();
        assert_eq!(latest_nid(db.conn(), "!r:hs").unwrap(), Some(res.nids[0]));
    }
}
