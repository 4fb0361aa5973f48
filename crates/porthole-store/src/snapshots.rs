//! State snapshots and the per-room current-state pointer.
//!
//! A snapshot is an immutable, unordered set of event NIDs. The only way
//! room state advances is by writing a new snapshot and repointing the
//! room at it; the old snapshot keeps existing until nothing references
//! it, at which point [`gc_unreferenced`] may delete it.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::events;
use crate::models::Event;

/// Write a new snapshot containing `event_nids`. Snapshots are born with a
/// ref count of zero; becoming a room's current snapshot takes a reference.
pub fn create_snapshot(conn: &Connection, room_id: &str, event_nids: &[i64]) -> Result<i64> {
    conn.execute(
        "INSERT INTO room_snapshots (room_id, ref_count) VALUES (?1, 0)",
        params![room_id],
    )?;
    let snapshot_id = conn.last_insert_rowid();
    let mut stmt =
        conn.prepare("INSERT INTO snapshot_events (snapshot_id, event_nid) VALUES (?1, ?2)")?;
    for nid in event_nids {
        stmt.execute(params![snapshot_id, nid])?;
    }
    Ok(snapshot_id)
}

/// The member NIDs of a snapshot, ascending.
pub fn snapshot_event_nids(conn: &Connection, snapshot_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT event_nid FROM snapshot_events WHERE snapshot_id = ?1 ORDER BY event_nid ASC",
    )?;
    let rows = stmt.query_map(params![snapshot_id], |row| row.get(0))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StoreError::Sqlite)
}

pub fn current_snapshot_id(conn: &Connection, room_id: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT current_snapshot_id FROM rooms WHERE room_id = ?1",
        params![room_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(StoreError::Sqlite)
}

/// Repoint the room at `new_snapshot_id`: take a reference on the new
/// snapshot, drop the reference held via the old pointer (if any), then
/// replace the pointer. Callers run this inside their write transaction.
pub fn set_current_snapshot(conn: &Connection, room_id: &str, new_snapshot_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE room_snapshots SET ref_count = ref_count + 1 WHERE snapshot_id = ?1",
        params![new_snapshot_id],
    )?;
    if let Some(old) = current_snapshot_id(conn, room_id)? {
        conn.execute(
            "UPDATE room_snapshots SET ref_count = ref_count - 1 WHERE snapshot_id = ?1",
            params![old],
        )?;
    }
    conn.execute(
        "INSERT INTO rooms (room_id, current_snapshot_id) VALUES (?1, ?2)
         ON CONFLICT(room_id) DO UPDATE SET current_snapshot_id = excluded.current_snapshot_id",
        params![room_id, new_snapshot_id],
    )?;
    Ok(())
}

pub fn ref_count(conn: &Connection, snapshot_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT ref_count FROM room_snapshots WHERE snapshot_id = ?1",
        params![snapshot_id],
        |row| row.get(0),
    )
    .map_err(StoreError::Sqlite)
}

/// Delete snapshots nothing references. The `snapshot_events` rows go with
/// them via the foreign key cascade.
pub fn gc_unreferenced(conn: &Connection) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM room_snapshots
         WHERE ref_count <= 0
           AND snapshot_id NOT IN (SELECT current_snapshot_id FROM rooms)",
        [],
    )?;
    Ok(deleted)
}

/// Resolve one slot of the room's current state, e.g. the room name via
/// `("m.room.name", "")`.
pub fn room_state_event(
    conn: &Connection,
    room_id: &str,
    event_type: &str,
    state_key: &str,
) -> Result<Option<Event>> {
    let nid: Option<i64> = conn
        .query_row(
            "SELECT se.event_nid
             FROM rooms r
             JOIN snapshot_events se ON se.snapshot_id = r.current_snapshot_id
             JOIN events e ON e.nid = se.event_nid
             WHERE r.room_id = ?1 AND e.event_type = ?2 AND IFNULL(e.state_key, '') = ?3",
            params![room_id, event_type, state_key],
            |row| row.get(0),
        )
        .optional()?;
    match nid {
        Some(nid) => Ok(events::select_by_nids(conn, &[nid])?.into_iter().next()),
        None => Ok(None),
    }
}

/// Joined members of every room, computed from each room's current
/// snapshot. Used once at process startup to seed the notifier.
pub fn all_joined_members(conn: &Connection) -> Result<HashMap<String, Vec<String>>> {
    let mut stmt = conn.prepare(
        "SELECT e.room_id, e.state_key
         FROM rooms r
         JOIN snapshot_events se ON se.snapshot_id = r.current_snapshot_id
         JOIN events e ON e.nid = se.event_nid
         WHERE e.event_type = 'm.room.member' AND e.membership = 'join'
           AND e.state_key IS NOT NULL",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut joined: HashMap<String, Vec<String>> = HashMap::new();
    for row in rows {
        let (room_id, user_id) = row?;
        joined.entry(room_id).or_default().push(user_id);
    }
    Ok(joined)
}

/// Rooms whose current snapshot has the user joined, with the NID of the
/// newest event in each. Seeds a connection's sorted room list.
pub fn joined_rooms_for_user(conn: &Connection, user_id: &str) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT e.room_id,
                (SELECT IFNULL(MAX(nid), 0) FROM events WHERE events.room_id = e.room_id)
         FROM rooms r
         JOIN snapshot_events se ON se.snapshot_id = r.current_snapshot_id
         JOIN events e ON e.nid = se.event_nid
         WHERE e.event_type = 'm.room.member' AND e.membership = 'join'
           AND e.state_key = ?1",
    )?;
    let rows = stmt.query_map(params![user_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StoreError::Sqlite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::events::insert_events;
    use serde_json::json;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn ref_counts_follow_the_current_pointer() {
        let (_dir, db) = test_db();
        let room = "!r:hs";
        let res = insert_events(
            db.conn(),
            room,
            &[json!({"event_id": "$1", "type": "m.room.create", "state_key": "",
                     "sender": "@me:hs", "content": {}})],
        )
        .unwrap();

        let first = create_snapshot(db.conn(), room, &res.nids).unwrap();
        assert_eq!(ref_count(db.conn(), first).unwrap(), 0);

        set_current_snapshot(db.conn(), room, first).unwrap();
        assert_eq!(ref_count(db.conn(), first).unwrap(), 1);
        assert_eq!(current_snapshot_id(db.conn(), room).unwrap(), Some(first));

        let second = create_snapshot(db.conn(), room, &res.nids).unwrap();
        set_current_snapshot(db.conn(), room, second).unwrap();
        assert_eq!(ref_count(db.conn(), first).unwrap(), 0);
        assert_eq!(ref_count(db.conn(), second).unwrap(), 1);
        assert_eq!(current_snapshot_id(db.conn(), room).unwrap(), Some(second));
    }

    #[test]
    fn gc_deletes_only_unreferenced_non_current_snapshots() {
        let (_dir, db) = test_db();
        let room = "!r:hs";
        let res = insert_events(
            db.conn(),
            room,
            &[json!({"event_id": "$1", "type": "m.room.create", "state_key": "",
                     "sender": "@me:hs", "content": {}})],
        )
        .unwrap();

        let first = create_snapshot(db.conn(), room, &res.nids).unwrap();
        set_current_snapshot(db.conn(), room, first).unwrap();
        let second = create_snapshot(db.conn(), room, &res.nids).unwrap();
        set_current_snapshot(db.conn(), room, second).unwrap();

        // first is now unreferenced, second is current
        assert_eq!(gc_unreferenced(db.conn()).unwrap(), 1);
        assert_eq!(ref_count(db.conn(), second).unwrap(), 1);
        assert!(snapshot_event_nids(db.conn(), first).unwrap().is_empty());
        assert_eq!(gc_unreferenced(db.conn()).unwrap(), 0);
    }
}
