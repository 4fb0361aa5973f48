//! Append-only log of membership transitions, queryable per target user.

use rusqlite::{params, Connection};

use crate::error::{Result, StoreError};

/// Sentinel start position: queries from here see the whole log.
pub const MEMBERSHIP_LOG_OFFSET_START: i64 = 0;

pub fn append_membership(
    conn: &Connection,
    event_nid: i64,
    room_id: &str,
    target_user_id: &str,
    membership: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO membership_log (event_nid, room_id, target_user_id, membership)
         VALUES (?1, ?2, ?3, ?4)",
        params![event_nid, room_id, target_user_id, membership],
    )?;
    Ok(())
}

/// NIDs of membership changes for `target` with
/// `start_excl < nid <= end_incl`, strictly ascending.
pub fn memberships_between(
    conn: &Connection,
    start_excl: i64,
    end_incl: i64,
    target: &str,
) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT event_nid FROM membership_log
         WHERE target_user_id = ?1 AND event_nid > ?2 AND event_nid <= ?3
         ORDER BY event_nid ASC",
    )?;
    let rows = stmt.query_map(params![target, start_excl, end_incl], |row| row.get(0))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StoreError::Sqlite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[test]
    fn bounds_are_exclusive_then_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();

        append_membership(db.conn(), 10, "!r:hs", "@me:hs", "join").unwrap();
        append_membership(db.conn(), 20, "!r:hs", "@me:hs", "leave").unwrap();
        append_membership(db.conn(), 15, "!r:hs", "@other:hs", "join").unwrap();

        let nids =
            memberships_between(db.conn(), MEMBERSHIP_LOG_OFFSET_START, 20, "@me:hs").unwrap();
        assert_eq!(nids, vec![10, 20]);

        // start is exclusive, end is inclusive
        assert_eq!(memberships_between(db.conn(), 10, 19, "@me:hs").unwrap(), Vec::<i64>::new());
        assert_eq!(memberships_between(db.conn(), 10, 20, "@me:hs").unwrap(), vec![20]);
        assert_eq!(memberships_between(db.conn(), 0, 100, "@other:hs").unwrap(), vec![15]);
    }
}
