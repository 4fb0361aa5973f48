use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Record the set of users currently typing in a room, versioned by a
    /// per-room monotonic counter. Idempotent: if the set is unchanged
    /// from the latest recorded version, that version is returned and
    /// nothing is written.
    pub fn set_typing(&mut self, room_id: &str, user_ids: &[String]) -> Result<i64> {
        let mut sorted: Vec<&str> = user_ids.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();
        let encoded = serde_json::to_string(&sorted)?;

        let txn = self.conn_mut().transaction()?;
        let latest: Option<(i64, String)> = txn
            .query_row(
                "SELECT version, user_ids FROM typing WHERE room_id = ?1
                 ORDER BY version DESC LIMIT 1",
                params![room_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((version, existing)) = &latest {
            if *existing == encoded {
                return Ok(*version);
            }
        }

        let version = latest.map(|(v, _)| v + 1).unwrap_or(1);
        txn.execute(
            "INSERT INTO typing (room_id, version, user_ids) VALUES (?1, ?2, ?3)",
            params![room_id, version, encoded],
        )?;
        txn.commit()?;
        Ok(version)
    }

    /// Latest typing set for a room, with its version.
    pub fn typing_users(&self, room_id: &str) -> Result<(i64, Vec<String>)> {
        let latest: Option<(i64, String)> = self
            .conn()
            .query_row(
                "SELECT version, user_ids FROM typing WHERE room_id = ?1
                 ORDER BY version DESC LIMIT 1",
                params![room_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match latest {
            Some((version, encoded)) => Ok((version, serde_json::from_str(&encoded)?)),
            None => Ok((0, Vec::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::database::Database;

    #[test]
    fn unchanged_sets_do_not_bump_the_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open_at(&dir.path().join("test.db")).unwrap();

        let v1 = db.set_typing("!r:hs", &["@a:hs".into(), "@b:hs".into()]).unwrap();
        assert_eq!(v1, 1);

        // same set, different order: no new version
        let v2 = db.set_typing("!r:hs", &["@b:hs".into(), "@a:hs".into()]).unwrap();
        assert_eq!(v2, v1);

        let v3 = db.set_typing("!r:hs", &["@a:hs".into()]).unwrap();
        assert_eq!(v3, 2);

        let (version, users) = db.typing_users("!r:hs").unwrap();
        assert_eq!(version, 2);
        assert_eq!(users, vec!["@a:hs".to_string()]);
    }

    #[test]
    fn versions_are_tracked_per_room() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open_at(&dir.path().join("test.db")).unwrap();

        assert_eq!(db.set_typing("!a:hs", &["@a:hs".into()]).unwrap(), 1);
        assert_eq!(db.set_typing("!b:hs", &["@a:hs".into()]).unwrap(), 1);
        assert_eq!(db.typing_users("!c:hs").unwrap(), (0, Vec::new()));
    }
}
