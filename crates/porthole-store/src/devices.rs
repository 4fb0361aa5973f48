use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Device;

impl Database {
    /// Insert a device row if one does not exist, then return the row.
    /// Idempotent: a second insert of the same device ID is a no-op that
    /// returns the existing record.
    pub fn insert_device(&self, device_id: &str) -> Result<Device> {
        self.conn().execute(
            "INSERT OR IGNORE INTO devices (device_id) VALUES (?1)",
            params![device_id],
        )?;
        self.device(device_id)
    }

    pub fn device(&self, device_id: &str) -> Result<Device> {
        self.conn()
            .query_row(
                "SELECT device_id, user_id, since FROM devices WHERE device_id = ?1",
                params![device_id],
                |row| {
                    Ok(Device {
                        device_id: row.get(0)?,
                        user_id: row.get(1)?,
                        since: row.get(2)?,
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn update_device_user_id(&self, device_id: &str, user_id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE devices SET user_id = ?2 WHERE device_id = ?1",
            params![device_id, user_id],
        )?;
        Ok(())
    }

    /// Advance the upstream cursor. Called only after a whole batch has
    /// been folded in without error.
    pub fn update_device_since(&self, device_id: &str, since: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE devices SET since = ?2 WHERE device_id = ?1",
            params![device_id, since],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[test]
    fn insert_is_idempotent_and_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();

        let dev = db.insert_device("DEV1").unwrap();
        assert_eq!(dev.user_id, "");
        assert_eq!(dev.since, "");

        db.update_device_user_id("DEV1", "@me:hs").unwrap();
        db.update_device_since("DEV1", "s_100").unwrap();

        let again = db.insert_device("DEV1").unwrap();
        assert_eq!(again.user_id, "@me:hs");
        assert_eq!(again.since, "s_100");
    }

    #[test]
    fn missing_device_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        assert!(matches!(db.device("nope"), Err(StoreError::NotFound)));
    }
}
