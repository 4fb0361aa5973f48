use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Append to-device messages for a device, preserving input order.
    /// The messages are opaque; the store only guarantees FIFO delivery.
    pub fn insert_to_device_messages(
        &self,
        device_id: &str,
        msgs: &[serde_json::Value],
    ) -> Result<usize> {
        let mut stmt = self
            .conn()
            .prepare("INSERT INTO to_device_messages (device_id, message) VALUES (?1, ?2)")?;
        for msg in msgs {
            stmt.execute(params![device_id, msg.to_string()])?;
        }
        Ok(msgs.len())
    }

    /// Queued messages for a device, oldest first.
    pub fn to_device_messages(&self, device_id: &str) -> Result<Vec<serde_json::Value>> {
        let mut stmt = self.conn().prepare(
            "SELECT message FROM to_device_messages WHERE device_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![device_id], |row| row.get::<_, String>(0))?;
        let mut msgs = Vec::new();
        for row in rows {
            msgs.push(serde_json::from_str(&row.map_err(StoreError::Sqlite)?)?);
        }
        Ok(msgs)
    }
}

#[cfg(test)]
mod tests {
    use crate::database::Database;
    use serde_json::json;

    #[test]
    fn messages_come_back_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();

        db.insert_to_device_messages("DEV1", &[json!({"n": 1}), json!({"n": 2})])
            .unwrap();
        db.insert_to_device_messages("DEV1", &[json!({"n": 3})]).unwrap();
        db.insert_to_device_messages("DEV2", &[json!({"n": 99})]).unwrap();

        let msgs = db.to_device_messages("DEV1").unwrap();
        assert_eq!(msgs, vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
    }
}
