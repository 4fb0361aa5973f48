//! v001 -- Initial schema creation.
//!
//! Creates the event store, state snapshots, the per-room current-state
//! pointer, the membership log, and the per-device bookkeeping tables.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Events
--
-- nid is the global numeric event ID: AUTOINCREMENT guarantees it is
-- strictly increasing and never reused, even across deletes.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS events (
    nid        INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id   TEXT NOT NULL UNIQUE,
    room_id    TEXT NOT NULL,
    event_type TEXT NOT NULL,
    state_key  TEXT,                        -- NULL for non-state events
    sender     TEXT NOT NULL DEFAULT '',
    membership TEXT,                        -- content.membership for member events
    json       TEXT NOT NULL                -- the opaque upstream event
);

CREATE INDEX IF NOT EXISTS idx_events_room_nid ON events(room_id, nid);

-- ----------------------------------------------------------------
-- State snapshots
--
-- A snapshot is an immutable unordered set of event NIDs. ref_count
-- tracks how many holders reference it; a snapshot with ref_count = 0
-- that is no current snapshot may be garbage collected.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS room_snapshots (
    snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id     TEXT NOT NULL,
    ref_count   INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS snapshot_events (
    snapshot_id INTEGER NOT NULL,
    event_nid   INTEGER NOT NULL,

    FOREIGN KEY (snapshot_id) REFERENCES room_snapshots(snapshot_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_snapshot_events_id ON snapshot_events(snapshot_id);

-- ----------------------------------------------------------------
-- Rooms: the current-state pointer
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS rooms (
    room_id             TEXT PRIMARY KEY NOT NULL,
    current_snapshot_id INTEGER NOT NULL,

    FOREIGN KEY (current_snapshot_id) REFERENCES room_snapshots(snapshot_id)
);

-- ----------------------------------------------------------------
-- Membership log: append-only record of membership transitions
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS membership_log (
    event_nid      INTEGER NOT NULL,
    room_id        TEXT NOT NULL,
    target_user_id TEXT NOT NULL,
    membership     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_membership_log_target
    ON membership_log(target_user_id, event_nid);

-- ----------------------------------------------------------------
-- Devices: one upstream poll loop per device
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS devices (
    device_id TEXT PRIMARY KEY NOT NULL,
    user_id   TEXT NOT NULL DEFAULT '',
    since     TEXT NOT NULL DEFAULT ''
);

-- ----------------------------------------------------------------
-- To-device messages: per-device FIFO of opaque payloads
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS to_device_messages (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    message   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_to_device_device ON to_device_messages(device_id, id);

-- ----------------------------------------------------------------
-- Typing: versioned per-room set of currently-typing users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS typing (
    room_id  TEXT NOT NULL,
    version  INTEGER NOT NULL,
    user_ids TEXT NOT NULL,                 -- JSON-encoded sorted list

    PRIMARY KEY (room_id, version)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
