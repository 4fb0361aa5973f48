use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Could not determine application data directory")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record not found")]
    NotFound,

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Event is missing a usable event_id: {0}")]
    BadEvent(String),

    #[error("Room {0} has no current state snapshot; a state block must arrive first")]
    RoomNotInitialised(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
