pub mod accumulator;
pub mod database;
pub mod devices;
pub mod events;
pub mod membership;
pub mod migrations;
pub mod models;
pub mod snapshots;
pub mod to_device;
pub mod typing;

mod error;

pub use accumulator::{AccumulateResult, InitialiseResult};
pub use database::Database;
pub use error::StoreError;
pub use events::EVENTS_START;
pub use membership::MEMBERSHIP_LOG_OFFSET_START;
pub use models::*;
