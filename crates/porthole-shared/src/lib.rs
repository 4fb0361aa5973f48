pub mod protocol;
pub mod types;

pub use protocol::{Op, Request, RequestList, Response, ResponseList, Room, SliceRange};
pub use types::ConnId;
