//! DataStream framing: the 32-byte header frame carrying MRP protobuf
//! payloads wrapped in a binary property list, plus the heartbeat/reply
//! discipline described in §4.4.

mod frame;
mod heartbeat;

pub use frame::{DataStreamFrame, MessageKind};
pub use heartbeat::Heartbeat;
