//! Companion Link framing and session encryption.

mod frame;
mod session;

pub use frame::{CompanionFrame, FrameType};
pub use session::CompanionSession;
