//! Media Remote Protocol message engine: the protobuf-typed wire envelope,
//! the HID/command encodings carried inside it, and the inbound dispatcher.

mod commands;
mod dispatch;
mod hid;
mod message;

pub use commands::Command;
pub use dispatch::Dispatcher;
pub use hid::{hid_event_payload, Key, LONG_PRESS_GAP, MIN_PRESS_GAP};
pub use message::{Envelope, MessageType};
