//! # mrplink
//!
//! A pure Rust client library for establishing authenticated, encrypted
//! control sessions with Apple TV devices over Apple's Media Remote
//! Protocol (MRP) and Companion Link.
//!
//! ## Features
//!
//! - `HomeKit`-style pair-setup (PIN) and pair-verify handshakes
//! - AirPlay control/event/data channel establishment (§4.7)
//! - Companion Link pairing and `E_OPACK` request/response channel (§4.8)
//! - MRP envelope dispatch: playback commands, HID remote key presses
//! - Durable credential storage behind a pluggable trait
//!
//! ## Example
//!
//! ```rust,no_run
//! use mrplink::{ClientConfig, ConnectionManager};
//! use mrplink::types::AppleTvDevice;
//!
//! # async fn example(device: AppleTvDevice, credential: mrplink::protocol::pairing::CredentialHalf) -> Result<(), mrplink::MrpError> {
//! let manager = ConnectionManager::new(ClientConfig::default());
//! manager.connect(&device, &credential).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Connection state machine: AirPlay control/event/data channels and the
/// Companion Link channel.
pub mod connection;
/// Top-level error type.
pub mod error;
/// Async runtime helpers (sleep, timeout, clock).
pub mod net;
/// Wire protocols: pairing, RTSP, HAP/Companion framing, MRP envelopes.
pub mod protocol;
/// In-process testing harness used by this crate's own tests.
pub mod testing;
/// Core configuration and device types.
pub mod types;

pub use connection::{CompanionConnection, ConnectionEvent, ConnectionManager, ConnectionState, ConnectionStats, DisconnectReason};
pub use error::MrpError;
pub use types::{AppleTvDevice, ClientConfig, ClientConfigBuilder};
