//! In-process testing harness for connection-state-machine and protocol
//! tests, used in place of real hardware.
//!
//! `MockApplePeer` speaks the TLV8 pairing handshake and HAP/Companion
//! framing over an in-memory duplex pair, adapted from the teacher's
//! `TcpListener`-backed mock server since unit-level framing and
//! session tests need no real socket.

mod mock_peer;

pub use mock_peer::MockApplePeer;

use crate::types::AppleTvDevice;
use std::net::{IpAddr, Ipv4Addr};

/// Build an `AppleTvDevice` record for use in tests, bypassing discovery.
#[must_use]
pub fn test_device(id: &str, name: &str) -> AppleTvDevice {
    AppleTvDevice::new(id, name, vec![IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))], 7000)
}
