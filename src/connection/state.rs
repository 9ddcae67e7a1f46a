//! Connection state management

use crate::types::AppleTvDevice;
use std::time::Instant;

/// Connection state, shared by the AirPlay and Companion state machines.
/// Transitions are monotonic towards either `Ready` or `Closing`; Companion
/// connections skip `VerifyComplete`/`SetupInProgress` and go straight from
/// `VerifyInProgress` to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket open.
    Disconnected,
    /// TCP connection established, nothing sent yet.
    TcpOpen,
    /// Pair-verify in flight.
    VerifyInProgress,
    /// Pair-verify succeeded; encrypted framing is now in effect
    /// (AirPlay only — Companion moves directly to `Ready`).
    VerifyComplete,
    /// RTSP SETUP/RECORD and MRP init dialogue in flight (AirPlay only).
    SetupInProgress,
    /// Fully usable for control traffic.
    Ready,
    /// Tearing down, either by request or after a fatal error.
    Closing,
}

impl ConnectionState {
    /// Whether this state still admits the possibility of reaching `Ready`.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::TcpOpen
                | ConnectionState::VerifyInProgress
                | ConnectionState::VerifyComplete
                | ConnectionState::SetupInProgress
        )
    }

    /// Check if fully connected and ready for control traffic.
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    /// Check if torn down or tearing down.
    #[must_use]
    pub fn is_closing(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Disconnected)
    }
}

/// Connection events
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// State changed
    StateChanged {
        /// The previous state
        old: ConnectionState,
        /// The new state
        new: ConnectionState,
    },
    /// Connection established
    Connected {
        /// The connected device
        device: AppleTvDevice,
    },
    /// Connection lost
    Disconnected {
        /// The disconnected device
        device: AppleTvDevice,
        /// The reason for disconnection
        reason: DisconnectReason,
    },
    /// Pairing required (no stored credentials for this device)
    PairingRequired {
        /// The device requiring pairing
        device: AppleTvDevice,
    },
    /// Error occurred
    Error {
        /// The error message
        message: String,
        /// Whether the error is recoverable
        recoverable: bool,
    },
}

/// Reason for disconnection
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// User requested disconnect
    UserRequested,
    /// Network error
    NetworkError(String),
    /// Device went offline
    DeviceOffline,
    /// Authentication failed
    AuthenticationFailed,
    /// Protocol error
    ProtocolError(String),
    /// Timeout
    Timeout,
}

/// Connection statistics
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Time connection was established
    pub connected_at: Option<Instant>,
    /// Number of bytes sent
    pub bytes_sent: u64,
    /// Number of bytes received
    pub bytes_received: u64,
    /// Number of reconnection attempts
    pub reconnect_attempts: u32,
    /// Last error message
    pub last_error: Option<String>,
    /// Round-trip time (if measured)
    pub rtt_ms: Option<u32>,
}

impl ConnectionStats {
    /// Get connection uptime
    #[must_use]
    pub fn uptime(&self) -> Option<std::time::Duration> {
        self.connected_at.map(|t| t.elapsed())
    }

    /// Record bytes sent
    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    /// Record bytes received
    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }
}
