//! Connection management

mod companion;
mod manager;
mod state;

pub use companion::CompanionConnection;
pub use manager::ConnectionManager;
pub use state::{ConnectionEvent, ConnectionState, ConnectionStats, DisconnectReason};

#[cfg(test)]
mod tests;
