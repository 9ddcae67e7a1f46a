//! Core types shared across the crate.

mod config;
mod device;

pub use config::{ClientConfig, ClientConfigBuilder};
pub use device::AppleTvDevice;
