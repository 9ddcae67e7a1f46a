use std::net::IpAddr;

/// A device record describing an Apple TV (or HomePod acting as an MRP
/// peer) to connect to.
///
/// Device records are supplied by the caller; this library does not
/// perform mDNS/Bonjour discovery (out of scope, see Non-goals).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppleTvDevice {
    /// Stable identifier for the device (e.g. from a prior discovery pass
    /// or a user-entered hostname).
    pub id: String,

    /// Human-readable device name.
    pub name: String,

    /// Resolved IP addresses, in preference order.
    pub addresses: Vec<IpAddr>,

    /// Port for the AirPlay/HAP control connection (RTSP + HAP-encrypted
    /// MRP traffic).
    pub control_port: u16,

    /// Port for the Companion Link connection, when supported.
    pub companion_port: Option<u16>,
}

impl AppleTvDevice {
    /// Create a device record with no Companion Link port.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        addresses: Vec<IpAddr>,
        control_port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            addresses,
            control_port,
            companion_port: None,
        }
    }

    /// Set the Companion Link port.
    #[must_use]
    pub fn with_companion_port(mut self, port: u16) -> Self {
        self.companion_port = Some(port);
        self
    }

    /// The primary address to dial, preferring IPv4 over link-local IPv6.
    #[must_use]
    pub fn address(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| {
                self.addresses
                    .iter()
                    .find(|addr| matches!(addr, IpAddr::V6(v6) if v6.segments()[0] != 0xfe80))
            })
            .or_else(|| self.addresses.first())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn prefers_ipv4_address() {
        let device = AppleTvDevice::new(
            "abc",
            "Living Room",
            vec![
                IpAddr::V6(std::net::Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            ],
            7000,
        );
        assert_eq!(
            device.address(),
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)))
        );
    }

    #[test]
    fn companion_port_optional() {
        let device = AppleTvDevice::new("abc", "Living Room", vec![], 7000);
        assert_eq!(device.companion_port, None);
        let device = device.with_companion_port(49152);
        assert_eq!(device.companion_port, Some(49152));
    }
}
