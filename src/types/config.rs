use std::time::Duration;

/// Configuration for client behavior.
///
/// This is a plain, synchronously constructible struct: nothing here reads
/// environment variables or configuration files. The consuming application
/// owns configuration sourcing.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// This client's durable pairing identifier, persisted into every
    /// [`crate::protocol::pairing::Credential`] produced by pair-setup
    /// (default: a freshly generated UUID v4). Callers that want a stable
    /// identity across process restarts should generate one once, store
    /// it alongside the credential, and pass it back in on every run.
    pub client_identifier: String,

    /// `User-Agent` sent on every RTSP request after pair-verify (default:
    /// `"mrplink/{version}"`).
    pub user_agent: String,

    /// Timeout waiting for a pair-setup or pair-verify reply (default: 10s).
    pub pairing_timeout: Duration,

    /// Timeout waiting for a single MRP or Companion request/response
    /// exchange (default: 5s).
    pub request_timeout: Duration,

    /// Interval between heartbeat `POST /feedback` messages on the control
    /// channel, and between `DataStream` feedback frames (default: 2s, per
    /// spec §4.4/§4.7).
    pub heartbeat_interval: Duration,

    /// How long to wait after the MRP init dialogue for unsolicited server
    /// updates before considering the data channel ready (default: 500ms,
    /// per spec §4.7 step v).
    pub mrp_init_settle: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_identifier: uuid::Uuid::new_v4().to_string(),
            user_agent: format!("mrplink/{}", env!("CARGO_PKG_VERSION")),
            pairing_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(2),
            mrp_init_settle: Duration::from_millis(500),
        }
    }
}

impl ClientConfig {
    /// Create a new config builder.
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Override the durable client pairing identifier.
    #[must_use]
    pub fn client_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.config.client_identifier = identifier.into();
        self
    }

    /// Override the `User-Agent` string.
    #[must_use]
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = agent.into();
        self
    }

    /// Override the pairing timeout.
    #[must_use]
    pub fn pairing_timeout(mut self, timeout: Duration) -> Self {
        self.config.pairing_timeout = timeout;
        self
    }

    /// Override the request/response timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Override the heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Override the post-MRP-init settle interval.
    #[must_use]
    pub fn mrp_init_settle(mut self, interval: Duration) -> Self {
        self.config.mrp_init_settle = interval;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = ClientConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.mrp_init_settle, Duration::from_millis(500));
    }

    #[test]
    fn builder_overrides() {
        let config = ClientConfig::builder()
            .user_agent("test/1.0")
            .heartbeat_interval(Duration::from_secs(1))
            .build();
        assert_eq!(config.user_agent, "test/1.0");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
    }
}
