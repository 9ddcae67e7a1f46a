use crate::net::Runtime;
use crate::types::ClientConfig;
use std::time::Duration;

/// Drives the periodic `POST /feedback`-equivalent heartbeat that keeps a
/// DataStream connection alive, firing every `heartbeat_interval`.
pub struct Heartbeat {
    interval: Duration,
}

impl Heartbeat {
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            interval: config.heartbeat_interval,
        }
    }

    /// Suspend until the next heartbeat is due.
    pub async fn wait_for_next_tick(&self) {
        Runtime::sleep(self.interval).await;
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_is_taken_from_config() {
        let config = ClientConfig::builder()
            .heartbeat_interval(Duration::from_millis(250))
            .build();
        let heartbeat = Heartbeat::new(&config);
        assert_eq!(heartbeat.interval(), Duration::from_millis(250));
    }
}
