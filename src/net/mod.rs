//! Runtime helpers shared by the connection state machines.

use std::future::Future;

/// Small wrapper around the tokio timer facilities used throughout the
/// connection and pairing code, kept as a named seam so call sites read
/// `Runtime::sleep` / `Runtime::timeout` rather than reaching into `tokio`
/// directly.
pub struct Runtime;

impl Runtime {
    /// Sleep for the specified duration.
    pub async fn sleep(duration: std::time::Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Run a future with a timeout.
    ///
    /// # Errors
    ///
    /// Returns `TimeoutError` if the future does not complete within the
    /// specified duration.
    pub async fn timeout<F, T>(duration: std::time::Duration, future: F) -> Result<T, TimeoutError>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout(duration, future)
            .await
            .map_err(|_| TimeoutError)
    }

    /// Get current timestamp.
    #[must_use]
    pub fn now() -> std::time::Instant {
        std::time::Instant::now()
    }
}

/// A future did not complete within the allotted duration.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutError;

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation timed out")
    }
}

impl std::error::Error for TimeoutError {}
