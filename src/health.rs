//! Waits for a sandbox's dev server to answer.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::HealthConfig;

/// Polls a service URL until it responds or a deadline passes.
#[derive(Debug, Clone)]
pub(crate) struct HealthProbe {
    client: reqwest::Client,
    timeout: Duration,
    interval: Duration,
}

impl HealthProbe {
    pub fn new(config: &HealthConfig) -> Self {
        let interval = Duration::from_millis(config.interval_ms.max(1));
        let client = reqwest::Client::builder()
            .timeout(interval.max(Duration::from_secs(2)))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            timeout: Duration::from_secs(config.timeout_secs),
            interval,
        }
    }

    /// Returns true once `url` answers with anything but a server error.
    /// Gives up quietly after the configured timeout; zero disables the
    /// probe.
    pub async fn wait_until_ready(&self, url: &str) -> bool {
        if self.timeout.is_zero() {
            return false;
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            match self.client.get(url).send().await {
                Ok(response) if !response.status().is_server_error() => {
                    debug!("Service at {} is up ({})", url, response.status());
                    return true;
                }
                Ok(response) => debug!("Service at {} answered {}", url, response.status()),
                Err(e) => debug!("Service at {} not reachable yet: {}", url, e),
            }

            if Instant::now() + self.interval >= deadline {
                warn!("Service at {} not ready after {:?}", url, self.timeout);
                return false;
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
