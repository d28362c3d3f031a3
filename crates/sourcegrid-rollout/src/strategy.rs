//! Rolling update configuration.

use std::time::Duration;

/// Configuration for rolling updates.
#[derive(Debug, Clone)]
pub struct RollingConfig {
    /// Instances restarted per batch.
    pub batch_size: u32,
    /// Cap on the share of the new parallelism that may be restarting at once.
    pub max_unavailable_fraction: f64,
    /// How long a batch may take to report RUNNING on the new version.
    pub health_timeout: Duration,
    /// Delay between health polls.
    pub poll_interval: Duration,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_unavailable_fraction: 0.25,
            health_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl RollingConfig {
    /// Batch size for a rollout to `parallelism` instances.
    ///
    /// `min(batch_size, max(1, floor(fraction * parallelism)))`, where an
    /// explicit override replaces the configured batch size.
    pub fn effective_batch_size(&self, parallelism: u32, batch_override: Option<u32>) -> u32 {
        let requested = batch_override.unwrap_or(self.batch_size).max(1);
        let fraction = self.max_unavailable_fraction.clamp(0.0, 1.0);
        let cap = ((fraction * parallelism as f64).floor() as u32).max(1);
        requested.min(cap)
    }
}
