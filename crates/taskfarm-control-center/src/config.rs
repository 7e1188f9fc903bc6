//! Control center configuration.

use std::time::Duration;

use taskfarm_core::SyncTimeouts;

/// Control center configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address.
    pub bind_addr: String,

    /// Interval at which agents are expected to sync (seconds). Drives the
    /// warning and lost thresholds.
    pub sync_interval_secs: u64,

    /// Period of the sweep that updates connection status and expires run
    /// timeouts (seconds).
    pub sweep_interval_secs: u64,
}

impl Config {
    /// Liveness thresholds derived from the sync interval.
    pub fn timeouts(&self) -> SyncTimeouts {
        SyncTimeouts::from_interval(self.sync_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "[::1]:8100".to_string(),
            sync_interval_secs: 30,
            sweep_interval_secs: 5,
        }
    }
}
