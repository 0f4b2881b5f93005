use std::time::Duration;

use serde::Deserialize;

/// Tunables for a call client. Every field has a default, so a partial JSON
/// document is enough to override a single value.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub negotiation_timeout_ms: u64,
    pub relay_connect_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    /// Re-registration attempts after the relay drops a connected call.
    pub max_reregister_attempts: u32,
    /// Base delay between re-registration attempts; attempt `n` waits `n` times this.
    pub reregister_backoff_ms: u64,
    pub stats_interval_ms: u64,
    pub command_queue_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_ms: 10_000,
            relay_connect_timeout_ms: 10_000,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            max_reregister_attempts: 3,
            reregister_backoff_ms: 1_000,
            stats_interval_ms: 1_000,
            command_queue_depth: 64,
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn relay_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn reregister_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.reregister_backoff_ms.saturating_mul(u64::from(attempt.max(1))))
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }
}
