//! Configuration for the session engine.

use easync_protocol::{ProvisioningMode, DEFAULT_WINDOW_SIZE};
use std::time::Duration;

/// Configuration shared by every request of a server.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Window size used when neither the client nor the cache supplies one.
    pub default_window_size: u32,
    /// Pause after a generic backend error inside a long poll.
    pub backend_backoff: Duration,
    /// Poll granularity of PING and looping SYNC requests.
    pub ping_interval: Duration,
    /// Smallest heartbeat a client may request.
    pub min_heartbeat: Duration,
    /// Largest heartbeat a client may request.
    pub max_heartbeat: Duration,
    /// How often a client may replay one synckey before its state is reset.
    pub max_synckey_count: u32,
    /// Device provisioning policy; remote wipes are only honored when enabled.
    pub provisioning: ProvisioningMode,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            default_window_size: DEFAULT_WINDOW_SIZE,
            backend_backoff: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            min_heartbeat: Duration::from_secs(60),
            max_heartbeat: Duration::from_secs(3540),
            max_synckey_count: 20,
            provisioning: ProvisioningMode::None,
        }
    }

    /// Sets the default window size.
    pub fn with_default_window_size(mut self, size: u32) -> Self {
        self.default_window_size = size;
        self
    }

    /// Sets the backoff after a generic backend error.
    pub fn with_backend_backoff(mut self, backoff: Duration) -> Self {
        self.backend_backoff = backoff;
        self
    }

    /// Sets the poll interval.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Sets the accepted heartbeat range.
    pub fn with_heartbeat_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_heartbeat = min;
        self.max_heartbeat = max;
        self
    }

    /// Sets the synckey replay limit.
    pub fn with_max_synckey_count(mut self, count: u32) -> Self {
        self.max_synckey_count = count;
        self
    }

    /// Sets the provisioning policy.
    pub fn with_provisioning(mut self, mode: ProvisioningMode) -> Self {
        self.provisioning = mode;
        self
    }

    /// Returns true if `seconds` is an acceptable heartbeat.
    pub fn heartbeat_in_bounds(&self, seconds: u64) -> bool {
        seconds >= self.min_heartbeat.as_secs() && seconds <= self.max_heartbeat.as_secs()
    }

    /// Clamps `seconds` into the accepted heartbeat range.
    pub fn clamp_heartbeat(&self, seconds: u64) -> u64 {
        seconds.clamp(self.min_heartbeat.as_secs(), self.max_heartbeat.as_secs())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_window_size, 100);
        assert_eq!(config.backend_backoff, Duration::from_secs(30));
        assert_eq!(config.ping_interval, Duration::from_secs(10));
        assert_eq!(config.max_synckey_count, 20);
        assert!(!config.provisioning.is_enabled());
    }

    #[test]
    fn heartbeat_bounds() {
        let config = EngineConfig::new();
        assert!(!config.heartbeat_in_bounds(59));
        assert!(config.heartbeat_in_bounds(60));
        assert!(config.heartbeat_in_bounds(3540));
        assert!(!config.heartbeat_in_bounds(3541));
        assert_eq!(config.clamp_heartbeat(5), 60);
        assert_eq!(config.clamp_heartbeat(9000), 3540);

        let config = config.with_heartbeat_bounds(Duration::from_secs(1), Duration::from_secs(10));
        assert!(config.heartbeat_in_bounds(10));
    }

    #[test]
    fn builder() {
        let config = EngineConfig::new()
            .with_default_window_size(25)
            .with_ping_interval(Duration::from_secs(3))
            .with_max_synckey_count(5)
            .with_provisioning(ProvisioningMode::Enforced);
        assert_eq!(config.default_window_size, 25);
        assert_eq!(config.ping_interval.as_secs(), 3);
        assert_eq!(config.max_synckey_count, 5);
        assert!(config.provisioning.is_enabled());
    }
}
