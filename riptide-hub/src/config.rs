//! Centralized configuration for the hub.
//!
//! Timers and buffer sizes live here instead of being scattered through the
//! actor.

use std::time::Duration;

use crate::HubError;

/// Tunables for the hub actor.
///
/// A zero `heartbeat_timeout` or `sweep_interval` disables the
/// corresponding behavior entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Silence after which a client is considered dead
    pub heartbeat_timeout: Duration,
    /// Interval between liveness sweeps and `update` broadcasts
    pub sweep_interval: Duration,
    /// Minimum spacing of `download`/`upload` messages per session
    pub progress_throttle: Duration,
    /// Capacity of the command channel
    pub command_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            progress_throttle: Duration::from_secs(1),
            command_buffer: 100,
        }
    }
}

impl HubConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Reads `RIPTIDE_HEARTBEAT_TIMEOUT_MS`, `RIPTIDE_SWEEP_INTERVAL_MS`
    /// and `RIPTIDE_PROGRESS_THROTTLE_MS`.
    ///
    /// # Errors
    /// - `HubError::Configuration` - A variable is set but not a number
    pub fn from_env() -> Result<Self, HubError> {
        let mut config = Self::default();

        if let Some(timeout) = duration_from_env("RIPTIDE_HEARTBEAT_TIMEOUT_MS")? {
            config.heartbeat_timeout = timeout;
        }
        if let Some(interval) = duration_from_env("RIPTIDE_SWEEP_INTERVAL_MS")? {
            config.sweep_interval = interval;
        }
        if let Some(throttle) = duration_from_env("RIPTIDE_PROGRESS_THROTTLE_MS")? {
            config.progress_throttle = throttle;
        }

        Ok(config)
    }

    /// Creates a configuration for tests: no background sweeps and no
    /// progress throttling.
    pub fn for_testing() -> Self {
        Self {
            heartbeat_timeout: Duration::ZERO,
            sweep_interval: Duration::ZERO,
            progress_throttle: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn expiry_enabled(&self) -> bool {
        !self.heartbeat_timeout.is_zero()
    }

    pub fn sweeper_enabled(&self) -> bool {
        !self.sweep_interval.is_zero()
    }
}

fn duration_from_env(name: &str) -> Result<Option<Duration>, HubError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| HubError::Configuration {
                reason: format!("{name}={raw}: {e}"),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = HubConfig::default();

        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert_eq!(config.progress_throttle, Duration::from_secs(1));
        assert!(config.expiry_enabled());
        assert!(config.sweeper_enabled());
    }

    #[test]
    fn test_testing_preset_disables_timers() {
        let config = HubConfig::for_testing();

        assert!(!config.expiry_enabled());
        assert!(!config.sweeper_enabled());
        assert!(config.progress_throttle.is_zero());
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("RIPTIDE_HEARTBEAT_TIMEOUT_MS", "1000");
            std::env::set_var("RIPTIDE_SWEEP_INTERVAL_MS", "0");
        }

        let config = HubConfig::from_env().unwrap();
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(1000));
        assert!(!config.sweeper_enabled());

        unsafe {
            std::env::set_var("RIPTIDE_PROGRESS_THROTTLE_MS", "soon");
        }
        assert!(matches!(
            HubConfig::from_env(),
            Err(HubError::Configuration { .. })
        ));

        // Cleanup
        unsafe {
            std::env::remove_var("RIPTIDE_HEARTBEAT_TIMEOUT_MS");
            std::env::remove_var("RIPTIDE_SWEEP_INTERVAL_MS");
            std::env::remove_var("RIPTIDE_PROGRESS_THROTTLE_MS");
        }
    }
}
