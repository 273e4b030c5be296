//! Simulation parameters.

use std::time::Duration;

/// Knobs for the simulated engine.
///
/// Every simulated torrent has the same shape; transfer speed, peers and
/// failures vary per tick around the configured values.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    /// Deterministic seed for reproducible runs, random when `None`
    pub deterministic_seed: Option<u64>,
    /// Mean download speed in bytes per second
    pub simulated_download_speed: u64,
    /// Bytes uploaded per byte downloaded
    pub upload_ratio: f64,
    /// Maximum simulated peers per torrent
    pub max_simulated_peers: usize,
    /// Time between progress steps
    pub tick_interval: Duration,
    /// Total size of every simulated torrent
    pub torrent_length: u64,
    /// Number of files every simulated torrent is split into
    pub files_per_torrent: usize,
    /// Probability (0.0 to 1.0) that adding a torrent raises an engine warning
    pub tracker_failure_rate: f64,
    /// Interface endpoints bind to unless a request names one
    pub listen_host: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            simulated_download_speed: 1_048_576, // 1 MB/s
            upload_ratio: 0.25,
            max_simulated_peers: 20,
            tick_interval: Duration::from_millis(500),
            torrent_length: 64 * 1024 * 1024,
            files_per_torrent: 3,
            tracker_failure_rate: 0.0,
            listen_host: "127.0.0.1".to_string(),
        }
    }
}

impl SimulationConfig {
    /// Creates a configuration for deterministic testing.
    ///
    /// Torrents are small and fast so a full transfer takes a handful of
    /// ticks.
    pub fn deterministic_testing() -> Self {
        Self {
            deterministic_seed: Some(42),
            simulated_download_speed: 10_485_760, // 10 MB/s
            max_simulated_peers: 10,
            tick_interval: Duration::from_millis(100),
            torrent_length: 4 * 1024 * 1024,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_testing_preset_finishes_quickly() {
        let config = SimulationConfig::deterministic_testing();
        let ticks = config.torrent_length / (config.simulated_download_speed / 10);

        assert_eq!(config.deterministic_seed, Some(42));
        assert!(ticks < 10);
    }
}
