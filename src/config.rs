//! Configuration for the tree, its pool and its epoch service.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default pool size: 64 MiB.
pub const DEFAULT_POOL_SIZE: usize = 64 << 20;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtConfig {
    /// Persistent pool settings.
    pub pool: PoolConfig,
    /// Epoch reclamation settings.
    pub epoch: EpochConfig,
}

/// Persistent pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Backing file. `None` maps anonymous memory (volatile).
    pub path: Option<PathBuf>,
    /// Size of the mapped region in bytes.
    pub size_bytes: usize,
    /// Keep a shadow image updated only by explicit persists, so tests can
    /// capture what would survive a crash.
    pub crash_simulation: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            path: None,
            size_bytes: DEFAULT_POOL_SIZE,
            crash_simulation: false,
        }
    }
}

/// Epoch service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochConfig {
    /// Interval between background epoch advances, in milliseconds.
    pub tick_interval_ms: u64,
    /// Garbage bag length that triggers a sweep when a thread leaves.
    pub collect_threshold: usize,
    /// Spawn the background ticker. Without it the epoch advances only on
    /// sweeps.
    pub background_ticker: bool,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10,
            collect_threshold: 64,
            background_ticker: true,
        }
    }
}

impl ArtConfig {
    /// Volatile tree over anonymous memory.
    #[must_use]
    pub fn in_memory(size_bytes: usize) -> Self {
        Self {
            pool: PoolConfig {
                path: None,
                size_bytes,
                crash_simulation: false,
            },
            epoch: EpochConfig::default(),
        }
    }

    /// Persistent tree backed by `path`.
    #[must_use]
    pub fn persistent(path: impl Into<PathBuf>, size_bytes: usize) -> Self {
        Self {
            pool: PoolConfig {
                path: Some(path.into()),
                size_bytes,
                crash_simulation: false,
            },
            epoch: EpochConfig::default(),
        }
    }

    /// Enable the crash-simulation shadow image.
    #[must_use]
    pub fn with_crash_simulation(mut self) -> Self {
        self.pool.crash_simulation = true;
        self
    }

    /// Build a configuration from the environment, falling back to defaults.
    ///
    /// - `NVART_POOL_PATH`: backing file
    /// - `NVART_POOL_SIZE`: pool size in bytes
    /// - `NVART_EPOCH_TICK_MS`: ticker interval
    /// - `NVART_COLLECT_THRESHOLD`: garbage bag sweep threshold
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = env::var("NVART_POOL_PATH") {
            config.pool.path = Some(PathBuf::from(path));
        }
        if let Some(size) = parse_var::<usize>("NVART_POOL_SIZE") {
            config.pool.size_bytes = size;
        }
        if let Some(ms) = parse_var::<u64>("NVART_EPOCH_TICK_MS") {
            config.epoch.tick_interval_ms = ms;
        }
        if let Some(threshold) = parse_var::<usize>("NVART_COLLECT_THRESHOLD") {
            config.epoch.collect_threshold = threshold;
        }

        config
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ArtConfig::default();
        assert_eq!(config.pool.path, None);
        assert_eq!(config.pool.size_bytes, DEFAULT_POOL_SIZE);
        assert!(!config.pool.crash_simulation);
        assert!(config.epoch.background_ticker);
    }

    #[test]
    fn test_builders() {
        let config = ArtConfig::persistent("/tmp/x.pool", 1 << 20).with_crash_simulation();
        assert_eq!(config.pool.path, Some(PathBuf::from("/tmp/x.pool")));
        assert_eq!(config.pool.size_bytes, 1 << 20);
        assert!(config.pool.crash_simulation);

        let config = ArtConfig::in_memory(4 << 20);
        assert!(config.pool.path.is_none());
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        assert_eq!(parse_var::<usize>("NVART_TEST_SURELY_UNSET_VARIABLE"), None);
    }
}
