//! Configuration types for Nexio
//!
//! Every section has a `Default` so a config file only needs to name the
//! values it overrides.

use crate::types::{ReservationPolicy, ReservationQuorum};
use crate::{DEFAULT_REBUILD_CONCURRENCY, DEFAULT_SEGMENT_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Nexus configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NexusConfig {
    /// Number of I/O channels (one per execution context)
    pub io_channels: usize,
    /// Expected block size; taken from the first child when unset
    pub block_size: Option<u32>,
    /// How many times a partially failed write is resubmitted (at least 1)
    pub max_write_retries: u32,
    /// How long removal waits for in-flight I/O on a child to drain
    pub drain_timeout_ms: u64,
    /// Interval of the faulted-child reconnect loop (0 disables the loop)
    pub reconnect_interval_ms: u64,
    /// Start a rebuild automatically when a child comes up out of sync
    pub auto_rebuild: bool,
    /// Log writes missed by a faulted child so it can be partially rebuilt
    pub partial_rebuild: bool,
    /// Number of rebuild records kept for diagnostics
    pub history_capacity: usize,
    /// Rebuild tuning
    pub rebuild: RebuildConfig,
    /// Split-brain protection; disabled when unset
    pub reservation: Option<ReservationConfig>,
}

impl Default for NexusConfig {
    fn default() -> Self {
        Self {
            io_channels: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
            block_size: None,
            max_write_retries: 1,
            drain_timeout_ms: 30_000,
            reconnect_interval_ms: 10_000,
            auto_rebuild: true,
            partial_rebuild: true,
            history_capacity: 16,
            rebuild: RebuildConfig::default(),
            reservation: None,
        }
    }
}

impl NexusConfig {
    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_channels == 0 {
            return Err(ConfigError::Invalid(
                "io_channels must be at least 1".to_string(),
            ));
        }
        if self.max_write_retries == 0 {
            return Err(ConfigError::Invalid(
                "max_write_retries must be at least 1".to_string(),
            ));
        }
        if let Some(block_size) = self.block_size
            && !block_size.is_power_of_two()
        {
            return Err(ConfigError::Invalid(format!(
                "block_size {block_size} is not a power of two"
            )));
        }
        self.rebuild.validate()?;
        if let Some(ref reservation) = self.reservation {
            reservation.validate()?;
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Option<Duration> {
        (self.reconnect_interval_ms > 0).then(|| Duration::from_millis(self.reconnect_interval_ms))
    }
}

/// Rebuild engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RebuildConfig {
    /// Size of one copy unit in bytes
    pub segment_size: u64,
    /// Bound on concurrent segment copies per job
    pub max_concurrent_segments: usize,
    /// Re-read every copied segment from the destination and compare
    pub verify: bool,
    /// Unpaused replay passes before the final paused pass
    pub max_replay_passes: u32,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            max_concurrent_segments: DEFAULT_REBUILD_CONCURRENCY,
            verify: false,
            max_replay_passes: 4,
        }
    }
}

impl RebuildConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_size == 0 || !self.segment_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "rebuild segment_size {} must be a non-zero power of two",
                self.segment_size
            )));
        }
        if self.max_concurrent_segments == 0 {
            return Err(ConfigError::Invalid(
                "rebuild max_concurrent_segments must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reservation (split-brain protection) configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    /// Holder key registered on every child
    pub key: u64,
    /// Reservation type to acquire
    pub policy: ReservationPolicy,
    /// Key of a dead peer the operator allows us to preempt when the nexus
    /// is created; children reopened or added later never preempt
    pub preempt_key: Option<u64>,
    /// Holders required before the replica set counts as owned
    pub quorum: ReservationQuorum,
    /// Shut the whole nexus down when another instance takes write access
    pub shutdown_on_conflict: bool,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            key: 1,
            policy: ReservationPolicy::default(),
            preempt_key: None,
            quorum: ReservationQuorum::default(),
            shutdown_on_conflict: true,
        }
    }
}

impl ReservationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.key == 0 {
            return Err(ConfigError::Invalid(
                "reservation key must be non-zero".to_string(),
            ));
        }
        if self.preempt_key == Some(self.key) {
            return Err(ConfigError::Invalid(
                "reservation preempt_key must differ from key".to_string(),
            ));
        }
        Ok(())
    }
}
