//! Nexio Common
//!
//! Configuration and value types shared by the device layer, the replication
//! engine and the binaries.

pub mod config;
pub mod types;

pub use config::{ConfigError, NexusConfig, RebuildConfig, ReservationConfig};
pub use types::{ReservationPolicy, ReservationQuorum, SnapshotInfo, SnapshotParams};

/// Default rebuild segment size: 64 KiB
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024;

/// Default number of concurrent segment copies per rebuild job
pub const DEFAULT_REBUILD_CONCURRENCY: usize = 16;
