//! Nexus error types

use crate::child::OperationalState;
use crate::nexus::NexusState;
use crate::snapshot::ChildSnapshotResult;
use nexio_common::ConfigError;
use nexio_device::DeviceError;
use thiserror::Error;

/// Replication engine error
#[derive(Error, Debug)]
pub enum NexusError {
    /// Error from a device handle
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("nexus {0} already exists")]
    NexusExists(String),

    #[error("nexus {0} not found")]
    NexusNotFound(String),

    #[error("nexus {name} is {state}")]
    InvalidState { name: String, state: NexusState },

    /// Size is zero or not a multiple of the block size
    #[error("invalid size {size} for nexus {name}: {reason}")]
    InvalidSize {
        name: String,
        size: u64,
        reason: String,
    },

    #[error("nexus {0} has no children that could be opened")]
    NoHealthyChildren(String),

    #[error("child {child} not found in nexus {nexus}")]
    ChildNotFound { nexus: String, child: String },

    #[error("child {child} already exists in nexus {nexus}")]
    ChildExists { nexus: String, child: String },

    /// Geometry or capability mismatch; the child stays `ConfigInvalid`
    #[error("child {child} is incompatible: {reason}")]
    ChildIncompatible { child: String, reason: String },

    #[error("child {child} is {state}")]
    ChildInvalidState {
        child: String,
        state: OperationalState,
    },

    /// Refused to take the last healthy child out of service
    #[error("child {child} is the last healthy child of nexus {nexus}")]
    LastHealthyChild { nexus: String, child: String },

    #[error("nexus {0} has no write-eligible children")]
    NoWriters(String),

    #[error("nexus {0} has no read-eligible children")]
    NoReaders(String),

    #[error("rebuild of {child} already running")]
    RebuildExists { child: String },

    #[error("no rebuild for {child}")]
    RebuildNotFound { child: String },

    #[error("no healthy rebuild source for {child} in nexus {nexus}")]
    NoRebuildSource { nexus: String, child: String },

    #[error("child {child} does not need a rebuild")]
    RebuildNotNeeded { child: String },

    #[error("cannot {op} rebuild of {child} in state {state}")]
    RebuildInvalidState {
        child: String,
        op: &'static str,
        state: String,
    },

    #[error("snapshot names unknown child {child}")]
    SnapshotUnknownChild { child: String },

    #[error("snapshot names child {child} more than once")]
    SnapshotDuplicateChild { child: String },

    #[error("healthy child {child} missing from snapshot request")]
    SnapshotMissingChild { child: String },

    #[error("snapshot targets unhealthy child {child}; mark it skipped")]
    SnapshotUnhealthyChild { child: String },

    #[error("snapshot request has no participating children")]
    SnapshotNoParticipants,

    /// At least one participating child failed; created snapshots were rolled back
    #[error("snapshot of nexus {nexus} failed on {} children", failed_count(.results))]
    SnapshotFailed {
        nexus: String,
        results: Vec<ChildSnapshotResult>,
    },

    #[error("reservations are not configured for nexus {0}")]
    ReservationsDisabled(String),

    #[error("nexus {nexus} holds the reservation on {held} children, {required} required")]
    ReservationQuorum {
        nexus: String,
        held: usize,
        required: usize,
    },

    #[error("timed out draining I/O from child {child}")]
    DrainTimeout { child: String },
}

fn failed_count(results: &[ChildSnapshotResult]) -> usize {
    results.iter().filter(|r| r.outcome.is_failed()).count()
}

/// Result type for nexus operations
pub type NexusResult<T> = Result<T, NexusError>;
