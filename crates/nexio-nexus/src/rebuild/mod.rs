//! Rebuild engine
//!
//! Copies data from a healthy child to an out-of-sync one. A full rebuild
//! copies every segment, a partial rebuild only the segments set in a dirty
//! map. Writes that land during the copy are recorded in a per-job log and
//! replayed afterwards; the last replay pass runs with application I/O
//! paused so the destination turns synced atomically.

mod history;
mod job;

pub use history::{RebuildHistory, RebuildRecord};
pub use job::RebuildJob;

use nexio_device::DeviceError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Rebuild strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildKind {
    /// Copy the whole range
    Full,
    /// Copy only segments marked in a dirty map
    Partial,
}

impl fmt::Display for RebuildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildKind::Full => write!(f, "full"),
            RebuildKind::Partial => write!(f, "partial"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildState {
    Init,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl RebuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RebuildState::Completed | RebuildState::Failed | RebuildState::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RebuildState::Init => "init",
            RebuildState::Running => "running",
            RebuildState::Paused => "paused",
            RebuildState::Completed => "completed",
            RebuildState::Failed => "failed",
            RebuildState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RebuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress counters of a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildStats {
    /// Segments scheduled by the bulk pass
    pub segments_total: u64,
    /// Segments written to the destination by the bulk pass
    pub segments_transferred: u64,
    /// Segments skipped because the source reported them unwritten
    pub segments_skipped: u64,
    /// Segments copied again from the write log
    pub segments_replayed: u64,
    pub bytes_transferred: u64,
    /// Bulk pass completion, 0 - 100
    pub progress: u8,
}

/// Why a job failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RebuildError {
    #[error("source {uri} failed: {source}")]
    Source { uri: String, source: DeviceError },

    #[error("destination {uri} failed: {source}")]
    Destination { uri: String, source: DeviceError },

    #[error("verification of {uri} failed at offset {offset}")]
    VerifyMismatch { uri: String, offset: u64 },
}

impl RebuildError {
    pub fn is_destination(&self) -> bool {
        matches!(
            self,
            RebuildError::Destination { .. } | RebuildError::VerifyMismatch { .. }
        )
    }
}
