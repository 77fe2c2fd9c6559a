//! Device error types

use thiserror::Error;

/// Error reported by a device handle
///
/// Cloneable so one failure can be fanned into child state, the nexus
/// last-error and the caller's result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// No device behind the URI
    #[error("device not found: {0}")]
    NotFound(String),

    /// URI could not be parsed or names an unknown scheme
    #[error("invalid device URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    /// Device exists but could not be opened
    #[error("failed to open {device}: {reason}")]
    OpenFailed { device: String, reason: String },

    /// Media or transport error
    #[error("I/O error on {device}: {reason}")]
    Io { device: String, reason: String },

    /// Command did not complete in time
    #[error("I/O timed out on {0}")]
    TimedOut(String),

    /// Thin pool backing the device is exhausted
    #[error("no space left on {0}")]
    NoSpace(String),

    /// Management command rejected by the device
    #[error("admin command failed on {device}: {reason}")]
    AdminCommandFailed { device: String, reason: String },

    /// Access denied by a reservation held by another registrant
    #[error("reservation conflict on {device} (holder {holder:?})")]
    ReservationConflict { device: String, holder: Option<u64> },

    /// Request past the end of the device
    #[error("offset {offset} + length {length} exceeds device size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    /// Request not aligned to the device block size
    #[error("I/O at offset {offset} length {length} is not aligned to {alignment} bytes")]
    Misaligned {
        offset: u64,
        length: u64,
        alignment: u32,
    },

    /// Write issued through a read-only handle
    #[error("device {0} is opened read-only")]
    ReadOnly(String),

    /// Capability missing on this backend
    #[error("{op} not supported by {device}")]
    Unsupported { device: String, op: &'static str },

    /// Device was hot-removed or its handle closed
    #[error("device {0} is closed")]
    Closed(String),

    #[error("snapshot {name} already exists on {device}")]
    SnapshotExists { device: String, name: String },

    #[error("snapshot {name} not found on {device}")]
    SnapshotNotFound { device: String, name: String },
}

impl DeviceError {
    /// Errors caused by the request itself rather than the device's health.
    ///
    /// These are returned to the caller as-is and never fault a child.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            DeviceError::OutOfBounds { .. }
                | DeviceError::Misaligned { .. }
                | DeviceError::Unsupported { .. }
                | DeviceError::SnapshotExists { .. }
                | DeviceError::SnapshotNotFound { .. }
        )
    }

    /// Helper for media errors
    pub fn io(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Io {
            device: device.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;
