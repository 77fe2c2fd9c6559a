//! Device handle abstraction
//!
//! The replication engine never performs physical I/O itself. It opens a
//! [`BlockDevice`] into a [`DeviceHandle`] and issues every command through
//! that handle, so the engine code never branches on the backend type.

use crate::error::{DeviceError, DeviceResult};
use crate::stats::IoStatsSnapshot;

use async_trait::async_trait;
use bytes::Bytes;
use nexio_common::{ReservationPolicy, SnapshotInfo, SnapshotParams};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Block geometry of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceGeometry {
    /// Logical block size in bytes
    pub block_size: u32,
    /// Number of logical blocks
    pub num_blocks: u64,
    /// Required buffer/offset alignment in bytes
    pub alignment: u32,
}

impl DeviceGeometry {
    pub fn new(block_size: u32, num_blocks: u64) -> Self {
        Self {
            block_size,
            num_blocks,
            alignment: block_size,
        }
    }

    /// Capacity in bytes
    pub fn size_bytes(&self) -> u64 {
        self.num_blocks * u64::from(self.block_size)
    }

    /// Validate that a request is block aligned and within bounds
    pub fn check_io(&self, offset: u64, length: u64) -> DeviceResult<()> {
        let block_size = u64::from(self.block_size);
        if offset % block_size != 0 || length % block_size != 0 {
            return Err(DeviceError::Misaligned {
                offset,
                length,
                alignment: self.block_size,
            });
        }
        let size = self.size_bytes();
        if offset.checked_add(length).is_none_or(|end| end > size) {
            return Err(DeviceError::OutOfBounds {
                offset,
                length,
                size,
            });
        }
        Ok(())
    }
}

/// Optional features a backend may provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DeviceCapabilities {
    /// Supports deallocation
    pub unmap: bool,
    /// Supports zeroing without a data transfer
    pub write_zeroes: bool,
    /// Supports persistent reservations
    pub reservations: bool,
    /// Can report unallocated ranges as a distinct read status
    pub reports_unwritten: bool,
    /// Supports point-in-time snapshots
    pub snapshots: bool,
}

/// How a read treats unallocated blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Unallocated blocks read as zeroes
    #[default]
    Normal,
    /// A fully unallocated range reports [`ReadOutcome::Unwritten`] instead
    /// of zeroes. Devices that cannot tell return data as in `Normal`.
    UnwrittenAsStatus,
}

/// Completion of a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Data for the whole range
    Data(Bytes),
    /// Nothing in the range was ever written
    Unwritten,
}

impl ReadOutcome {
    pub fn is_unwritten(&self) -> bool {
        matches!(self, ReadOutcome::Unwritten)
    }

    /// Data for the range, zero-filled when unwritten
    pub fn into_bytes(self, length: u64) -> Bytes {
        match self {
            ReadOutcome::Data(data) => data,
            ReadOutcome::Unwritten => Bytes::from(vec![0u8; length as usize]),
        }
    }
}

/// Reservation state as reported by the device
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ReservationReport {
    /// Incremented on every registration change and preemption
    pub generation: u32,
    /// Key of the current holder
    pub holder: Option<u64>,
    /// Policy of the current reservation
    pub policy: Option<ReservationPolicy>,
    /// All registered keys
    pub registrants: Vec<u64>,
}

/// Asynchronous notification from a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Device was hot-removed
    Removed { device: String },
    /// Device capacity changed
    Resized { device: String, num_blocks: u64 },
}

/// A backend that can be opened into handles
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Device name (unique per factory)
    fn name(&self) -> &str;

    fn geometry(&self) -> DeviceGeometry;

    fn capabilities(&self) -> DeviceCapabilities;

    /// Open a handle; `read_write = false` rejects mutating commands
    async fn open(&self, read_write: bool) -> DeviceResult<Arc<dyn DeviceHandle>>;

    /// Register for remove/resize notifications
    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent>;
}

/// An open descriptor against one backend.
///
/// All commands complete asynchronously. The handle stays usable until the
/// last reference is dropped, so in-flight commands never race a close.
#[async_trait]
pub trait DeviceHandle: Send + Sync {
    fn device_name(&self) -> &str;

    fn geometry(&self) -> DeviceGeometry;

    fn capabilities(&self) -> DeviceCapabilities;

    async fn read(&self, offset: u64, length: u64, mode: ReadMode) -> DeviceResult<ReadOutcome>;

    async fn write(&self, offset: u64, data: Bytes) -> DeviceResult<()>;

    async fn unmap(&self, offset: u64, length: u64) -> DeviceResult<()>;

    async fn write_zeroes(&self, offset: u64, length: u64) -> DeviceResult<()>;

    async fn flush(&self) -> DeviceResult<()>;

    /// Register a holder key on the device
    async fn reservation_register(&self, _key: u64) -> DeviceResult<()> {
        Err(self.unsupported("reservation register"))
    }

    /// Acquire the reservation under `policy` (key must be registered)
    async fn reservation_acquire(&self, _key: u64, _policy: ReservationPolicy) -> DeviceResult<()> {
        Err(self.unsupported("reservation acquire"))
    }

    /// Remove `victim` and take over its reservation
    async fn reservation_preempt(
        &self,
        _key: u64,
        _victim: u64,
        _policy: ReservationPolicy,
    ) -> DeviceResult<()> {
        Err(self.unsupported("reservation preempt"))
    }

    /// Release the reservation (if held) and unregister the key
    async fn reservation_release(&self, _key: u64) -> DeviceResult<()> {
        Err(self.unsupported("reservation release"))
    }

    async fn reservation_report(&self) -> DeviceResult<ReservationReport> {
        Err(self.unsupported("reservation report"))
    }

    async fn create_snapshot(&self, _params: &SnapshotParams) -> DeviceResult<SnapshotInfo> {
        Err(self.unsupported("snapshot create"))
    }

    async fn destroy_snapshot(&self, _name: &str) -> DeviceResult<()> {
        Err(self.unsupported("snapshot destroy"))
    }

    fn stats(&self) -> IoStatsSnapshot;

    #[doc(hidden)]
    fn unsupported(&self, op: &'static str) -> DeviceError {
        DeviceError::Unsupported {
            device: self.device_name().to_string(),
            op,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_io_alignment() {
        let geometry = DeviceGeometry::new(512, 8);
        assert!(geometry.check_io(0, 4096).is_ok());
        assert!(matches!(
            geometry.check_io(100, 512),
            Err(DeviceError::Misaligned { .. })
        ));
        assert!(matches!(
            geometry.check_io(4096, 512),
            Err(DeviceError::OutOfBounds { .. })
        ));
        assert!(matches!(
            geometry.check_io(u64::MAX - 511, 512),
            Err(DeviceError::Misaligned { .. }) | Err(DeviceError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_unwritten_into_bytes() {
        let bytes = ReadOutcome::Unwritten.into_bytes(1024);
        assert_eq!(bytes.len(), 1024);
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
