//! Memory-backed thin device
//!
//! Blocks are allocated on first write and tracked individually, so the
//! device can report unwritten ranges. It also emulates persistent
//! reservations shared by every handle opened on it, keeps in-device
//! snapshots and supports fault injection for tests.

use crate::device::{
    BlockDevice, DeviceCapabilities, DeviceEvent, DeviceGeometry, DeviceHandle, ReadMode,
    ReadOutcome, ReservationReport,
};
use crate::error::{DeviceError, DeviceResult};
use crate::stats::{IoStats, IoStatsSnapshot, IoType};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use nexio_common::{ReservationPolicy, SnapshotInfo, SnapshotParams};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// A fault armed on a memory device
#[derive(Debug, Clone)]
pub struct InjectedFault {
    /// Command the fault applies to
    pub io_type: IoType,
    /// Error returned instead of performing the command
    pub error: DeviceError,
    /// Remaining hits; `None` fails forever
    pub remaining: Option<u32>,
    /// Only requests overlapping this byte range fail
    pub range: Option<Range<u64>>,
}

impl InjectedFault {
    /// Fail every command of `io_type` with a media error
    pub fn persistent(io_type: IoType, device: &str) -> Self {
        Self {
            io_type,
            error: DeviceError::io(device, "injected fault"),
            remaining: None,
            range: None,
        }
    }

    /// Fail the next `count` commands of `io_type`
    pub fn times(io_type: IoType, error: DeviceError, count: u32) -> Self {
        Self {
            io_type,
            error,
            remaining: Some(count),
            range: None,
        }
    }

    /// Restrict the fault to a byte range
    pub fn in_range(mut self, range: Range<u64>) -> Self {
        self.range = Some(range);
        self
    }

    fn matches(&self, io_type: IoType, offset: u64, length: u64) -> bool {
        if self.io_type != io_type || self.remaining == Some(0) {
            return false;
        }
        match self.range {
            Some(ref range) => offset < range.end && offset + length.max(1) > range.start,
            None => true,
        }
    }
}

#[derive(Debug, Default)]
struct ReservationState {
    generation: u32,
    holder: Option<u64>,
    policy: Option<ReservationPolicy>,
    registrants: BTreeSet<u64>,
}

#[derive(Debug, Clone)]
struct MemorySnapshot {
    info: SnapshotInfo,
    blocks: BTreeMap<u64, Bytes>,
}

struct MemoryInner {
    name: String,
    geometry: RwLock<DeviceGeometry>,
    capabilities: RwLock<DeviceCapabilities>,
    /// Allocated blocks by block index
    blocks: RwLock<BTreeMap<u64, Bytes>>,
    reservation: Mutex<ReservationState>,
    snapshots: Mutex<HashMap<String, MemorySnapshot>>,
    faults: Mutex<Vec<InjectedFault>>,
    io_delay: Mutex<Option<Duration>>,
    fail_open: AtomicBool,
    removed: AtomicBool,
    events: broadcast::Sender<DeviceEvent>,
    stats: IoStats,
}

/// Thin-provisioned RAM device
///
/// Cloning yields another reference to the same backing store.
#[derive(Clone)]
pub struct MemoryDevice {
    inner: Arc<MemoryInner>,
}

impl MemoryDevice {
    /// Create a device of `size_bytes` with the given block size
    pub fn new(name: impl Into<String>, size_bytes: u64, block_size: u32) -> Self {
        let name = name.into();
        let (events, _) = broadcast::channel(16);
        let geometry = DeviceGeometry::new(block_size, size_bytes / u64::from(block_size));
        debug!(
            "Created memory device {}: {} blocks of {} bytes",
            name, geometry.num_blocks, block_size
        );
        Self {
            inner: Arc::new(MemoryInner {
                name,
                geometry: RwLock::new(geometry),
                capabilities: RwLock::new(DeviceCapabilities {
                    unmap: true,
                    write_zeroes: true,
                    reservations: true,
                    reports_unwritten: true,
                    snapshots: true,
                }),
                blocks: RwLock::new(BTreeMap::new()),
                reservation: Mutex::new(ReservationState::default()),
                snapshots: Mutex::new(HashMap::new()),
                faults: Mutex::new(Vec::new()),
                io_delay: Mutex::new(None),
                fail_open: AtomicBool::new(false),
                removed: AtomicBool::new(false),
                events,
                stats: IoStats::new(),
            }),
        }
    }

    /// Toggle whether unwritten ranges are reported as a distinct status
    pub fn set_reports_unwritten(&self, enabled: bool) {
        self.inner.capabilities.write().reports_unwritten = enabled;
    }

    /// Toggle reservation support
    pub fn set_reservations_supported(&self, enabled: bool) {
        self.inner.capabilities.write().reservations = enabled;
    }

    /// Arm a fault
    pub fn inject_fault(&self, fault: InjectedFault) {
        self.inner.faults.lock().push(fault);
    }

    /// Disarm all faults
    pub fn clear_faults(&self) {
        self.inner.faults.lock().clear();
    }

    /// Delay every command by `delay`
    pub fn set_io_delay(&self, delay: Option<Duration>) {
        *self.inner.io_delay.lock() = delay;
    }

    /// Make subsequent opens fail
    pub fn set_fail_open(&self, fail: bool) {
        self.inner.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Simulate hot removal: every command fails and a `Removed` event fires
    pub fn remove(&self) {
        self.inner.removed.store(true, Ordering::SeqCst);
        info!("Memory device {} removed", self.inner.name);
        let _ = self.inner.events.send(DeviceEvent::Removed {
            device: self.inner.name.clone(),
        });
    }

    /// Change the capacity and notify listeners
    pub fn resize(&self, num_blocks: u64) {
        self.inner.geometry.write().num_blocks = num_blocks;
        self.inner.blocks.write().retain(|&idx, _| idx < num_blocks);
        let _ = self.inner.events.send(DeviceEvent::Resized {
            device: self.inner.name.clone(),
            num_blocks,
        });
    }

    /// Number of allocated blocks
    pub fn allocated_blocks(&self) -> u64 {
        self.inner.blocks.read().len() as u64
    }

    /// Whether the block at `index` holds data
    pub fn is_allocated(&self, index: u64) -> bool {
        self.inner.blocks.read().contains_key(&index)
    }

    /// Read directly from the backing store, bypassing handles and faults
    pub fn peek(&self, offset: u64, length: u64) -> Bytes {
        self.inner.read_range(offset, length)
    }

    /// Names of snapshots taken on this device
    pub fn snapshot_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.snapshots.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Read from a snapshot image
    pub fn read_snapshot(&self, name: &str, offset: u64, length: u64) -> Option<Bytes> {
        let snapshots = self.inner.snapshots.lock();
        let snapshot = snapshots.get(name)?;
        Some(self.inner.read_from(&snapshot.blocks, offset, length))
    }

    /// Device-wide counters across every handle
    pub fn io_stats(&self) -> IoStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn reservation_holder(&self) -> Option<u64> {
        self.inner.reservation.lock().holder
    }
}

impl MemoryInner {
    fn block_size(&self) -> u64 {
        u64::from(self.geometry.read().block_size)
    }

    fn read_range(&self, offset: u64, length: u64) -> Bytes {
        let blocks = self.blocks.read();
        self.read_from(&blocks, offset, length)
    }

    fn read_from(&self, blocks: &BTreeMap<u64, Bytes>, offset: u64, length: u64) -> Bytes {
        let block_size = self.block_size();
        let first = offset / block_size;
        let count = length.div_ceil(block_size);
        let mut buf = BytesMut::zeroed(length as usize);
        for (&idx, data) in blocks.range(first..first + count) {
            let start = ((idx - first) * block_size) as usize;
            let end = (start + block_size as usize).min(buf.len());
            buf[start..end].copy_from_slice(&data[..end - start]);
        }
        buf.freeze()
    }

    fn any_allocated(&self, offset: u64, length: u64) -> bool {
        let block_size = self.block_size();
        let first = offset / block_size;
        let count = length.div_ceil(block_size);
        self.blocks.read().range(first..first + count).next().is_some()
    }

    fn deallocate(&self, offset: u64, length: u64) {
        let block_size = self.block_size();
        let first = offset / block_size;
        let count = length / block_size;
        let mut blocks = self.blocks.write();
        for idx in first..first + count {
            blocks.remove(&idx);
        }
    }

    fn take_fault(&self, io_type: IoType, offset: u64, length: u64) -> Option<DeviceError> {
        let mut faults = self.faults.lock();
        let fault = faults
            .iter_mut()
            .find(|f| f.matches(io_type, offset, length))?;
        if let Some(ref mut remaining) = fault.remaining {
            *remaining -= 1;
        }
        Some(fault.error.clone())
    }
}

#[async_trait]
impl BlockDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn geometry(&self) -> DeviceGeometry {
        *self.inner.geometry.read()
    }

    fn capabilities(&self) -> DeviceCapabilities {
        *self.inner.capabilities.read()
    }

    async fn open(&self, read_write: bool) -> DeviceResult<Arc<dyn DeviceHandle>> {
        if self.inner.removed.load(Ordering::SeqCst) {
            return Err(DeviceError::NotFound(self.inner.name.clone()));
        }
        if self.inner.fail_open.load(Ordering::SeqCst) {
            return Err(DeviceError::OpenFailed {
                device: self.inner.name.clone(),
                reason: "injected open failure".to_string(),
            });
        }
        Ok(Arc::new(MemoryHandle {
            inner: Arc::clone(&self.inner),
            read_write,
            key: Mutex::new(None),
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }
}

/// Handle opened on a [`MemoryDevice`]
pub struct MemoryHandle {
    inner: Arc<MemoryInner>,
    read_write: bool,
    /// Reservation key registered through this handle
    key: Mutex<Option<u64>>,
}

impl MemoryHandle {
    fn name(&self) -> &str {
        &self.inner.name
    }

    /// Common admission for every command: removal, alignment, bounds,
    /// injected faults, delay and reservation checks
    async fn admit(&self, io_type: IoType, offset: u64, length: u64) -> DeviceResult<()> {
        if self.inner.removed.load(Ordering::SeqCst) {
            return Err(DeviceError::Closed(self.name().to_string()));
        }
        if io_type.is_write() && !self.read_write {
            return Err(DeviceError::ReadOnly(self.name().to_string()));
        }
        if io_type != IoType::Flush {
            self.inner.geometry.read().check_io(offset, length)?;
        }
        let delay = *self.inner.io_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.inner.take_fault(io_type, offset, length) {
            self.inner.stats.record_error();
            return Err(error);
        }
        self.check_reservation(io_type.is_write())
    }

    fn check_reservation(&self, write: bool) -> DeviceResult<()> {
        let reservation = self.inner.reservation.lock();
        let Some(holder) = reservation.holder else {
            return Ok(());
        };
        let registered = self
            .key
            .lock()
            .is_some_and(|key| reservation.registrants.contains(&key));
        if registered {
            return Ok(());
        }
        let foreign_reads = reservation
            .policy
            .is_some_and(|policy| policy.allows_foreign_reads());
        if write || !foreign_reads {
            return Err(DeviceError::ReservationConflict {
                device: self.name().to_string(),
                holder: Some(holder),
            });
        }
        Ok(())
    }

    fn registered(&self, reservation: &ReservationState, key: u64) -> DeviceResult<()> {
        if reservation.registrants.contains(&key) {
            Ok(())
        } else {
            Err(DeviceError::ReservationConflict {
                device: self.name().to_string(),
                holder: reservation.holder,
            })
        }
    }
}

#[async_trait]
impl DeviceHandle for MemoryHandle {
    fn device_name(&self) -> &str {
        self.name()
    }

    fn geometry(&self) -> DeviceGeometry {
        *self.inner.geometry.read()
    }

    fn capabilities(&self) -> DeviceCapabilities {
        *self.inner.capabilities.read()
    }

    async fn read(&self, offset: u64, length: u64, mode: ReadMode) -> DeviceResult<ReadOutcome> {
        let started = Instant::now();
        self.admit(IoType::Read, offset, length).await?;

        let reports_unwritten = self.inner.capabilities.read().reports_unwritten;
        let outcome = if mode == ReadMode::UnwrittenAsStatus
            && reports_unwritten
            && !self.inner.any_allocated(offset, length)
        {
            ReadOutcome::Unwritten
        } else {
            ReadOutcome::Data(self.inner.read_range(offset, length))
        };
        self.inner.stats.record(IoType::Read, length, started);
        Ok(outcome)
    }

    async fn write(&self, offset: u64, data: Bytes) -> DeviceResult<()> {
        let started = Instant::now();
        let length = data.len() as u64;
        self.admit(IoType::Write, offset, length).await?;

        let block_size = self.inner.block_size();
        let first = offset / block_size;
        {
            let mut blocks = self.inner.blocks.write();
            for (i, chunk) in data.chunks(block_size as usize).enumerate() {
                blocks.insert(first + i as u64, Bytes::copy_from_slice(chunk));
            }
        }
        self.inner.stats.record(IoType::Write, length, started);
        Ok(())
    }

    async fn unmap(&self, offset: u64, length: u64) -> DeviceResult<()> {
        let started = Instant::now();
        self.admit(IoType::Unmap, offset, length).await?;
        self.inner.deallocate(offset, length);
        self.inner.stats.record(IoType::Unmap, length, started);
        Ok(())
    }

    async fn write_zeroes(&self, offset: u64, length: u64) -> DeviceResult<()> {
        let started = Instant::now();
        self.admit(IoType::WriteZeroes, offset, length).await?;
        // Thin device: zeroed blocks read back as zeroes once deallocated
        self.inner.deallocate(offset, length);
        self.inner.stats.record(IoType::WriteZeroes, length, started);
        Ok(())
    }

    async fn flush(&self) -> DeviceResult<()> {
        let started = Instant::now();
        self.admit(IoType::Flush, 0, 0).await?;
        self.inner.stats.record(IoType::Flush, 0, started);
        Ok(())
    }

    async fn reservation_register(&self, key: u64) -> DeviceResult<()> {
        let mut reservation = self.inner.reservation.lock();
        if reservation.registrants.insert(key) {
            reservation.generation += 1;
        }
        *self.key.lock() = Some(key);
        debug!("{}: registered reservation key {:#x}", self.name(), key);
        Ok(())
    }

    async fn reservation_acquire(&self, key: u64, policy: ReservationPolicy) -> DeviceResult<()> {
        let mut reservation = self.inner.reservation.lock();
        self.registered(&reservation, key)?;
        match reservation.holder {
            None => {
                reservation.holder = Some(key);
                reservation.policy = Some(policy);
                Ok(())
            }
            Some(holder) if holder == key && reservation.policy == Some(policy) => Ok(()),
            Some(holder) => Err(DeviceError::ReservationConflict {
                device: self.name().to_string(),
                holder: Some(holder),
            }),
        }
    }

    async fn reservation_preempt(
        &self,
        key: u64,
        victim: u64,
        policy: ReservationPolicy,
    ) -> DeviceResult<()> {
        let mut reservation = self.inner.reservation.lock();
        self.registered(&reservation, key)?;
        reservation.registrants.remove(&victim);
        if reservation.holder.is_none_or(|holder| holder == victim) {
            reservation.holder = Some(key);
            reservation.policy = Some(policy);
        }
        reservation.generation += 1;
        info!(
            "{}: key {:#x} preempted {:#x} (generation {})",
            self.name(),
            key,
            victim,
            reservation.generation
        );
        Ok(())
    }

    async fn reservation_release(&self, key: u64) -> DeviceResult<()> {
        let mut reservation = self.inner.reservation.lock();
        if reservation.holder == Some(key) {
            reservation.holder = None;
            reservation.policy = None;
        }
        if reservation.registrants.remove(&key) {
            reservation.generation += 1;
        }
        let mut own = self.key.lock();
        if *own == Some(key) {
            *own = None;
        }
        Ok(())
    }

    async fn reservation_report(&self) -> DeviceResult<ReservationReport> {
        let reservation = self.inner.reservation.lock();
        Ok(ReservationReport {
            generation: reservation.generation,
            holder: reservation.holder,
            policy: reservation.policy,
            registrants: reservation.registrants.iter().copied().collect(),
        })
    }

    async fn create_snapshot(&self, params: &SnapshotParams) -> DeviceResult<SnapshotInfo> {
        if self.inner.removed.load(Ordering::SeqCst) {
            return Err(DeviceError::Closed(self.name().to_string()));
        }
        let mut snapshots = self.inner.snapshots.lock();
        if snapshots.contains_key(&params.name) {
            return Err(DeviceError::SnapshotExists {
                device: self.name().to_string(),
                name: params.name.clone(),
            });
        }
        let blocks = self.inner.blocks.read().clone();
        let geometry = *self.inner.geometry.read();
        let info = SnapshotInfo {
            name: params.name.clone(),
            snapshot_uuid: params.snapshot_uuid.clone(),
            txn_id: params.txn_id.clone(),
            device: self.name().to_string(),
            size_bytes: geometry.size_bytes(),
            allocated_bytes: blocks.len() as u64 * u64::from(geometry.block_size),
            create_time: params.create_time,
        };
        snapshots.insert(
            params.name.clone(),
            MemorySnapshot {
                info: info.clone(),
                blocks,
            },
        );
        debug!("{}: created snapshot {}", self.name(), params.name);
        Ok(info)
    }

    async fn destroy_snapshot(&self, name: &str) -> DeviceResult<()> {
        self.inner
            .snapshots
            .lock()
            .remove(name)
            .map(|snapshot| debug!("{}: destroyed snapshot {}", self.name(), snapshot.info.name))
            .ok_or_else(|| DeviceError::SnapshotNotFound {
                device: self.name().to_string(),
                name: name.to_string(),
            })
    }

    fn stats(&self) -> IoStatsSnapshot {
        self.inner.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn device() -> MemoryDevice {
        MemoryDevice::new("mem0", 1024 * 1024, 512)
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let dev = device();
        let handle = dev.open(true).await.unwrap();
        handle
            .write(4096, Bytes::from(vec![0xAB; 8192]))
            .await
            .unwrap();

        let data = handle
            .read(4096, 8192, ReadMode::Normal)
            .await
            .unwrap()
            .into_bytes(8192);
        assert!(data.iter().all(|&b| b == 0xAB));
        assert_eq!(dev.allocated_blocks(), 16);
    }

    #[tokio::test]
    async fn test_unwritten_status() {
        let dev = device();
        let handle = dev.open(true).await.unwrap();
        handle.write(0, Bytes::from(vec![1; 512])).await.unwrap();

        let outcome = handle
            .read(65536, 4096, ReadMode::UnwrittenAsStatus)
            .await
            .unwrap();
        assert!(outcome.is_unwritten());

        // Partially allocated ranges return data
        let outcome = handle
            .read(0, 4096, ReadMode::UnwrittenAsStatus)
            .await
            .unwrap();
        assert!(!outcome.is_unwritten());

        // Normal mode never reports unwritten
        let outcome = handle.read(65536, 4096, ReadMode::Normal).await.unwrap();
        assert!(!outcome.is_unwritten());

        dev.set_reports_unwritten(false);
        let outcome = handle
            .read(65536, 4096, ReadMode::UnwrittenAsStatus)
            .await
            .unwrap();
        assert!(!outcome.is_unwritten());
    }

    #[tokio::test]
    async fn test_write_zeroes_deallocates() {
        let dev = device();
        let handle = dev.open(true).await.unwrap();
        handle.write(0, Bytes::from(vec![7; 2048])).await.unwrap();
        handle.write_zeroes(0, 1024).await.unwrap();
        assert!(!dev.is_allocated(0));
        assert!(!dev.is_allocated(1));
        assert!(dev.is_allocated(2));
        let data = dev.peek(0, 2048);
        assert!(data[..1024].iter().all(|&b| b == 0));
        assert!(data[1024..].iter().all(|&b| b == 7));
    }

    #[tokio::test]
    async fn test_injected_fault_once() {
        let dev = device();
        let handle = dev.open(true).await.unwrap();
        dev.inject_fault(InjectedFault::times(
            IoType::Write,
            DeviceError::TimedOut("mem0".into()),
            1,
        ));

        let err = handle
            .write(0, Bytes::from(vec![0; 512]))
            .await
            .unwrap_err();
        assert_eq!(err, DeviceError::TimedOut("mem0".into()));
        handle.write(0, Bytes::from(vec![0; 512])).await.unwrap();
        assert_eq!(dev.io_stats().errors, 1);
    }

    #[tokio::test]
    async fn test_fault_range() {
        let dev = device();
        let handle = dev.open(true).await.unwrap();
        dev.inject_fault(InjectedFault::persistent(IoType::Write, "mem0").in_range(8192..16384));

        handle.write(0, Bytes::from(vec![0; 4096])).await.unwrap();
        assert!(handle.write(8192, Bytes::from(vec![0; 512])).await.is_err());
        handle
            .write(16384, Bytes::from(vec![0; 512]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reservation_conflict_after_preempt() {
        let dev = device();
        let first = dev.open(true).await.unwrap();
        let second = dev.open(true).await.unwrap();

        first.reservation_register(0x1).await.unwrap();
        first
            .reservation_acquire(0x1, ReservationPolicy::WriteExclusiveAllRegistrants)
            .await
            .unwrap();
        first.write(0, Bytes::from(vec![1; 512])).await.unwrap();

        // Unregistered handle may read but not write
        second.read(0, 512, ReadMode::Normal).await.unwrap();
        assert!(matches!(
            second.write(0, Bytes::from(vec![2; 512])).await,
            Err(DeviceError::ReservationConflict {
                holder: Some(0x1),
                ..
            })
        ));

        second.reservation_register(0x2).await.unwrap();
        assert!(
            second
                .reservation_acquire(0x2, ReservationPolicy::WriteExclusiveAllRegistrants)
                .await
                .is_err()
        );
        second
            .reservation_preempt(0x2, 0x1, ReservationPolicy::WriteExclusiveAllRegistrants)
            .await
            .unwrap();

        assert_eq!(dev.reservation_holder(), Some(0x2));
        assert!(matches!(
            first.write(0, Bytes::from(vec![3; 512])).await,
            Err(DeviceError::ReservationConflict { .. })
        ));
        second.write(0, Bytes::from(vec![4; 512])).await.unwrap();

        let report = second.reservation_report().await.unwrap();
        assert_eq!(report.registrants, vec![0x2]);
        assert_eq!(report.generation, 3);
    }

    #[tokio::test]
    async fn test_exclusive_blocks_foreign_reads() {
        let dev = device();
        let owner = dev.open(true).await.unwrap();
        let other = dev.open(false).await.unwrap();
        owner.reservation_register(9).await.unwrap();
        owner
            .reservation_acquire(9, ReservationPolicy::ExclusiveAllRegistrants)
            .await
            .unwrap();
        assert!(other.read(0, 512, ReadMode::Normal).await.is_err());

        owner.reservation_release(9).await.unwrap();
        other.read(0, 512, ReadMode::Normal).await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_is_point_in_time() {
        let dev = device();
        let handle = dev.open(true).await.unwrap();
        handle.write(0, Bytes::from(vec![1; 512])).await.unwrap();

        let params = SnapshotParams {
            name: "snap1".into(),
            entity_id: "vol".into(),
            txn_id: "t1".into(),
            snapshot_uuid: "u1".into(),
            create_time: Utc::now(),
        };
        let info = handle.create_snapshot(&params).await.unwrap();
        assert_eq!(info.allocated_bytes, 512);
        assert!(matches!(
            handle.create_snapshot(&params).await,
            Err(DeviceError::SnapshotExists { .. })
        ));

        handle.write(0, Bytes::from(vec![2; 512])).await.unwrap();
        let snap = dev.read_snapshot("snap1", 0, 512).unwrap();
        assert!(snap.iter().all(|&b| b == 1));

        handle.destroy_snapshot("snap1").await.unwrap();
        assert!(dev.snapshot_names().is_empty());
    }

    #[tokio::test]
    async fn test_remove_event() {
        let dev = device();
        let handle = dev.open(true).await.unwrap();
        let mut events = dev.subscribe();
        dev.remove();

        assert_eq!(
            events.recv().await.unwrap(),
            DeviceEvent::Removed {
                device: "mem0".into()
            }
        );
        assert!(matches!(
            handle.read(0, 512, ReadMode::Normal).await,
            Err(DeviceError::Closed(_))
        ));
        assert!(dev.open(true).await.is_err());
    }

    #[tokio::test]
    async fn test_read_only_handle() {
        let dev = device();
        let handle = dev.open(false).await.unwrap();
        assert!(matches!(
            handle.write(0, Bytes::from(vec![0; 512])).await,
            Err(DeviceError::ReadOnly(_))
        ));
    }
}
