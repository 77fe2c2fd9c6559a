//! Nexus child and its health state machine
//!
//! A child wraps one device plus three independent state axes:
//! operational health, data sync and removal. The axes are published
//! together as one versioned [`ChildStateSnapshot`] swapped atomically, so
//! I/O channels never observe a half-applied transition.

use crate::error::{NexusError, NexusResult};
use crate::rebuild::RebuildJob;
use crate::reservation::{self, ReservationToken};
use crate::segment_map::SegmentMap;

use chrono::{DateTime, Utc};
use nexio_common::ReservationConfig;
use nexio_device::{BlockDevice, DeviceError, DeviceHandle, IoStatsSnapshot};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Why a child was faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultReason {
    /// Thin pool backing the child ran out of space
    NoSpace,
    TimedOut,
    IoError,
    /// Taken out of service by the operator
    Offline,
    AdminCommandFailed,
    /// The child failed to rebuild
    RebuildFailed,
    CantOpen,
    /// Taken out of service by the operator for good
    OfflinePermanent,
    /// Another holder owns the reservation
    ReservationConflict,
}

impl FaultReason {
    /// Whether the reconnect loop may bring the child back
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FaultReason::NoSpace
                | FaultReason::TimedOut
                | FaultReason::IoError
                | FaultReason::Offline
                | FaultReason::AdminCommandFailed
                | FaultReason::RebuildFailed
        )
    }

    /// Classify a device error. Request errors never fault a child.
    pub fn from_device_error(error: &DeviceError) -> Option<Self> {
        if error.is_request_error() {
            return None;
        }
        Some(match error {
            DeviceError::NoSpace(_) => FaultReason::NoSpace,
            DeviceError::TimedOut(_) => FaultReason::TimedOut,
            DeviceError::AdminCommandFailed { .. } => FaultReason::AdminCommandFailed,
            DeviceError::ReservationConflict { .. } => FaultReason::ReservationConflict,
            DeviceError::NotFound(_)
            | DeviceError::InvalidUri { .. }
            | DeviceError::OpenFailed { .. }
            | DeviceError::Closed(_) => FaultReason::CantOpen,
            _ => FaultReason::IoError,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultReason::NoSpace => "no space",
            FaultReason::TimedOut => "timed out",
            FaultReason::IoError => "io error",
            FaultReason::Offline => "offline",
            FaultReason::AdminCommandFailed => "admin command failed",
            FaultReason::RebuildFailed => "rebuild failed",
            FaultReason::CantOpen => "cannot open",
            FaultReason::OfflinePermanent => "offline permanent",
            FaultReason::ReservationConflict => "reservation conflict",
        }
    }
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationalState {
    /// Not opened yet
    Init,
    /// Incompatible with the nexus; needs operator removal
    ConfigInvalid,
    Open,
    Closed,
    Faulted(FaultReason),
}

impl fmt::Display for OperationalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationalState::Init => write!(f, "init"),
            OperationalState::ConfigInvalid => write!(f, "config invalid"),
            OperationalState::Open => write!(f, "open"),
            OperationalState::Closed => write!(f, "closed"),
            OperationalState::Faulted(reason) => write!(f, "faulted ({reason})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    /// Data is incomplete: awaiting or under rebuild
    OutOfSync,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Synced => write!(f, "synced"),
            SyncState::OutOfSync => write!(f, "out-of-sync"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyState {
    None,
    Destroying,
}

/// Consistent view of a child's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildStateSnapshot {
    /// Bumped on every transition
    pub version: u64,
    pub operational: OperationalState,
    pub sync: SyncState,
    pub destroy: DestroyState,
    /// A rebuild job targeting this child is active
    pub rebuilding: bool,
    /// Set on entry into `Faulted`
    pub faulted_at: Option<DateTime<Utc>>,
}

impl ChildStateSnapshot {
    fn initial() -> Self {
        Self {
            version: 0,
            operational: OperationalState::Init,
            sync: SyncState::OutOfSync,
            destroy: DestroyState::None,
            rebuilding: false,
            faulted_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.operational == OperationalState::Open && self.destroy == DestroyState::None
    }

    /// Open and synced: may serve reads
    pub fn is_read_eligible(&self) -> bool {
        self.is_open() && self.sync == SyncState::Synced
    }

    /// Open and either synced or being rebuilt: receives writes
    pub fn is_write_eligible(&self) -> bool {
        self.is_open() && (self.sync == SyncState::Synced || self.rebuilding)
    }

    pub fn fault_reason(&self) -> Option<FaultReason> {
        match self.operational {
            OperationalState::Faulted(reason) => Some(reason),
            _ => None,
        }
    }

    /// Client-facing projection
    pub fn status(&self) -> ChildStatus {
        match (self.operational, self.destroy) {
            (OperationalState::Faulted(_), DestroyState::Destroying) => ChildStatus::Faulting,
            (_, DestroyState::Destroying) => ChildStatus::Destroying,
            (OperationalState::Init, _) => ChildStatus::Init,
            (OperationalState::ConfigInvalid, _) => ChildStatus::ConfigInvalid,
            (OperationalState::Closed, _) => ChildStatus::Closed,
            (OperationalState::Faulted(_), _) => ChildStatus::Faulted,
            (OperationalState::Open, _) if self.sync == SyncState::OutOfSync => {
                ChildStatus::OutOfSync
            }
            (OperationalState::Open, _) => ChildStatus::Online,
        }
    }
}

/// Simplified child status shown to clients.
///
/// `Online` implies read eligibility; an open child that is still being
/// rebuilt shows as `OutOfSync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildStatus {
    Init,
    ConfigInvalid,
    Online,
    OutOfSync,
    Closed,
    /// Faulted while being removed
    Faulting,
    Faulted,
    Destroying,
}

/// What the nexus requires of a child device
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildRequirements {
    pub block_size: u32,
    pub size_bytes: u64,
    pub reservations: bool,
}

/// Diagnostic view of one child
#[derive(Debug, Clone, Serialize)]
pub struct ChildInfo {
    pub uri: String,
    pub status: ChildStatus,
    pub state: ChildStateSnapshot,
    pub fault_reason: Option<String>,
    pub rebuild_progress: Option<u8>,
    pub reservation: Option<ReservationToken>,
    /// Last rebuild failed and awaits an explicit restart
    pub rebuild_failed: bool,
    /// Commands currently outstanding on the child
    pub in_flight: usize,
    pub stats: Option<IoStatsSnapshot>,
}

pub struct NexusChild {
    /// Backend address the child was created from
    uri: String,
    /// Name of the owning nexus
    parent: String,
    device: Arc<dyn BlockDevice>,
    handle: RwLock<Option<Arc<dyn DeviceHandle>>>,
    state: RwLock<Arc<ChildStateSnapshot>>,
    /// Rebuild job targeting this child; owned by the nexus
    rebuild_job: Mutex<Weak<RebuildJob>>,
    /// Writes missed while faulted, for a partial rebuild
    fault_log: Mutex<Option<Arc<SegmentMap>>>,
    /// Last rebuild failed; only an explicit rebuild clears it
    rebuild_failed: AtomicBool,
    reservation: Mutex<Option<ReservationToken>>,
    in_flight: watch::Sender<usize>,
}

impl fmt::Debug for NexusChild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        write!(
            f,
            "Child '{} @ {}' [{} {}]",
            self.uri, self.parent, state.operational, state.sync
        )
    }
}

impl NexusChild {
    pub(crate) fn new(uri: String, parent: String, device: Arc<dyn BlockDevice>) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            uri,
            parent,
            device,
            handle: RwLock::new(None),
            state: RwLock::new(Arc::new(ChildStateSnapshot::initial())),
            rebuild_job: Mutex::new(Weak::new()),
            fault_log: Mutex::new(None),
            rebuild_failed: AtomicBool::new(false),
            reservation: Mutex::new(None),
            in_flight,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn nexus_name(&self) -> &str {
        &self.parent
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Current state snapshot
    pub fn state(&self) -> Arc<ChildStateSnapshot> {
        Arc::clone(&self.state.read())
    }

    pub fn handle(&self) -> Option<Arc<dyn DeviceHandle>> {
        self.handle.read().clone()
    }

    pub fn reservation(&self) -> Option<ReservationToken> {
        *self.reservation.lock()
    }

    pub fn rebuild_job(&self) -> Option<Arc<RebuildJob>> {
        self.rebuild_job.lock().upgrade()
    }

    pub(crate) fn set_rebuild_job(&self, job: &Arc<RebuildJob>) {
        *self.rebuild_job.lock() = Arc::downgrade(job);
    }

    pub(crate) fn fault_log(&self) -> Option<Arc<SegmentMap>> {
        self.fault_log.lock().clone()
    }

    pub(crate) fn take_fault_log(&self) -> Option<Arc<SegmentMap>> {
        self.fault_log.lock().take()
    }

    /// Whether the last rebuild of this child failed. Such a child is not
    /// rebuilt automatically.
    pub fn rebuild_failed(&self) -> bool {
        self.rebuild_failed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_rebuild_failed(&self) {
        if !self.rebuild_failed.swap(true, Ordering::AcqRel) {
            info!("{:?}: rebuild failed, automatic rebuilds suspended", self);
        }
    }

    pub(crate) fn clear_rebuild_failed(&self) {
        self.rebuild_failed.store(false, Ordering::Release);
    }

    /// Apply `f` to the current snapshot and publish the result.
    ///
    /// Returns false when `f` declines the transition.
    fn transition(
        &self,
        f: impl FnOnce(&ChildStateSnapshot) -> Option<ChildStateSnapshot>,
    ) -> bool {
        let mut state = self.state.write();
        let Some(mut next) = f(&**state) else {
            return false;
        };
        next.version = state.version + 1;
        debug!(
            "{}: {} {} -> {} {}",
            self.uri, state.operational, state.sync, next.operational, next.sync
        );
        *state = Arc::new(next);
        true
    }

    /// Open the device, check it against the nexus and take the reservation.
    ///
    /// On failure the child is left `ConfigInvalid` (incompatible device)
    /// or `Faulted` (device or reservation error).
    pub(crate) async fn open(
        &self,
        requirements: ChildRequirements,
        reservation: Option<&ReservationConfig>,
        sync: SyncState,
    ) -> NexusResult<()> {
        info!("{:?}: opening child device", self);
        let current = self.state();
        match current.operational {
            OperationalState::Open => {
                warn!("{:?}: already open", self);
                return Ok(());
            }
            OperationalState::ConfigInvalid => {
                return Err(NexusError::ChildInvalidState {
                    child: self.uri.clone(),
                    state: current.operational,
                });
            }
            _ => {}
        }
        if current.destroy == DestroyState::Destroying {
            return Err(NexusError::ChildInvalidState {
                child: self.uri.clone(),
                state: current.operational,
            });
        }

        if let Err(reason) = self.check_compatible(requirements) {
            warn!("{:?}: incompatible: {}", self, reason);
            self.transition(|s| {
                Some(ChildStateSnapshot {
                    operational: OperationalState::ConfigInvalid,
                    ..s.clone()
                })
            });
            return Err(NexusError::ChildIncompatible {
                child: self.uri.clone(),
                reason,
            });
        }

        let handle = match self.device.open(true).await {
            Ok(handle) => handle,
            Err(error) => {
                self.fault(FaultReason::CantOpen);
                return Err(error.into());
            }
        };

        if let Some(config) = reservation {
            match reservation::acquire(handle.as_ref(), config).await {
                Ok(token) => *self.reservation.lock() = Some(token),
                Err(error) => {
                    let reason =
                        FaultReason::from_device_error(&error).unwrap_or(FaultReason::CantOpen);
                    self.fault(reason);
                    return Err(error.into());
                }
            }
        }

        *self.handle.write() = Some(handle);
        self.transition(|s| {
            Some(ChildStateSnapshot {
                operational: OperationalState::Open,
                sync,
                rebuilding: false,
                ..s.clone()
            })
        });
        info!("{:?}: opened", self);
        Ok(())
    }

    fn check_compatible(&self, requirements: ChildRequirements) -> Result<(), String> {
        let geometry = self.device.geometry();
        if geometry.block_size != requirements.block_size {
            return Err(format!(
                "block size {} differs from nexus block size {}",
                geometry.block_size, requirements.block_size
            ));
        }
        if geometry.size_bytes() < requirements.size_bytes {
            return Err(format!(
                "device size {} is smaller than nexus size {}",
                geometry.size_bytes(),
                requirements.size_bytes
            ));
        }
        if requirements.reservations && !self.device.capabilities().reservations {
            return Err("device does not support reservations".to_string());
        }
        Ok(())
    }

    /// Move to `Faulted(reason)`. Re-faulting with the same reason is a
    /// no-op; returns whether the state changed.
    pub(crate) fn fault(&self, reason: FaultReason) -> bool {
        self.transition(|s| {
            match s.operational {
                OperationalState::Faulted(current) if current == reason => return None,
                OperationalState::ConfigInvalid | OperationalState::Closed => return None,
                _ => {}
            }
            let faulted_at = match s.operational {
                OperationalState::Faulted(_) => s.faulted_at,
                _ => Some(Utc::now()),
            };
            Some(ChildStateSnapshot {
                operational: OperationalState::Faulted(reason),
                sync: SyncState::OutOfSync,
                rebuilding: false,
                faulted_at,
                ..s.clone()
            })
        })
    }

    /// Start logging writes missed while faulted
    pub(crate) fn attach_fault_log(&self, log: Arc<SegmentMap>) {
        *self.fault_log.lock() = Some(log);
    }

    pub(crate) fn set_rebuilding(&self, rebuilding: bool) -> bool {
        self.transition(|s| {
            (s.is_open() && s.sync == SyncState::OutOfSync && s.rebuilding != rebuilding).then(
                || ChildStateSnapshot {
                    rebuilding,
                    ..s.clone()
                },
            )
        })
    }

    /// Rebuild completed: the child may serve reads
    pub(crate) fn set_synced(&self) -> bool {
        let changed = self.transition(|s| {
            s.is_open().then(|| ChildStateSnapshot {
                sync: SyncState::Synced,
                rebuilding: false,
                ..s.clone()
            })
        });
        if changed {
            *self.fault_log.lock() = None;
        }
        changed
    }

    pub(crate) fn set_destroying(&self) {
        self.transition(|s| {
            (s.destroy == DestroyState::None).then(|| ChildStateSnapshot {
                destroy: DestroyState::Destroying,
                rebuilding: false,
                ..s.clone()
            })
        });
    }

    /// Replace the handle with a fresh one after a fault
    pub(crate) async fn reopen(
        &self,
        requirements: ChildRequirements,
        reservation: Option<&ReservationConfig>,
    ) -> NexusResult<()> {
        let current = self.state();
        match current.fault_reason() {
            Some(reason) if reason.is_recoverable() => {}
            _ if current.operational == OperationalState::Closed => {}
            _ => {
                return Err(NexusError::ChildInvalidState {
                    child: self.uri.clone(),
                    state: current.operational,
                });
            }
        }

        self.handle.write().take();
        // Open from a clean slate, keeping the fault timestamp for diagnostics
        let faulted_at = current.faulted_at;
        let reason = current.fault_reason();
        self.transition(|s| {
            Some(ChildStateSnapshot {
                operational: OperationalState::Init,
                ..s.clone()
            })
        });
        match self
            .open(requirements, reservation, SyncState::OutOfSync)
            .await
        {
            Ok(()) => Ok(()),
            Err(error) => {
                // Keep the original recoverable reason if the device is
                // simply still unreachable
                if let Some(reason) = reason
                    && self.state().fault_reason() == Some(FaultReason::CantOpen)
                {
                    self.transition(|s| {
                        Some(ChildStateSnapshot {
                            operational: OperationalState::Faulted(reason),
                            faulted_at,
                            ..s.clone()
                        })
                    });
                }
                Err(error)
            }
        }
    }

    /// Release the reservation taken at open
    pub(crate) async fn release_reservation(&self) {
        let Some(token) = self.reservation.lock().take() else {
            return;
        };
        let Some(handle) = self.handle() else {
            return;
        };
        if let Err(error) = reservation::release(handle.as_ref(), token.holder).await {
            warn!("{:?}: failed to release reservation: {}", self, error);
        }
    }

    pub(crate) fn set_reservation(&self, token: Option<ReservationToken>) {
        *self.reservation.lock() = token;
    }

    /// Drop the device handle. In-flight I/O keeps its own reference.
    pub(crate) fn close(&self) {
        self.handle.write().take();
        self.transition(|s| {
            (s.operational != OperationalState::Closed).then(|| ChildStateSnapshot {
                operational: OperationalState::Closed,
                rebuilding: false,
                ..s.clone()
            })
        });
        info!("{:?}: closed", self);
    }

    /// Count one in-flight command against this child
    pub(crate) fn track(&self) -> InflightGuard<'_> {
        self.in_flight.send_modify(|n| *n += 1);
        InflightGuard { child: self }
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Wait until no command is in flight on this child
    pub(crate) async fn drain(&self, timeout: Duration) -> NexusResult<()> {
        let mut rx = self.in_flight.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .map(|_| ())
            .map_err(|_| NexusError::DrainTimeout {
                child: self.uri.clone(),
            })
    }

    pub fn info(&self) -> ChildInfo {
        let state = self.state();
        ChildInfo {
            uri: self.uri.clone(),
            status: state.status(),
            fault_reason: state.fault_reason().map(|r| r.to_string()),
            rebuild_progress: self
                .rebuild_job()
                .filter(|_| state.rebuilding)
                .map(|job| job.stats().progress),
            reservation: self.reservation(),
            rebuild_failed: self.rebuild_failed(),
            in_flight: self.in_flight(),
            stats: self.handle().map(|h| h.stats()),
            state: (*state).clone(),
        }
    }
}

pub(crate) struct InflightGuard<'a> {
    child: &'a NexusChild,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.child.in_flight.send_if_modified(|n| {
            *n -= 1;
            *n == 0
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexio_device::MemoryDevice;

    fn requirements() -> ChildRequirements {
        ChildRequirements {
            block_size: 512,
            size_bytes: 1024 * 1024,
            reservations: false,
        }
    }

    fn child(name: &str) -> (NexusChild, MemoryDevice) {
        let device = MemoryDevice::new(name, 1024 * 1024, 512);
        let child = NexusChild::new(
            format!("malloc:///{name}"),
            "nexus0".into(),
            Arc::new(device.clone()),
        );
        (child, device)
    }

    #[tokio::test]
    async fn test_open_synced() {
        let (child, _) = child("c0");
        child
            .open(requirements(), None, SyncState::Synced)
            .await
            .unwrap();
        let state = child.state();
        assert!(state.is_read_eligible());
        assert!(state.is_write_eligible());
        assert_eq!(state.status(), ChildStatus::Online);
        assert!(child.handle().is_some());
    }

    #[tokio::test]
    async fn test_open_incompatible_is_config_invalid() {
        let (child, _) = child("c1");
        let too_big = ChildRequirements {
            size_bytes: 2 * 1024 * 1024,
            ..requirements()
        };
        let err = child
            .open(too_big, None, SyncState::Synced)
            .await
            .unwrap_err();
        assert!(matches!(err, NexusError::ChildIncompatible { .. }));
        assert_eq!(child.state().operational, OperationalState::ConfigInvalid);

        // Terminal until removed
        assert!(
            child
                .open(requirements(), None, SyncState::Synced)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_open_failure_faults_cant_open() {
        let (child, device) = child("c2");
        device.set_fail_open(true);
        assert!(
            child
                .open(requirements(), None, SyncState::Synced)
                .await
                .is_err()
        );
        assert_eq!(
            child.state().operational,
            OperationalState::Faulted(FaultReason::CantOpen)
        );
    }

    #[tokio::test]
    async fn test_fault_is_idempotent() {
        let (child, _) = child("c3");
        child
            .open(requirements(), None, SyncState::Synced)
            .await
            .unwrap();

        assert!(child.fault(FaultReason::IoError));
        let first = child.state();
        assert!(first.faulted_at.is_some());
        assert_eq!(first.sync, SyncState::OutOfSync);

        assert!(!child.fault(FaultReason::IoError));
        let second = child.state();
        assert_eq!(second.version, first.version);
        assert_eq!(second.faulted_at, first.faulted_at);

        // A different reason updates the reason but not the timestamp
        assert!(child.fault(FaultReason::TimedOut));
        assert_eq!(child.state().faulted_at, first.faulted_at);
    }

    #[tokio::test]
    async fn test_rebuilding_is_write_only() {
        let (child, _) = child("c4");
        child
            .open(requirements(), None, SyncState::OutOfSync)
            .await
            .unwrap();
        assert!(!child.state().is_write_eligible());
        assert_eq!(child.state().status(), ChildStatus::OutOfSync);

        assert!(child.set_rebuilding(true));
        let state = child.state();
        assert!(state.is_write_eligible());
        assert!(!state.is_read_eligible());
        assert_eq!(state.status(), ChildStatus::OutOfSync);

        assert!(child.set_synced());
        assert!(child.state().is_read_eligible());
    }

    #[tokio::test]
    async fn test_destroying_projection() {
        let (child, _) = child("c5");
        child
            .open(requirements(), None, SyncState::Synced)
            .await
            .unwrap();
        child.fault(FaultReason::IoError);
        child.set_destroying();
        let state = child.state();
        assert_eq!(state.status(), ChildStatus::Faulting);
        assert!(!state.is_write_eligible());
    }

    #[tokio::test]
    async fn test_reopen_recoverable_only() {
        let (child, device) = child("c6");
        child
            .open(requirements(), None, SyncState::Synced)
            .await
            .unwrap();

        child.fault(FaultReason::TimedOut);
        device.set_fail_open(true);
        assert!(child.reopen(requirements(), None).await.is_err());
        // Still unreachable: the original reason is kept
        assert_eq!(
            child.state().fault_reason(),
            Some(FaultReason::TimedOut)
        );

        device.set_fail_open(false);
        child.reopen(requirements(), None).await.unwrap();
        let state = child.state();
        assert!(state.is_open());
        assert_eq!(state.sync, SyncState::OutOfSync);

        child.fault(FaultReason::OfflinePermanent);
        assert!(matches!(
            child.reopen(requirements(), None).await,
            Err(NexusError::ChildInvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_drain_waits_for_guards() {
        let (child, _) = child("c7");
        let guard = child.track();
        assert_eq!(child.in_flight(), 1);
        assert!(child.drain(Duration::from_millis(10)).await.is_err());
        drop(guard);
        child.drain(Duration::from_millis(10)).await.unwrap();
    }
}
