//! Nexus: one virtual block device over replicated children
//!
//! The nexus owns its children, the per-context I/O channels, the admission
//! gate and the rebuild jobs. Management operations are serialized by one
//! async mutex; child faults raised on the data path are applied by a
//! control loop so the data path only has to send an event.

use crate::channel::{ChannelContext, ChannelSets, IoChannel, LastError, NexusEvent, WriteOp};
use crate::child::{
    ChildInfo, ChildRequirements, ChildStateSnapshot, ChildStatus, FaultReason, NexusChild,
    SyncState,
};
use crate::error::{NexusError, NexusResult};
use crate::gate::{GateClosed, IoGate, IoPermit};
use crate::rebuild::{
    RebuildError, RebuildHistory, RebuildJob, RebuildRecord, RebuildState, RebuildStats,
};
use crate::reservation::{self, ReservationToken};
use crate::segment_map::SegmentMap;
use crate::snapshot::{self, NexusSnapshotResult, SnapshotDescriptor};

use bytes::Bytes;
use futures::future::join_all;
use nexio_common::{NexusConfig, ReservationConfig, ReservationPolicy};
use nexio_device::{DeviceEvent, DeviceFactory, DeviceGeometry, IoStats, IoStatsSnapshot};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Nexus lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NexusState {
    /// Created, children not opened yet
    Init,
    /// Closed without releasing reservations
    Closed,
    Open,
    /// Children being added, removed or attached to a rebuild
    Reconfiguring,
    ShuttingDown,
    Shutdown,
}

impl fmt::Display for NexusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NexusState::Init => "init",
            NexusState::Closed => "closed",
            NexusState::Open => "open",
            NexusState::Reconfiguring => "reconfiguring",
            NexusState::ShuttingDown => "shutting down",
            NexusState::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Client-facing health of the nexus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NexusStatus {
    /// Every child is healthy
    Online,
    /// At least one child is healthy
    Degraded,
    /// No child is healthy
    Faulted,
    ShuttingDown,
    Shutdown,
}

/// Reservation held on one child
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildReservation {
    pub uri: String,
    pub token: Option<ReservationToken>,
}

/// Ownership of the replica set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationStatus {
    pub key: u64,
    pub policy: ReservationPolicy,
    pub children: Vec<ChildReservation>,
    /// Write-eligible children on which we hold the reservation
    pub held: usize,
    pub required: usize,
    /// The quorum is met
    pub owned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildIoStats {
    pub uri: String,
    pub stats: IoStatsSnapshot,
}

/// Nexus-level and per-child I/O counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NexusStats {
    pub nexus: IoStatsSnapshot,
    pub children: Vec<ChildIoStats>,
}

/// Diagnostic view of a nexus
#[derive(Debug, Clone, Serialize)]
pub struct NexusInfo {
    pub name: String,
    pub uuid: Uuid,
    pub size_bytes: u64,
    pub block_size: u32,
    pub state: NexusState,
    pub status: NexusStatus,
    pub children: Vec<ChildInfo>,
    pub last_error: Option<LastError>,
}

pub struct Nexus {
    name: String,
    uuid: Uuid,
    size_bytes: u64,
    geometry: DeviceGeometry,
    /// Rebuild segment size, at least one block
    segment_size: u64,
    config: NexusConfig,
    factory: Arc<dyn DeviceFactory>,
    state: RwLock<NexusState>,
    children: RwLock<Vec<Arc<NexusChild>>>,
    channels: Vec<Arc<IoChannel>>,
    ctx: Arc<ChannelContext>,
    gate: IoGate,
    /// Serializes channel set rebuilds
    reconnect_lock: Mutex<()>,
    generation: AtomicU64,
    /// Serializes management operations
    ops: tokio::sync::Mutex<()>,
    /// Active rebuilds by destination URI
    rebuilds: Mutex<HashMap<String, Arc<RebuildJob>>>,
    history: RebuildHistory,
    /// Device event watchers by child URI
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Nexus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nexus '{}' [{}]", self.name, self.state())
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        for (_, watcher) in self.watchers.get_mut().drain() {
            watcher.abort();
        }
    }
}

impl Nexus {
    /// Create a nexus of `size_bytes` over `children` and open it.
    ///
    /// Initial children are trusted to hold identical data and open as
    /// synced. Children that fail to open stay listed as faulted; at least
    /// one must open.
    pub async fn create(
        name: impl Into<String>,
        size_bytes: u64,
        children: &[String],
        config: NexusConfig,
        factory: Arc<dyn DeviceFactory>,
    ) -> NexusResult<Arc<Self>> {
        let name = name.into();
        config.validate()?;
        if children.is_empty() {
            return Err(NexusError::NoHealthyChildren(name));
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = children.iter().find(|uri| !seen.insert(uri.as_str())) {
            return Err(NexusError::ChildExists {
                nexus: name,
                child: duplicate.clone(),
            });
        }
        if size_bytes == 0 {
            return Err(NexusError::InvalidSize {
                name,
                size: size_bytes,
                reason: "size must be non-zero".to_string(),
            });
        }

        let mut devices = Vec::with_capacity(children.len());
        for uri in children {
            devices.push((uri.clone(), factory.create(uri).await?));
        }
        let block_size = config
            .block_size
            .unwrap_or_else(|| devices[0].1.geometry().block_size);
        if size_bytes % u64::from(block_size) != 0 {
            return Err(NexusError::InvalidSize {
                name,
                size: size_bytes,
                reason: format!("not a multiple of the block size {block_size}"),
            });
        }

        let (events, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(ChannelContext {
            nexus: name.clone(),
            events,
            last_error: RwLock::new(None),
            max_write_retries: config.max_write_retries,
            stats: IoStats::new(),
        });
        let channels = (0..config.io_channels)
            .map(|id| Arc::new(IoChannel::new(id, Arc::clone(&ctx))))
            .collect();
        let nexus = Arc::new(Self {
            uuid: Uuid::new_v4(),
            size_bytes,
            geometry: DeviceGeometry::new(block_size, size_bytes / u64::from(block_size)),
            segment_size: config.rebuild.segment_size.max(u64::from(block_size)),
            history: RebuildHistory::new(config.history_capacity),
            children: RwLock::new(
                devices
                    .into_iter()
                    .map(|(uri, device)| Arc::new(NexusChild::new(uri, name.clone(), device)))
                    .collect(),
            ),
            name,
            config,
            factory,
            state: RwLock::new(NexusState::Init),
            channels,
            ctx,
            gate: IoGate::new(),
            reconnect_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            ops: tokio::sync::Mutex::new(()),
            rebuilds: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let control = tokio::spawn(control_loop(Arc::downgrade(&nexus), rx));
        nexus.tasks.lock().push(control);
        nexus.open().await?;
        Ok(nexus)
    }

    /// Open every child and take ownership of the replica set
    async fn open(self: &Arc<Self>) -> NexusResult<()> {
        info!("{:?}: opening {} children", self, self.children.read().len());
        let children = self.children.read().clone();
        let requirements = self.requirements();
        let reservation = self.config.reservation.as_ref();
        let results = join_all(
            children
                .iter()
                .map(|child| child.open(requirements, reservation, SyncState::Synced)),
        )
        .await;
        for (child, result) in children.iter().zip(results) {
            if let Err(e) = result {
                warn!("{:?}: failed to open: {}", child, e);
            }
        }

        if !children.iter().any(|c| c.state().is_open()) {
            error!("{:?}: no child could be opened", self);
            self.close_children(false).await;
            self.set_state(NexusState::Closed);
            return Err(NexusError::NoHealthyChildren(self.name.clone()));
        }

        if let Some(ref config) = self.config.reservation {
            let writers = children
                .iter()
                .filter(|c| c.state().is_write_eligible())
                .count();
            let held = children
                .iter()
                .filter(|c| c.state().is_write_eligible() && c.reservation().is_some())
                .count();
            let required = config.quorum.required(writers);
            if held < required {
                error!(
                    "{:?}: holds the reservation on {} children, {} required",
                    self, held, required
                );
                self.close_children(true).await;
                self.set_state(NexusState::Closed);
                return Err(NexusError::ReservationQuorum {
                    nexus: self.name.clone(),
                    held,
                    required,
                });
            }
        }

        for child in &children {
            self.watch_device(child);
        }
        self.set_state(NexusState::Open);
        self.reconnect();
        self.start_reconnect_timer();
        info!("{:?}: opened, status {:?}", self, self.status());
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn block_size(&self) -> u32 {
        self.geometry.block_size
    }

    pub fn config(&self) -> &NexusConfig {
        &self.config
    }

    pub fn state(&self) -> NexusState {
        *self.state.read()
    }

    fn set_state(&self, state: NexusState) {
        let mut current = self.state.write();
        if *current != state {
            debug!("Nexus '{}': {} -> {}", self.name, *current, state);
            *current = state;
        }
    }

    /// Move `from` -> `to`; false if the nexus is elsewhere
    fn transition_state(&self, from: NexusState, to: NexusState) -> bool {
        let mut current = self.state.write();
        if *current != from {
            return false;
        }
        debug!("Nexus '{}': {} -> {}", self.name, from, to);
        *current = to;
        true
    }

    pub fn status(&self) -> NexusStatus {
        match self.state() {
            NexusState::Init => NexusStatus::Degraded,
            NexusState::Closed => NexusStatus::Faulted,
            NexusState::ShuttingDown => NexusStatus::ShuttingDown,
            NexusState::Shutdown => NexusStatus::Shutdown,
            NexusState::Open | NexusState::Reconfiguring => {
                let children = self.children.read();
                let healthy = children
                    .iter()
                    .filter(|c| c.state().is_read_eligible())
                    .count();
                if healthy == 0 {
                    NexusStatus::Faulted
                } else if healthy == children.len() {
                    NexusStatus::Online
                } else {
                    NexusStatus::Degraded
                }
            }
        }
    }

    fn check_open(&self) -> NexusResult<()> {
        match self.state() {
            NexusState::Open | NexusState::Reconfiguring => Ok(()),
            state => Err(NexusError::InvalidState {
                name: self.name.clone(),
                state,
            }),
        }
    }

    fn requirements(&self) -> ChildRequirements {
        ChildRequirements {
            block_size: self.geometry.block_size,
            size_bytes: self.size_bytes,
            reservations: self.config.reservation.is_some(),
        }
    }

    /// Reservation settings for children opened after create. Only the
    /// initial open may take over from the configured `preempt_key`.
    fn rejoin_reservation(&self) -> Option<ReservationConfig> {
        self.config.reservation.as_ref().map(|config| ReservationConfig {
            preempt_key: None,
            ..config.clone()
        })
    }

    fn child(&self, uri: &str) -> NexusResult<Arc<NexusChild>> {
        self.children
            .read()
            .iter()
            .find(|c| c.uri() == uri)
            .cloned()
            .ok_or_else(|| NexusError::ChildNotFound {
                nexus: self.name.clone(),
                child: uri.to_string(),
            })
    }

    /// Rebuild the channel sets from the current child states and publish
    /// them to every channel
    fn reconnect(&self) {
        let _guard = self.reconnect_lock.lock();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let children = self.children.read().clone();
        let mut loggers: Vec<Arc<SegmentMap>> =
            children.iter().filter_map(|c| c.fault_log()).collect();
        loggers.extend(
            self.rebuilds
                .lock()
                .values()
                .filter(|job| !job.state().is_terminal())
                .map(|job| Arc::clone(job.log())),
        );
        let sets = Arc::new(ChannelSets::build(generation, &children, loggers));
        debug!(
            "{:?}: generation {}: {} writers, {} readers, {} detached, {} logs",
            self,
            generation,
            sets.writers.len(),
            sets.readers.len(),
            sets.detached.len(),
            sets.loggers.len()
        );
        for channel in &self.channels {
            channel.reconnect(Arc::clone(&sets));
        }
    }

    /// Run `f` with application I/O paused and the nexus `Reconfiguring`
    async fn reconfigure<R>(&self, f: impl FnOnce() -> R) -> R {
        let entered = self.transition_state(NexusState::Open, NexusState::Reconfiguring);
        let pause = self.gate.pause().await;
        let result = f();
        drop(pause);
        if entered {
            self.transition_state(NexusState::Reconfiguring, NexusState::Open);
        }
        result
    }

    /// Fault `child` and rewire the channels around it
    fn apply_fault(&self, child: &NexusChild, reason: FaultReason, detail: Option<String>) -> bool {
        let previous = child.state();
        if !child.fault(reason) {
            return false;
        }
        warn!("{:?}: faulted: {}", child, reason);

        if previous.is_read_eligible() && reason.is_recoverable() && self.config.partial_rebuild {
            debug!("{:?}: logging missed writes", child);
            child.attach_fault_log(Arc::new(SegmentMap::new(
                self.size_bytes,
                self.segment_size,
            )));
        }

        for job in self.rebuilds.lock().values() {
            let destination = job.destination_uri() == child.uri();
            if (destination || job.source_uri() == child.uri())
                && job
                    .fail(format!("{} faulted: {}", child.uri(), reason))
                    .is_ok()
                && destination
            {
                child.mark_rebuild_failed();
            }
        }

        self.reconnect();
        self.ctx.set_last_error(
            child.uri(),
            Some(reason),
            detail.unwrap_or_else(|| reason.to_string()),
        );
        true
    }

    fn on_child_fault(self: &Arc<Self>, uri: &str, reason: FaultReason, detail: Option<String>) {
        let Ok(child) = self.child(uri) else {
            debug!("{:?}: fault for unknown child {}", self, uri);
            return;
        };
        if !self.apply_fault(&child, reason, detail) {
            return;
        }
        if reason == FaultReason::ReservationConflict
            && self
                .config
                .reservation
                .as_ref()
                .is_some_and(|r| r.shutdown_on_conflict)
            && self.check_open().is_ok()
        {
            error!(
                "{:?}: another instance took over {}, shutting down",
                self, uri
            );
            let nexus = Arc::clone(self);
            tokio::spawn(async move {
                // The reservation now belongs to someone else
                nexus.shutdown_inner(false).await;
            });
        }
    }

    fn watch_device(self: &Arc<Self>, child: &Arc<NexusChild>) {
        let mut events = child.device().subscribe();
        let sender = self.ctx.events.clone();
        let uri = child.uri().to_string();
        let size_bytes = self.size_bytes;
        let block_size = u64::from(child.device().geometry().block_size);
        let watcher = tokio::spawn({
            let uri = uri.clone();
            async move {
                loop {
                    let reason = match events.recv().await {
                        Ok(DeviceEvent::Removed { device }) => {
                            warn!("{}: device {} removed", uri, device);
                            FaultReason::CantOpen
                        }
                        Ok(DeviceEvent::Resized { device, num_blocks }) => {
                            if num_blocks * block_size >= size_bytes {
                                info!("{}: device {} resized to {} blocks", uri, device, num_blocks);
                                continue;
                            }
                            warn!(
                                "{}: device {} shrunk to {} blocks, below the nexus size",
                                uri, device, num_blocks
                            );
                            FaultReason::CantOpen
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!("{}: missed {} device events", uri, n);
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };
                    let event = NexusEvent::ChildFault {
                        uri: uri.clone(),
                        reason,
                        error: None,
                        ack: None,
                    };
                    if sender.send(event).is_err() {
                        break;
                    }
                }
            }
        });
        if let Some(previous) = self.watchers.lock().insert(uri, watcher) {
            previous.abort();
        }
    }

    fn start_reconnect_timer(self: &Arc<Self>) {
        let Some(interval) = self.config.reconnect_interval() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(nexus) = weak.upgrade() else {
                    break;
                };
                match nexus.state() {
                    NexusState::Open | NexusState::Reconfiguring => {
                        nexus.reconnect_faulted_children().await;
                    }
                    NexusState::Init => {}
                    _ => break,
                }
            }
        });
        self.tasks.lock().push(timer);
    }

    /// Add a child by URI.
    ///
    /// The child opens out of sync and, with `auto_rebuild`, is rebuilt
    /// right away. An incompatible device stays listed as `ConfigInvalid`.
    pub async fn add_child(self: &Arc<Self>, uri: &str) -> NexusResult<ChildStatus> {
        let _op = self.ops.lock().await;
        self.check_open()?;
        if self.child(uri).is_ok() {
            return Err(NexusError::ChildExists {
                nexus: self.name.clone(),
                child: uri.to_string(),
            });
        }

        let device = self.factory.create(uri).await?;
        let child = Arc::new(NexusChild::new(uri.to_string(), self.name.clone(), device));
        self.children.write().push(Arc::clone(&child));
        info!("{:?}: adding child {}", self, uri);

        if let Err(e) = child
            .open(
                self.requirements(),
                self.rejoin_reservation().as_ref(),
                SyncState::OutOfSync,
            )
            .await
        {
            warn!("{:?}: child {} failed to open: {}", self, uri, e);
            return Err(e);
        }
        self.watch_device(&child);
        self.reconfigure(|| self.reconnect()).await;

        if self.config.auto_rebuild {
            if let Err(e) = self.start_rebuild_locked(&child).await {
                warn!("{:?}: cannot rebuild {}: {}", self, uri, e);
            }
        }
        Ok(child.state().status())
    }

    /// Take a child out of the nexus.
    ///
    /// The child leaves the dispatch sets first, then its in-flight I/O
    /// drains, its reservation is released and its handle closed.
    pub async fn remove_child(&self, uri: &str) -> NexusResult<()> {
        let _op = self.ops.lock().await;
        self.check_open()?;
        let child = self.child(uri)?;
        self.check_not_last_healthy(&child)?;
        info!("{:?}: removing child {}", self, uri);

        let jobs: Vec<_> = self
            .rebuilds
            .lock()
            .values()
            .filter(|job| job.destination_uri() == uri || job.source_uri() == uri)
            .cloned()
            .collect();
        for job in jobs {
            let _ = job.stop();
            job.wait().await;
        }

        child.set_destroying();
        self.reconfigure(|| self.reconnect()).await;
        if let Err(e) = child.drain(self.config.drain_timeout()).await {
            warn!("{:?}: {}", self, e);
        }
        child.release_reservation().await;
        child.close();

        self.children.write().retain(|c| !Arc::ptr_eq(c, &child));
        if let Some(watcher) = self.watchers.lock().remove(uri) {
            watcher.abort();
        }
        self.reconnect();
        if let Err(e) = self.factory.destroy(uri).await {
            debug!("{:?}: releasing device {}: {}", self, uri, e);
        }
        info!("{:?}: removed child {}", self, uri);
        Ok(())
    }

    fn check_not_last_healthy(&self, child: &NexusChild) -> NexusResult<()> {
        if !child.state().is_read_eligible() {
            return Ok(());
        }
        let healthy = self
            .children
            .read()
            .iter()
            .filter(|c| c.state().is_read_eligible())
            .count();
        if healthy <= 1 {
            return Err(NexusError::LastHealthyChild {
                nexus: self.name.clone(),
                child: child.uri().to_string(),
            });
        }
        Ok(())
    }

    /// Operator-requested fault. `permanent` children only come back by
    /// being removed and added again.
    pub async fn offline_child(&self, uri: &str, permanent: bool) -> NexusResult<()> {
        let _op = self.ops.lock().await;
        self.check_open()?;
        let child = self.child(uri)?;
        self.check_not_last_healthy(&child)?;
        let reason = if permanent {
            FaultReason::OfflinePermanent
        } else {
            FaultReason::Offline
        };
        info!("{:?}: taking child {} offline ({})", self, uri, reason);
        self.reconfigure(|| self.apply_fault(&child, reason, None))
            .await;
        Ok(())
    }

    /// Reopen a faulted or closed child and rebuild it
    pub async fn online_child(self: &Arc<Self>, uri: &str) -> NexusResult<ChildStatus> {
        let _op = self.ops.lock().await;
        self.check_open()?;
        let child = self.child(uri)?;
        let state = child.state();
        if state.is_open() {
            return Ok(state.status());
        }
        child
            .reopen(self.requirements(), self.rejoin_reservation().as_ref())
            .await?;
        info!("{:?}: child {} back online", self, uri);
        self.reconfigure(|| self.reconnect()).await;
        self.auto_rebuild(&child).await;
        Ok(child.state().status())
    }

    /// Try to reopen every child faulted for a recoverable reason.
    ///
    /// Returns the number of children brought back.
    pub async fn reconnect_faulted_children(self: &Arc<Self>) -> usize {
        let _op = self.ops.lock().await;
        if self.check_open().is_err() {
            return 0;
        }
        let candidates: Vec<_> = self
            .children
            .read()
            .iter()
            .filter(|c| {
                let state = c.state();
                state.destroy == crate::child::DestroyState::None
                    && state.fault_reason().is_some_and(|r| r.is_recoverable())
            })
            .cloned()
            .collect();

        let reservation = self.rejoin_reservation();
        let mut reconnected = Vec::new();
        for child in candidates {
            match child
                .reopen(self.requirements(), reservation.as_ref())
                .await
            {
                Ok(()) => {
                    info!("{:?}: reconnected", child);
                    reconnected.push(child);
                }
                Err(e) => debug!("{:?}: still unavailable: {}", child, e),
            }
        }
        if reconnected.is_empty() {
            return 0;
        }

        self.reconfigure(|| self.reconnect()).await;
        for child in &reconnected {
            self.auto_rebuild(child).await;
        }
        reconnected.len()
    }

    /// Rebuild a reopened child unless its last rebuild failed
    async fn auto_rebuild(self: &Arc<Self>, child: &Arc<NexusChild>) {
        if !self.config.auto_rebuild {
            return;
        }
        if child.rebuild_failed() {
            info!("{:?}: last rebuild failed, waiting for an explicit rebuild", child);
            return;
        }
        if let Err(e) = self.start_rebuild_locked(child).await {
            warn!("{:?}: cannot rebuild: {}", child, e);
        }
    }

    /// Start rebuilding an out-of-sync child from a healthy one.
    ///
    /// A child carrying a log of writes missed while faulted gets a partial
    /// rebuild of those segments; otherwise the whole range is copied. This
    /// is also how a child whose last rebuild failed is rebuilt again.
    pub async fn start_rebuild(self: &Arc<Self>, uri: &str) -> NexusResult<Arc<RebuildJob>> {
        let _op = self.ops.lock().await;
        self.check_open()?;
        let child = self.child(uri)?;
        self.start_rebuild_locked(&child).await
    }

    async fn start_rebuild_locked(
        self: &Arc<Self>,
        child: &Arc<NexusChild>,
    ) -> NexusResult<Arc<RebuildJob>> {
        let uri = child.uri();
        if let Some(job) = self.rebuilds.lock().get(uri)
            && !job.state().is_terminal()
        {
            return Err(NexusError::RebuildExists {
                child: uri.to_string(),
            });
        }
        let state = child.state();
        if !state.is_open() {
            return Err(NexusError::ChildInvalidState {
                child: uri.to_string(),
                state: state.operational,
            });
        }
        if state.sync == SyncState::Synced {
            return Err(NexusError::RebuildNotNeeded {
                child: uri.to_string(),
            });
        }

        let source = self
            .children
            .read()
            .iter()
            .find(|c| !Arc::ptr_eq(c, child) && c.state().is_read_eligible())
            .cloned();
        let (Some(source), Some(source_handle), Some(destination_handle)) = (
            source.clone(),
            source.and_then(|s| s.handle()),
            child.handle(),
        ) else {
            return Err(NexusError::NoRebuildSource {
                nexus: self.name.clone(),
                child: uri.to_string(),
            });
        };

        // Hand the fault log over to the job and attach the job's own log
        // with I/O paused so no write falls between the two
        let job = self
            .reconfigure(|| {
                let bitmap = child.take_fault_log().map(|log| log.snapshot());
                let job = Arc::new(RebuildJob::new(
                    self.name.clone(),
                    source.uri(),
                    source_handle,
                    uri,
                    destination_handle,
                    self.size_bytes,
                    self.segment_size,
                    self.config.rebuild.clone(),
                    bitmap,
                ));
                child.set_rebuild_job(&job);
                child.set_rebuilding(true);
                child.clear_rebuild_failed();
                self.rebuilds
                    .lock()
                    .insert(uri.to_string(), Arc::clone(&job));
                self.reconnect();
                job
            })
            .await;
        info!(
            "{:?}: {} rebuild of {} from {}",
            self,
            job.kind(),
            uri,
            source.uri()
        );

        let nexus = Arc::clone(self);
        let task_job = Arc::clone(&job);
        let destination = Arc::clone(child);
        tokio::spawn(async move {
            let gate = nexus.gate.clone();
            let finalize = {
                let nexus = Arc::clone(&nexus);
                let destination = Arc::clone(&destination);
                move || {
                    destination.set_synced();
                    nexus.reconnect();
                    info!("{:?}: synced", destination);
                }
            };
            task_job.run(&gate, finalize).await;
            nexus.rebuild_finished(&task_job, &destination);
        });
        Ok(job)
    }

    /// Record a finished job and apply its outcome to the children.
    ///
    /// A failed job is never restarted here: the destination stays out of
    /// sync until an explicit `start_rebuild`.
    fn rebuild_finished(&self, job: &Arc<RebuildJob>, destination: &NexusChild) {
        self.history.push(job.record());
        {
            let mut rebuilds = self.rebuilds.lock();
            if rebuilds
                .get(job.destination_uri())
                .is_some_and(|j| Arc::ptr_eq(j, job))
            {
                rebuilds.remove(job.destination_uri());
            }
        }

        let state = job.state();
        if state != RebuildState::Completed {
            destination.set_rebuilding(false);
        }
        if state == RebuildState::Failed {
            destination.mark_rebuild_failed();
        }
        match (state, job.failure()) {
            (RebuildState::Completed, _) => {
                info!("{:?}: rebuild of {} completed", self, job.destination_uri());
            }
            (
                RebuildState::Failed,
                Some(e @ (RebuildError::Destination { .. } | RebuildError::VerifyMismatch { .. })),
            ) => {
                self.apply_fault(destination, FaultReason::RebuildFailed, Some(e.to_string()));
            }
            (RebuildState::Failed, Some(RebuildError::Source { uri, source })) => {
                if let Some(reason) = FaultReason::from_device_error(&source)
                    && let Ok(child) = self.child(&uri)
                {
                    self.apply_fault(&child, reason, Some(source.to_string()));
                }
            }
            (RebuildState::Failed, None) => {
                // Failed from outside because a participant faulted
                info!(
                    "{:?}: rebuild of {} aborted: {}",
                    self,
                    job.destination_uri(),
                    job.error().unwrap_or_default()
                );
            }
            (state, _) => {
                info!(
                    "{:?}: rebuild of {} ended {}",
                    self,
                    job.destination_uri(),
                    state
                );
            }
        }
        self.reconnect();
    }

    fn rebuild(&self, uri: &str) -> NexusResult<Arc<RebuildJob>> {
        self.rebuilds
            .lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| NexusError::RebuildNotFound {
                child: uri.to_string(),
            })
    }

    pub fn pause_rebuild(&self, uri: &str) -> NexusResult<()> {
        self.rebuild(uri)?
            .pause()
            .map_err(|state| rebuild_invalid_state(uri, "pause", state))
    }

    pub fn resume_rebuild(&self, uri: &str) -> NexusResult<()> {
        self.rebuild(uri)?
            .resume()
            .map_err(|state| rebuild_invalid_state(uri, "resume", state))
    }

    pub fn stop_rebuild(&self, uri: &str) -> NexusResult<()> {
        self.rebuild(uri)?
            .stop()
            .map_err(|state| rebuild_invalid_state(uri, "stop", state))
    }

    /// State of the rebuild targeting `uri`, falling back to the last
    /// recorded one
    pub fn rebuild_state(&self, uri: &str) -> NexusResult<RebuildState> {
        if let Ok(job) = self.rebuild(uri) {
            return Ok(job.state());
        }
        self.history
            .for_child(uri)
            .last()
            .map(|record| record.state)
            .ok_or_else(|| NexusError::RebuildNotFound {
                child: uri.to_string(),
            })
    }

    pub fn rebuild_stats(&self, uri: &str) -> NexusResult<RebuildStats> {
        Ok(self.rebuild(uri)?.stats())
    }

    pub fn rebuild_job(&self, uri: &str) -> Option<Arc<RebuildJob>> {
        self.rebuild(uri).ok()
    }

    /// Number of rebuild jobs not yet retired
    pub fn active_rebuilds(&self) -> usize {
        self.rebuilds.lock().len()
    }

    pub fn rebuild_history(&self) -> Vec<RebuildRecord> {
        self.history.records()
    }

    /// Snapshot the participating children at one point in time
    pub async fn create_snapshot(
        &self,
        descriptors: &[SnapshotDescriptor],
    ) -> NexusResult<NexusSnapshotResult> {
        let _op = self.ops.lock().await;
        self.check_open()?;
        let children = self.children.read().clone();
        let plan = snapshot::plan(&children, descriptors)?;
        info!("{:?}: creating snapshot", self);
        snapshot::execute(&self.name, &self.gate, plan).await
    }

    pub fn children(&self) -> Vec<ChildInfo> {
        self.children.read().iter().map(|c| c.info()).collect()
    }

    pub fn child_uris(&self) -> Vec<String> {
        self.children
            .read()
            .iter()
            .map(|c| c.uri().to_string())
            .collect()
    }

    pub fn child_state(&self, uri: &str) -> NexusResult<Arc<ChildStateSnapshot>> {
        Ok(self.child(uri)?.state())
    }

    pub fn child_status(&self, uri: &str) -> NexusResult<ChildStatus> {
        Ok(self.child(uri)?.state().status())
    }

    pub fn child_info(&self, uri: &str) -> NexusResult<ChildInfo> {
        Ok(self.child(uri)?.info())
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.ctx.last_error.read().clone()
    }

    pub fn info(&self) -> NexusInfo {
        NexusInfo {
            name: self.name.clone(),
            uuid: self.uuid,
            size_bytes: self.size_bytes,
            block_size: self.geometry.block_size,
            state: self.state(),
            status: self.status(),
            children: self.children(),
            last_error: self.last_error(),
        }
    }

    pub fn stats(&self) -> NexusStats {
        NexusStats {
            nexus: self.ctx.stats.snapshot(),
            children: self
                .children
                .read()
                .iter()
                .filter_map(|c| {
                    c.handle().map(|h| ChildIoStats {
                        uri: c.uri().to_string(),
                        stats: h.stats(),
                    })
                })
                .collect(),
        }
    }

    pub fn channels(&self) -> &[Arc<IoChannel>] {
        &self.channels
    }

    /// Channel of the calling thread
    fn current_channel(&self) -> &IoChannel {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        let index = (hasher.finish() % self.channels.len() as u64) as usize;
        &self.channels[index]
    }

    async fn admit(&self, offset: u64, length: u64) -> NexusResult<IoPermit> {
        self.check_open()?;
        self.geometry.check_io(offset, length)?;
        self.gate.admit().await.map_err(|GateClosed| NexusError::InvalidState {
            name: self.name.clone(),
            state: self.state(),
        })
    }

    pub async fn read(&self, offset: u64, length: u64) -> NexusResult<Bytes> {
        let _permit = self.admit(offset, length).await?;
        self.current_channel().read(offset, length).await
    }

    pub async fn write(&self, offset: u64, data: Bytes) -> NexusResult<()> {
        let _permit = self.admit(offset, data.len() as u64).await?;
        self.current_channel()
            .write(WriteOp::Write { offset, data })
            .await
    }

    pub async fn unmap(&self, offset: u64, length: u64) -> NexusResult<()> {
        let _permit = self.admit(offset, length).await?;
        self.current_channel()
            .write(WriteOp::Unmap { offset, length })
            .await
    }

    pub async fn write_zeroes(&self, offset: u64, length: u64) -> NexusResult<()> {
        let _permit = self.admit(offset, length).await?;
        self.current_channel()
            .write(WriteOp::WriteZeroes { offset, length })
            .await
    }

    pub async fn flush(&self) -> NexusResult<()> {
        let _permit = self.admit(0, 0).await?;
        self.current_channel().write(WriteOp::Flush).await
    }

    /// Take the reservation over from `victim` on every open child.
    ///
    /// Only ever issued on operator request.
    pub async fn preempt_reservations(&self, victim: u64) -> NexusResult<ReservationStatus> {
        let _op = self.ops.lock().await;
        self.check_open()?;
        let config = self
            .config
            .reservation
            .as_ref()
            .ok_or_else(|| NexusError::ReservationsDisabled(self.name.clone()))?;
        let children = self.children.read().clone();
        let mut preempted = 0;
        let mut first_error = None;
        for child in children.iter().filter(|c| c.state().is_open()) {
            let Some(handle) = child.handle() else {
                continue;
            };
            match reservation::preempt(handle.as_ref(), config, victim).await {
                Ok(token) => {
                    child.set_reservation(Some(token));
                    preempted += 1;
                }
                Err(e) => {
                    warn!("{:?}: preempt of {:#x} failed: {}", child, victim, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if preempted == 0
            && let Some(e) = first_error
        {
            return Err(e.into());
        }
        self.reservation_status_locked(&children).await
    }

    /// Verify the reservation on every child against the device
    pub async fn reservation_status(&self) -> NexusResult<ReservationStatus> {
        let children = self.children.read().clone();
        self.reservation_status_locked(&children).await
    }

    async fn reservation_status_locked(
        &self,
        children: &[Arc<NexusChild>],
    ) -> NexusResult<ReservationStatus> {
        let config = self
            .config
            .reservation
            .as_ref()
            .ok_or_else(|| NexusError::ReservationsDisabled(self.name.clone()))?;

        let mut entries = Vec::with_capacity(children.len());
        let mut writers = 0;
        let mut held = 0;
        for child in children {
            let token = match child.handle() {
                Some(handle) => reservation::verify(handle.as_ref(), config).await.ok(),
                None => None,
            };
            child.set_reservation(token);
            if child.state().is_write_eligible() {
                writers += 1;
                if token.is_some() {
                    held += 1;
                }
            }
            entries.push(ChildReservation {
                uri: child.uri().to_string(),
                token,
            });
        }
        let required = config.quorum.required(writers);
        Ok(ReservationStatus {
            key: config.key,
            policy: config.policy,
            children: entries,
            held,
            required,
            owned: held > 0 && held >= required,
        })
    }

    /// Stop I/O, stop rebuilds, release reservations and close children
    pub async fn shutdown(&self) -> NexusResult<()> {
        self.shutdown_inner(true).await;
        Ok(())
    }

    async fn shutdown_inner(&self, release: bool) {
        {
            let mut state = self.state.write();
            if matches!(*state, NexusState::ShuttingDown | NexusState::Shutdown) {
                return;
            }
            *state = NexusState::ShuttingDown;
        }
        info!("Nexus '{}': shutting down", self.name);
        self.gate.shutdown();
        self.gate.wait_drained().await;
        self.close_children(release).await;
        self.set_state(NexusState::Shutdown);
        info!("{:?}: shut down", self);
    }

    /// Close without releasing reservations
    pub async fn close(&self) -> NexusResult<()> {
        {
            let mut state = self.state.write();
            match *state {
                NexusState::Init | NexusState::Open => *state = NexusState::Closed,
                NexusState::Closed => return Ok(()),
                state => {
                    return Err(NexusError::InvalidState {
                        name: self.name.clone(),
                        state,
                    });
                }
            }
        }
        self.gate.shutdown();
        self.gate.wait_drained().await;
        self.close_children(false).await;
        info!("{:?}: closed", self);
        Ok(())
    }

    async fn close_children(&self, release: bool) {
        let jobs: Vec<_> = self.rebuilds.lock().values().cloned().collect();
        for job in jobs {
            let _ = job.stop();
        }
        let children = self.children.read().clone();
        for child in &children {
            if release {
                child.release_reservation().await;
            }
            child.close();
        }
        for (_, watcher) in self.watchers.lock().drain() {
            watcher.abort();
        }
        self.reconnect();
    }
}

fn rebuild_invalid_state(uri: &str, op: &'static str, state: RebuildState) -> NexusError {
    NexusError::RebuildInvalidState {
        child: uri.to_string(),
        op,
        state: state.to_string(),
    }
}

/// Apply data path events until the nexus goes away
async fn control_loop(nexus: Weak<Nexus>, mut events: mpsc::UnboundedReceiver<NexusEvent>) {
    while let Some(event) = events.recv().await {
        let Some(nexus) = nexus.upgrade() else {
            break;
        };
        match event {
            NexusEvent::ChildFault {
                uri,
                reason,
                error,
                ack,
            } => {
                nexus.on_child_fault(&uri, reason, error.map(|e| e.to_string()));
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ChildSnapshotOutcome;
    use chrono::Utc;
    use nexio_common::{
        RebuildConfig, ReservationConfig, ReservationQuorum, SnapshotParams,
    };
    use nexio_device::{BlockDevice, DeviceError, InjectedFault, IoType, UriDeviceFactory};
    use rand::RngCore;
    use std::time::Duration;

    const SIZE: u64 = 4 * 1024 * 1024;

    fn uri(name: &str) -> String {
        format!("malloc:///{name}?size_mb=4")
    }

    fn config() -> NexusConfig {
        NexusConfig {
            io_channels: 2,
            reconnect_interval_ms: 0,
            rebuild: RebuildConfig {
                segment_size: 64 * 1024,
                ..RebuildConfig::default()
            },
            ..NexusConfig::default()
        }
    }

    fn random(len: usize) -> Bytes {
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut buf);
        Bytes::from(buf)
    }

    async fn create(
        factory: &Arc<UriDeviceFactory>,
        names: &[&str],
        config: NexusConfig,
    ) -> NexusResult<Arc<Nexus>> {
        let children: Vec<String> = names.iter().map(|n| uri(n)).collect();
        Nexus::create("nexus0", SIZE, &children, config, factory.clone()).await
    }

    async fn wait_until(what: &str, f: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_create_and_io() {
        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(&factory, &["c0", "c1"], config()).await.unwrap();
        assert_eq!(nexus.state(), NexusState::Open);
        assert_eq!(nexus.status(), NexusStatus::Online);
        assert_eq!(nexus.block_size(), 512);

        let data = random(8192);
        nexus.write(4096, data.clone()).await.unwrap();
        assert_eq!(nexus.read(4096, 8192).await.unwrap(), data);
        for name in ["c0", "c1"] {
            let device = factory.memory_device(name).unwrap();
            assert_eq!(device.peek(4096, 8192), data);
        }

        nexus.write_zeroes(4096, 4096).await.unwrap();
        nexus.unmap(8192, 4096).await.unwrap();
        nexus.flush().await.unwrap();
        assert!(nexus.read(4096, 8192).await.unwrap().iter().all(|b| *b == 0));

        let stats = nexus.stats();
        assert_eq!(stats.nexus.write_ops, 1);
        assert_eq!(stats.children.len(), 2);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let factory = Arc::new(UriDeviceFactory::new());
        let children = vec![uri("c0")];
        assert!(matches!(
            Nexus::create("n", 1000, &children, config(), factory.clone()).await,
            Err(NexusError::InvalidSize { .. })
        ));
        assert!(matches!(
            Nexus::create("n", 0, &children, config(), factory.clone()).await,
            Err(NexusError::InvalidSize { .. })
        ));
        assert!(matches!(
            Nexus::create("n", SIZE, &[], config(), factory.clone()).await,
            Err(NexusError::NoHealthyChildren(_))
        ));
        assert!(matches!(
            Nexus::create("n", SIZE, &[uri("c0"), uri("c0")], config(), factory.clone()).await,
            Err(NexusError::ChildExists { .. })
        ));
        assert!(factory.memory_device("c0").is_none());
        let no_retries = NexusConfig {
            max_write_retries: 0,
            ..config()
        };
        assert!(matches!(
            Nexus::create("n", SIZE, &children, no_retries, factory.clone()).await,
            Err(NexusError::Config(_))
        ));

        factory.create(&uri("c1")).await.unwrap();
        factory.memory_device("c1").unwrap().set_fail_open(true);
        assert!(matches!(
            Nexus::create("n", SIZE, &[uri("c1")], config(), factory.clone()).await,
            Err(NexusError::NoHealthyChildren(_))
        ));
    }

    #[tokio::test]
    async fn test_io_out_of_range() {
        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(&factory, &["c0"], config()).await.unwrap();
        assert!(nexus.read(SIZE, 512).await.is_err());
        assert!(nexus.write(100, random(512)).await.is_err());
        // Request errors never fault a child
        assert_eq!(nexus.status(), NexusStatus::Online);
    }

    #[tokio::test]
    async fn test_write_failure_faults_child() {
        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(&factory, &["c0", "c1"], config()).await.unwrap();
        let c1 = factory.memory_device("c1").unwrap();
        c1.inject_fault(InjectedFault::persistent(IoType::Write, "c1"));

        let data = random(4096);
        nexus.write(0, data.clone()).await.unwrap();

        let state = nexus.child_state(&uri("c1")).unwrap();
        assert_eq!(state.fault_reason(), Some(FaultReason::IoError));
        assert_eq!(nexus.status(), NexusStatus::Degraded);
        assert_eq!(nexus.read(0, 4096).await.unwrap(), data);
        for channel in nexus.channels() {
            assert_eq!(channel.writers(), vec![uri("c0")]);
        }
        let last = nexus.last_error().unwrap();
        assert_eq!(last.child, uri("c1"));

        // A write on the last writer failing is returned to the caller
        factory
            .memory_device("c0")
            .unwrap()
            .inject_fault(InjectedFault::persistent(IoType::Write, "c0"));
        assert!(nexus.write(0, data).await.is_err());
        assert_eq!(nexus.status(), NexusStatus::Faulted);
    }

    #[tokio::test]
    async fn test_read_fails_over() {
        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(&factory, &["c0", "c1"], config()).await.unwrap();
        let data = random(4096);
        nexus.write(0, data.clone()).await.unwrap();

        factory
            .memory_device("c0")
            .unwrap()
            .inject_fault(InjectedFault::persistent(IoType::Read, "c0"));
        for _ in 0..4 {
            assert_eq!(nexus.read(0, 4096).await.unwrap(), data);
        }
        assert_eq!(
            nexus.child_state(&uri("c0")).unwrap().fault_reason(),
            Some(FaultReason::IoError)
        );
    }

    #[tokio::test]
    async fn test_add_child_rebuilds_under_writes() {
        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(&factory, &["c0", "c1"], config()).await.unwrap();
        for i in 0..16 {
            nexus.write(i * 192 * 1024, random(8192)).await.unwrap();
        }
        factory.create(&uri("c2")).await.unwrap();
        factory.memory_device("c2").unwrap().set_io_delay(Some(Duration::from_millis(1)));

        let writer = {
            let nexus = Arc::clone(&nexus);
            tokio::spawn(async move {
                for i in 0..32u64 {
                    let offset = (i * 7919 * 512) % (SIZE - 4096);
                    nexus.write(offset, random(4096)).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let status = nexus.add_child(&uri("c2")).await.unwrap();
        assert_eq!(status, ChildStatus::OutOfSync);
        writer.await.unwrap();

        wait_until("c2 synced", || {
            nexus.child_status(&uri("c2")).unwrap() == ChildStatus::Online
        })
        .await;
        let c0 = factory.memory_device("c0").unwrap();
        let c2 = factory.memory_device("c2").unwrap();
        assert_eq!(c0.peek(0, SIZE), c2.peek(0, SIZE));

        let history = nexus.rebuild_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, RebuildState::Completed);
        assert_eq!(history[0].kind, crate::rebuild::RebuildKind::Full);
        assert!(history[0].stats.segments_skipped > 0);
        assert_eq!(
            nexus.rebuild_state(&uri("c2")).unwrap(),
            RebuildState::Completed
        );
    }

    #[tokio::test]
    async fn test_add_child_errors() {
        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(&factory, &["c0"], config()).await.unwrap();
        assert!(matches!(
            nexus.add_child(&uri("c0")).await,
            Err(NexusError::ChildExists { .. })
        ));

        // Too small: listed but config-invalid
        let small = "malloc:///small?size_mb=1".to_string();
        assert!(matches!(
            nexus.add_child(&small).await,
            Err(NexusError::ChildIncompatible { .. })
        ));
        assert_eq!(
            nexus.child_status(&small).unwrap(),
            ChildStatus::ConfigInvalid
        );
        nexus.remove_child(&small).await.unwrap();
        assert_eq!(nexus.children().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_online_partial_rebuild() {
        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(&factory, &["c0", "c1"], config()).await.unwrap();
        nexus.write(0, random(65536)).await.unwrap();

        nexus.offline_child(&uri("c1"), false).await.unwrap();
        assert_eq!(
            nexus.child_state(&uri("c1")).unwrap().fault_reason(),
            Some(FaultReason::Offline)
        );
        let missed = random(65536);
        nexus.write(1024 * 1024, missed.clone()).await.unwrap();

        nexus.online_child(&uri("c1")).await.unwrap();
        wait_until("c1 synced", || {
            nexus.child_status(&uri("c1")).unwrap() == ChildStatus::Online
        })
        .await;

        let record = nexus.rebuild_history().pop().unwrap();
        assert_eq!(record.kind, crate::rebuild::RebuildKind::Partial);
        assert_eq!(record.stats.segments_total, 1);
        let c1 = factory.memory_device("c1").unwrap();
        assert_eq!(c1.peek(1024 * 1024, 65536), missed);
        assert_eq!(nexus.status(), NexusStatus::Online);
    }

    #[tokio::test]
    async fn test_offline_permanent_and_last_child() {
        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(&factory, &["c0", "c1"], config()).await.unwrap();
        nexus.offline_child(&uri("c1"), true).await.unwrap();
        assert!(nexus.online_child(&uri("c1")).await.is_err());
        assert!(matches!(
            nexus.offline_child(&uri("c0"), false).await,
            Err(NexusError::LastHealthyChild { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_child() {
        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(&factory, &["c0", "c1"], config()).await.unwrap();
        nexus.remove_child(&uri("c1")).await.unwrap();
        assert_eq!(nexus.child_uris(), vec![uri("c0")]);
        assert!(factory.memory_device("c1").is_none());
        assert!(matches!(
            nexus.remove_child(&uri("c1")).await,
            Err(NexusError::ChildNotFound { .. })
        ));
        assert!(matches!(
            nexus.remove_child(&uri("c0")).await,
            Err(NexusError::LastHealthyChild { .. })
        ));
        nexus.write(0, random(512)).await.unwrap();
    }

    #[tokio::test]
    async fn test_device_removal_faults_child() {
        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(&factory, &["c0", "c1"], config()).await.unwrap();
        factory.memory_device("c1").unwrap().remove();
        wait_until("c1 faulted", || {
            nexus.child_status(&uri("c1")).unwrap() == ChildStatus::Faulted
        })
        .await;
        assert_eq!(
            nexus.child_state(&uri("c1")).unwrap().fault_reason(),
            Some(FaultReason::CantOpen)
        );
        nexus.write(0, random(512)).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_loop_brings_child_back() {
        let factory = Arc::new(UriDeviceFactory::new());
        let config = NexusConfig {
            reconnect_interval_ms: 20,
            ..config()
        };
        let nexus = create(&factory, &["c0", "c1"], config).await.unwrap();
        let c1 = factory.memory_device("c1").unwrap();
        c1.inject_fault(InjectedFault::persistent(IoType::Write, "c1"));
        let data = random(4096);
        nexus.write(8192, data.clone()).await.unwrap();
        assert_eq!(nexus.status(), NexusStatus::Degraded);

        c1.clear_faults();
        wait_until("c1 reconnected", || nexus.status() == NexusStatus::Online).await;
        assert_eq!(c1.peek(8192, 4096), data);
    }

    #[tokio::test]
    async fn test_failed_rebuild_is_not_retried() {
        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(&factory, &["c0"], config()).await.unwrap();
        nexus.write(0, random(65536)).await.unwrap();
        factory.create(&uri("c1")).await.unwrap();
        factory
            .memory_device("c1")
            .unwrap()
            .inject_fault(InjectedFault::persistent(IoType::Write, "c1"));

        nexus.add_child(&uri("c1")).await.unwrap();
        wait_until("rebuild failed", || !nexus.rebuild_history().is_empty()).await;
        assert_eq!(
            nexus.rebuild_state(&uri("c1")).unwrap(),
            RebuildState::Failed
        );
        assert_eq!(
            nexus.child_state(&uri("c1")).unwrap().fault_reason(),
            Some(FaultReason::RebuildFailed)
        );
        assert_eq!(nexus.reconnect_faulted_children().await, 1);
        assert!(nexus.rebuild_job(&uri("c1")).is_none());
        assert_eq!(
            nexus.child_status(&uri("c1")).unwrap(),
            ChildStatus::OutOfSync
        );
        assert!(nexus.child(&uri("c1")).unwrap().rebuild_failed());
    }

    #[tokio::test]
    async fn test_source_failure_is_not_retried() {
        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(&factory, &["c0", "c1"], config()).await.unwrap();
        nexus.write(0, random(65536)).await.unwrap();
        factory.memory_device("c0").unwrap().inject_fault(InjectedFault::times(
            IoType::Read,
            DeviceError::TimedOut("c0".into()),
            1,
        ));

        factory.create(&uri("c2")).await.unwrap();
        nexus.add_child(&uri("c2")).await.unwrap();
        wait_until("rebuild failed", || !nexus.rebuild_history().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let history = nexus.rebuild_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].source, uri("c0"));
        assert_eq!(history[0].state, RebuildState::Failed);
        assert!(nexus.rebuild_job(&uri("c2")).is_none());
        assert_eq!(
            nexus.child_state(&uri("c0")).unwrap().fault_reason(),
            Some(FaultReason::TimedOut)
        );
        assert_eq!(
            nexus.child_status(&uri("c2")).unwrap(),
            ChildStatus::OutOfSync
        );
        assert!(nexus.child(&uri("c2")).unwrap().rebuild_failed());

        // The source comes back, the failed destination still waits
        assert_eq!(nexus.reconnect_faulted_children().await, 1);
        assert!(nexus.rebuild_job(&uri("c2")).is_none());
        assert!(
            nexus
                .rebuild_history()
                .iter()
                .all(|r| r.destination != uri("c2") || r.state == RebuildState::Failed)
        );
    }

    #[tokio::test]
    async fn test_destination_fault_mid_rebuild_is_not_retried() {
        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(&factory, &["c0"], config()).await.unwrap();
        nexus.write(0, random(SIZE as usize)).await.unwrap();
        factory.create(&uri("c1")).await.unwrap();
        let c1 = factory.memory_device("c1").unwrap();
        c1.set_io_delay(Some(Duration::from_millis(50)));

        nexus.add_child(&uri("c1")).await.unwrap();
        let job = nexus.rebuild_job(&uri("c1")).unwrap();
        wait_until("rebuild running", || job.state() == RebuildState::Running).await;

        // An application write fails on the destination while it rebuilds
        let tail = SIZE - 4096;
        c1.inject_fault(InjectedFault::persistent(IoType::Write, "c1").in_range(tail..SIZE));
        nexus.write(tail, random(4096)).await.unwrap();
        assert_eq!(job.wait().await, RebuildState::Failed);
        wait_until("job retired", || nexus.rebuild_job(&uri("c1")).is_none()).await;
        assert_eq!(nexus.child_status(&uri("c1")).unwrap(), ChildStatus::Faulted);

        c1.clear_faults();
        c1.set_io_delay(None);
        assert_eq!(nexus.reconnect_faulted_children().await, 1);
        assert!(nexus.rebuild_job(&uri("c1")).is_none());
        assert_eq!(
            nexus.child_status(&uri("c1")).unwrap(),
            ChildStatus::OutOfSync
        );
        assert_eq!(
            nexus.rebuild_state(&uri("c1")).unwrap(),
            RebuildState::Failed
        );

        // An explicit rebuild clears the failure
        let job = nexus.start_rebuild(&uri("c1")).await.unwrap();
        assert!(!nexus.child(&uri("c1")).unwrap().rebuild_failed());
        assert_eq!(job.wait().await, RebuildState::Completed);
        wait_until("c1 synced", || {
            nexus.child_status(&uri("c1")).unwrap() == ChildStatus::Online
        })
        .await;
        let c0 = factory.memory_device("c0").unwrap();
        assert_eq!(c0.peek(0, SIZE), c1.peek(0, SIZE));
    }

    #[tokio::test]
    async fn test_rebuild_controls() {
        let factory = Arc::new(UriDeviceFactory::new());
        let config = NexusConfig {
            auto_rebuild: false,
            ..config()
        };
        let nexus = create(&factory, &["c0"], config).await.unwrap();
        nexus.write(0, random(SIZE as usize)).await.unwrap();
        assert!(matches!(
            nexus.start_rebuild(&uri("c0")).await,
            Err(NexusError::RebuildNotNeeded { .. })
        ));

        factory.create(&uri("c1")).await.unwrap();
        factory
            .memory_device("c1")
            .unwrap()
            .set_io_delay(Some(Duration::from_millis(50)));
        nexus.add_child(&uri("c1")).await.unwrap();
        assert!(nexus.rebuild_job(&uri("c1")).is_none());

        let job = nexus.start_rebuild(&uri("c1")).await.unwrap();
        assert!(matches!(
            nexus.start_rebuild(&uri("c1")).await,
            Err(NexusError::RebuildExists { .. })
        ));
        wait_until("rebuild running", || job.state() == RebuildState::Running).await;
        nexus.pause_rebuild(&uri("c1")).unwrap();
        assert_eq!(
            nexus.rebuild_state(&uri("c1")).unwrap(),
            RebuildState::Paused
        );
        assert!(matches!(
            nexus.pause_rebuild(&uri("c1")),
            Err(NexusError::RebuildInvalidState { op: "pause", .. })
        ));
        nexus.resume_rebuild(&uri("c1")).unwrap();
        nexus.stop_rebuild(&uri("c1")).unwrap();
        assert_eq!(job.wait().await, RebuildState::Stopped);

        wait_until("job retired", || nexus.rebuild_job(&uri("c1")).is_none()).await;
        let state = nexus.child_state(&uri("c1")).unwrap();
        assert!(state.is_open());
        assert!(!state.rebuilding);
        assert!(matches!(
            nexus.stop_rebuild(&uri("c1")),
            Err(NexusError::RebuildNotFound { .. })
        ));
    }

    fn descriptor(name: &str, skip: bool) -> SnapshotDescriptor {
        SnapshotDescriptor {
            child_uri: uri(name),
            params: SnapshotParams {
                name: "snap".into(),
                entity_id: "vol0".into(),
                txn_id: "txn0".into(),
                snapshot_uuid: format!("{name}-snap"),
                create_time: Utc::now(),
            },
            skip,
        }
    }

    #[tokio::test]
    async fn test_snapshot_two_of_three() {
        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(&factory, &["c0", "c1", "c2"], config()).await.unwrap();
        let data = random(4096);
        nexus.write(0, data.clone()).await.unwrap();

        let result = nexus
            .create_snapshot(&[
                descriptor("c0", false),
                descriptor("c1", false),
                descriptor("c2", true),
            ])
            .await
            .unwrap();
        assert_eq!(result.replicas, 2);
        assert!(
            result
                .results
                .iter()
                .any(|r| r.child_uri == uri("c2") && r.outcome == ChildSnapshotOutcome::Skipped)
        );
        let c0 = factory.memory_device("c0").unwrap();
        assert_eq!(c0.read_snapshot("snap", 0, 4096).unwrap(), data);
        assert!(factory.memory_device("c2").unwrap().snapshot_names().is_empty());

        // I/O resumed
        nexus.write(0, random(4096)).await.unwrap();
    }

    fn reservation(key: u64) -> ReservationConfig {
        ReservationConfig {
            key,
            ..ReservationConfig::default()
        }
    }

    #[tokio::test]
    async fn test_takeover_shuts_down_previous_owner() {
        let factory = Arc::new(UriDeviceFactory::new());
        let a = create(
            &factory,
            &["c0", "c1"],
            NexusConfig {
                reservation: Some(reservation(0xA)),
                ..config()
            },
        )
        .await
        .unwrap();
        a.write(0, random(4096)).await.unwrap();
        let status = a.reservation_status().await.unwrap();
        assert!(status.owned);
        assert_eq!(status.held, 2);

        // Without the operator naming A's key, B cannot take over
        let b_config = NexusConfig {
            reservation: Some(reservation(0xB)),
            ..config()
        };
        assert!(matches!(
            create(&factory, &["c0", "c1"], b_config.clone()).await,
            Err(NexusError::NoHealthyChildren(_))
        ));

        let b = create(
            &factory,
            &["c0", "c1"],
            NexusConfig {
                reservation: Some(ReservationConfig {
                    preempt_key: Some(0xA),
                    ..reservation(0xB)
                }),
                ..b_config
            },
        )
        .await
        .unwrap();
        assert_eq!(
            factory.memory_device("c0").unwrap().reservation_holder(),
            Some(0xB)
        );

        assert!(a.write(0, random(4096)).await.is_err());
        wait_until("A shut down", || a.state() == NexusState::Shutdown).await;
        assert!(matches!(
            a.write(0, random(4096)).await,
            Err(NexusError::InvalidState { .. })
        ));

        b.write(0, random(4096)).await.unwrap();
        assert_eq!(b.status(), NexusStatus::Online);
    }

    #[tokio::test]
    async fn test_reconnect_never_preempts() {
        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(
            &factory,
            &["c0", "c1"],
            NexusConfig {
                reservation: Some(ReservationConfig {
                    preempt_key: Some(0xA),
                    ..reservation(0xB)
                }),
                ..config()
            },
        )
        .await
        .unwrap();
        let c1 = factory.memory_device("c1").unwrap();
        c1.inject_fault(InjectedFault::persistent(IoType::Write, "c1"));
        nexus.write(0, random(4096)).await.unwrap();
        assert_eq!(
            nexus.child_state(&uri("c1")).unwrap().fault_reason(),
            Some(FaultReason::IoError)
        );

        // The peer named by preempt_key takes c1 while it is out
        c1.clear_faults();
        let peer = c1.open(true).await.unwrap();
        peer.reservation_register(0xA).await.unwrap();
        peer.reservation_preempt(0xA, 0xB, ReservationPolicy::WriteExclusiveAllRegistrants)
            .await
            .unwrap();

        assert_eq!(nexus.reconnect_faulted_children().await, 0);
        assert_eq!(c1.reservation_holder(), Some(0xA));
        assert_eq!(
            nexus.child_state(&uri("c1")).unwrap().fault_reason(),
            Some(FaultReason::ReservationConflict)
        );
        assert!(nexus.online_child(&uri("c1")).await.is_err());
        assert_eq!(c1.reservation_holder(), Some(0xA));
    }

    #[tokio::test]
    async fn test_reservation_quorum() {
        let factory = Arc::new(UriDeviceFactory::new());
        let device = factory.create(&uri("c0")).await.unwrap();
        let foreign = device.open(true).await.unwrap();
        foreign.reservation_register(9).await.unwrap();
        foreign
            .reservation_acquire(9, ReservationPolicy::WriteExclusiveAllRegistrants)
            .await
            .unwrap();

        let config = NexusConfig {
            reservation: Some(ReservationConfig {
                quorum: ReservationQuorum::AtLeast(2),
                ..reservation(1)
            }),
            ..config()
        };
        match create(&factory, &["c0", "c1"], config).await {
            Err(NexusError::ReservationQuorum { held, required, .. }) => {
                assert_eq!(held, 1);
                assert_eq!(required, 2);
            }
            other => panic!("unexpected result {:?}", other.map(|n| n.name().to_string())),
        }
        // Nothing is left held by the failed nexus
        assert_eq!(factory.memory_device("c1").unwrap().reservation_holder(), None);
        assert_eq!(factory.memory_device("c0").unwrap().reservation_holder(), Some(9));
    }

    #[tokio::test]
    async fn test_shutdown_releases_and_close_keeps() {
        let factory = Arc::new(UriDeviceFactory::new());
        let config = NexusConfig {
            reservation: Some(reservation(3)),
            ..config()
        };
        let nexus = create(&factory, &["c0"], config.clone()).await.unwrap();
        nexus.close().await.unwrap();
        assert_eq!(nexus.state(), NexusState::Closed);
        assert_eq!(nexus.status(), NexusStatus::Faulted);
        assert_eq!(
            factory.memory_device("c0").unwrap().reservation_holder(),
            Some(3)
        );

        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(&factory, &["c0"], config).await.unwrap();
        nexus.write(0, random(512)).await.unwrap();
        nexus.shutdown().await.unwrap();
        assert_eq!(nexus.status(), NexusStatus::Shutdown);
        assert_eq!(
            factory.memory_device("c0").unwrap().reservation_holder(),
            None
        );
        assert!(nexus.read(0, 512).await.is_err());
        // Idempotent
        nexus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_info_serializes() {
        let factory = Arc::new(UriDeviceFactory::new());
        let nexus = create(&factory, &["c0", "c1"], config()).await.unwrap();
        let info = nexus.info();
        assert_eq!(info.children.len(), 2);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["status"], "online");
        assert_eq!(json["children"][0]["status"], "online");
    }
}
