//! Per-context I/O channels
//!
//! A channel holds the working sets derived from the child list: writers,
//! readers and detached children. The nexus rebuilds the sets on every child
//! transition and swaps them in whole; a request binds to the sets it loaded
//! at dispatch and completes against them.
//!
//! Writes are broadcast to every writer. A partial failure faults the failed
//! children and resubmits against the reduced set. Reads go to one reader
//! picked round-robin and fail over to the next one.

use crate::child::{DestroyState, FaultReason, NexusChild};
use crate::error::{NexusError, NexusResult};
use crate::segment_map::SegmentMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use nexio_device::{DeviceError, DeviceHandle, DeviceResult, IoStats, IoType, ReadMode};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Notification from the data path to the nexus control loop
#[derive(Debug)]
pub(crate) enum NexusEvent {
    /// A child failed a command or its device went away
    ChildFault {
        uri: String,
        reason: FaultReason,
        error: Option<DeviceError>,
        /// Signalled once the fault is applied and channels are reconnected
        ack: Option<oneshot::Sender<()>>,
    },
}

/// Most recent child failure seen by the nexus
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub child: String,
    pub reason: Option<FaultReason>,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// State shared by every channel of one nexus
pub(crate) struct ChannelContext {
    pub nexus: String,
    pub events: mpsc::UnboundedSender<NexusEvent>,
    pub last_error: RwLock<Option<LastError>>,
    pub max_write_retries: u32,
    pub stats: IoStats,
}

impl ChannelContext {
    pub fn set_last_error(&self, child: &str, reason: Option<FaultReason>, error: String) {
        *self.last_error.write() = Some(LastError {
            child: child.to_string(),
            reason,
            error,
            at: Utc::now(),
        });
    }
}

/// A child bound to the handle it had when the sets were built
#[derive(Clone)]
pub(crate) struct ChildIo {
    pub child: Arc<NexusChild>,
    pub handle: Arc<dyn DeviceHandle>,
}

/// Participant sets of one channel generation
#[derive(Default)]
pub(crate) struct ChannelSets {
    pub generation: u64,
    pub writers: Vec<ChildIo>,
    pub readers: Vec<ChildIo>,
    /// Children being removed, kept until their I/O drains
    pub detached: Vec<ChildIo>,
    /// Write logs fed by every completed write
    pub loggers: Vec<Arc<SegmentMap>>,
}

impl ChannelSets {
    /// Derive the sets from the current child states
    pub fn build(
        generation: u64,
        children: &[Arc<NexusChild>],
        loggers: Vec<Arc<SegmentMap>>,
    ) -> Self {
        let mut sets = Self {
            generation,
            loggers,
            ..Self::default()
        };
        for child in children {
            let Some(handle) = child.handle() else {
                continue;
            };
            let state = child.state();
            let io = ChildIo {
                child: Arc::clone(child),
                handle,
            };
            if state.destroy == DestroyState::Destroying {
                sets.detached.push(io);
                continue;
            }
            if state.is_read_eligible() {
                sets.readers.push(io.clone());
            }
            if state.is_write_eligible() {
                sets.writers.push(io);
            }
        }
        sets
    }
}

/// Mutating command broadcast to the writers
#[derive(Debug, Clone)]
pub(crate) enum WriteOp {
    Write { offset: u64, data: Bytes },
    Unmap { offset: u64, length: u64 },
    WriteZeroes { offset: u64, length: u64 },
    Flush,
}

impl WriteOp {
    fn io_type(&self) -> IoType {
        match self {
            WriteOp::Write { .. } => IoType::Write,
            WriteOp::Unmap { .. } => IoType::Unmap,
            WriteOp::WriteZeroes { .. } => IoType::WriteZeroes,
            WriteOp::Flush => IoType::Flush,
        }
    }

    /// Byte range changed by the command
    fn range(&self) -> Option<(u64, u64)> {
        match *self {
            WriteOp::Write { offset, ref data } => Some((offset, data.len() as u64)),
            WriteOp::Unmap { offset, length } | WriteOp::WriteZeroes { offset, length } => {
                Some((offset, length))
            }
            WriteOp::Flush => None,
        }
    }

    /// Issue the command, falling back when the child lacks a capability.
    ///
    /// Unmap becomes write-zeroes and write-zeroes becomes a zero buffer so
    /// every replica reads back the same.
    async fn submit(&self, handle: &dyn DeviceHandle) -> DeviceResult<()> {
        let capabilities = handle.capabilities();
        match *self {
            WriteOp::Write { offset, ref data } => handle.write(offset, data.clone()).await,
            WriteOp::Unmap { offset, length } if capabilities.unmap => {
                handle.unmap(offset, length).await
            }
            WriteOp::Unmap { offset, length } | WriteOp::WriteZeroes { offset, length }
                if capabilities.write_zeroes =>
            {
                handle.write_zeroes(offset, length).await
            }
            WriteOp::Unmap { offset, length } | WriteOp::WriteZeroes { offset, length } => {
                handle
                    .write(offset, Bytes::from(vec![0u8; length as usize]))
                    .await
            }
            WriteOp::Flush => handle.flush().await,
        }
    }
}

/// Dispatcher for one execution context
pub struct IoChannel {
    id: usize,
    ctx: Arc<ChannelContext>,
    sets: RwLock<Arc<ChannelSets>>,
    /// Round-robin position in the reader set
    cursor: AtomicUsize,
}

impl IoChannel {
    pub(crate) fn new(id: usize, ctx: Arc<ChannelContext>) -> Self {
        Self {
            id,
            ctx,
            sets: RwLock::new(Arc::new(ChannelSets::default())),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn sets(&self) -> Arc<ChannelSets> {
        Arc::clone(&self.sets.read())
    }

    /// Install new sets unless a newer generation is already in place
    pub(crate) fn reconnect(&self, sets: Arc<ChannelSets>) {
        let mut current = self.sets.write();
        if sets.generation >= current.generation {
            *current = sets;
        }
    }

    pub fn generation(&self) -> u64 {
        self.sets.read().generation
    }

    /// URIs of the current writers
    pub fn writers(&self) -> Vec<String> {
        self.sets()
            .writers
            .iter()
            .map(|w| w.child.uri().to_string())
            .collect()
    }

    /// URIs of the current readers
    pub fn readers(&self) -> Vec<String> {
        self.sets()
            .readers
            .iter()
            .map(|r| r.child.uri().to_string())
            .collect()
    }

    /// Read `length` bytes at `offset` from one reader
    pub(crate) async fn read(&self, offset: u64, length: u64) -> NexusResult<Bytes> {
        let started = Instant::now();
        let sets = self.sets();
        let count = sets.readers.len();
        if count == 0 {
            return Err(NexusError::NoReaders(self.ctx.nexus.clone()));
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        let mut last_error = None;
        for i in 0..count {
            let reader = &sets.readers[(start + i) % count];
            // May have faulted since the sets were built
            if !reader.child.state().is_read_eligible() {
                continue;
            }
            let result = {
                let _tracked = reader.child.track();
                reader.handle.read(offset, length, ReadMode::Normal).await
            };
            match result {
                Ok(outcome) => {
                    self.ctx.stats.record(IoType::Read, length, started);
                    return Ok(outcome.into_bytes(length));
                }
                Err(error) if error.is_request_error() => {
                    self.ctx.stats.record_error();
                    return Err(error.into());
                }
                Err(error) => {
                    warn!(
                        "{}: read of {} bytes at {} failed on {}: {}",
                        self.ctx.nexus,
                        length,
                        offset,
                        reader.child.uri(),
                        error
                    );
                    self.fault_child(&reader.child, &error).await;
                    last_error = Some(error);
                }
            }
        }

        self.ctx.stats.record_error();
        match last_error {
            Some(error) => {
                self.ctx
                    .set_last_error(&self.ctx.nexus, None, format!("all readers failed: {error}"));
                Err(error.into())
            }
            None => Err(NexusError::NoReaders(self.ctx.nexus.clone())),
        }
    }

    /// Broadcast a mutating command to every writer
    pub(crate) async fn write(&self, op: WriteOp) -> NexusResult<()> {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let sets = self.sets();
            if sets.writers.is_empty() {
                self.ctx.stats.record_error();
                return Err(NexusError::NoWriters(self.ctx.nexus.clone()));
            }

            let results = join_all(sets.writers.iter().map(|writer| {
                let op = &op;
                async move {
                    let _tracked = writer.child.track();
                    (writer, op.submit(writer.handle.as_ref()).await)
                }
            }))
            .await;

            let mut succeeded = 0;
            let mut failed = Vec::new();
            for (writer, result) in results {
                match result {
                    Ok(()) => succeeded += 1,
                    Err(error) if error.is_request_error() => {
                        self.ctx.stats.record_error();
                        return Err(error.into());
                    }
                    Err(error) => failed.push((writer, error)),
                }
            }

            if failed.is_empty() {
                self.complete(&op, started);
                return Ok(());
            }

            for (writer, error) in &failed {
                warn!(
                    "{}: {} failed on {}: {}",
                    self.ctx.nexus,
                    op.io_type().as_str(),
                    writer.child.uri(),
                    error
                );
                self.fault_child(&writer.child, error).await;
            }

            if succeeded == 0 {
                self.ctx.stats.record_error();
                let (writer, error) = failed.swap_remove(0);
                self.ctx.set_last_error(
                    writer.child.uri(),
                    FaultReason::from_device_error(&error),
                    format!("{} failed on every writer: {error}", op.io_type().as_str()),
                );
                return Err(error.into());
            }

            if attempt >= self.ctx.max_write_retries {
                // Failed children are faulted and out of the writer set
                self.complete(&op, started);
                return Ok(());
            }
            attempt += 1;
            debug!(
                "{}: resubmitting {} (attempt {})",
                self.ctx.nexus,
                op.io_type().as_str(),
                attempt
            );
        }
    }

    /// Record a successful write in the write logs and stats
    fn complete(&self, op: &WriteOp, started: Instant) {
        if let Some((offset, length)) = op.range() {
            // Load the latest sets: a fault log attached during this
            // request must see it
            for log in &self.sets().loggers {
                log.mark_range(offset, length);
            }
            self.ctx.stats.record(op.io_type(), length, started);
        } else {
            self.ctx.stats.record(op.io_type(), 0, started);
        }
    }

    /// Report a failed child and wait until the nexus has applied the fault
    async fn fault_child(&self, child: &NexusChild, error: &DeviceError) {
        let Some(reason) = FaultReason::from_device_error(error) else {
            return;
        };
        let (ack, done) = oneshot::channel();
        let event = NexusEvent::ChildFault {
            uri: child.uri().to_string(),
            reason,
            error: Some(error.clone()),
            ack: Some(ack),
        };
        if self.ctx.events.send(event).is_ok() {
            // Dropped acks mean the nexus is gone; nothing left to wait for
            let _ = done.await;
        }
    }
}
