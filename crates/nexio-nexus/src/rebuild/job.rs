//! Rebuild job

use super::{RebuildError, RebuildKind, RebuildRecord, RebuildState, RebuildStats};
use crate::gate::IoGate;
use crate::segment_map::SegmentMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use nexio_common::RebuildConfig;
use nexio_device::{DeviceHandle, ReadMode, ReadOutcome};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Bulk,
    Replay,
    /// Replay with application I/O paused; ignores job pause
    Final,
}

enum SegmentOutcome {
    Copied(u64),
    Skipped,
    Abandoned,
}

#[derive(Default)]
struct Counters {
    transferred: AtomicU64,
    skipped: AtomicU64,
    replayed: AtomicU64,
    bytes: AtomicU64,
}

/// One rebuild from `source` to `destination`
pub struct RebuildJob {
    id: Uuid,
    nexus: String,
    source_uri: String,
    destination_uri: String,
    source: Arc<dyn DeviceHandle>,
    destination: Arc<dyn DeviceHandle>,
    kind: RebuildKind,
    size_bytes: u64,
    segment_size: u64,
    config: RebuildConfig,
    /// Segments to copy for a partial rebuild
    bitmap: Option<SegmentMap>,
    /// Writes landing during the rebuild
    log: Arc<SegmentMap>,
    read_mode: ReadMode,
    state: watch::Sender<RebuildState>,
    /// Set on the first segment error; unstarted segments are abandoned
    aborting: AtomicBool,
    segments_total: u64,
    counters: Counters,
    error: Mutex<Option<String>>,
    /// Typed cause when the job failed on its own I/O
    failure: Mutex<Option<RebuildError>>,
    started_at: DateTime<Utc>,
    ended_at: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for RebuildJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Rebuild '{}' {} -> {} [{} {}]",
            self.nexus,
            self.source_uri,
            self.destination_uri,
            self.kind,
            self.state()
        )
    }
}

impl RebuildJob {
    /// Create a job over `[0, size_bytes)`.
    ///
    /// `bitmap = None` selects a full rebuild. `segment_size` must be a
    /// multiple of both devices' block size.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nexus: impl Into<String>,
        source_uri: impl Into<String>,
        source: Arc<dyn DeviceHandle>,
        destination_uri: impl Into<String>,
        destination: Arc<dyn DeviceHandle>,
        size_bytes: u64,
        segment_size: u64,
        config: RebuildConfig,
        bitmap: Option<SegmentMap>,
    ) -> Self {
        let kind = if bitmap.is_some() {
            RebuildKind::Partial
        } else {
            RebuildKind::Full
        };
        let segments_total = bitmap
            .as_ref()
            .map_or_else(|| size_bytes.div_ceil(segment_size), SegmentMap::count);
        // Sources that cannot tell unwritten from zeroes are copied in full
        let read_mode = if source.capabilities().reports_unwritten {
            ReadMode::UnwrittenAsStatus
        } else {
            ReadMode::Normal
        };
        let (state, _) = watch::channel(RebuildState::Init);
        Self {
            id: Uuid::new_v4(),
            nexus: nexus.into(),
            source_uri: source_uri.into(),
            destination_uri: destination_uri.into(),
            source,
            destination,
            kind,
            size_bytes,
            segment_size,
            config,
            bitmap,
            log: Arc::new(SegmentMap::new(size_bytes, segment_size)),
            read_mode,
            state,
            aborting: AtomicBool::new(false),
            segments_total,
            counters: Counters::default(),
            error: Mutex::new(None),
            failure: Mutex::new(None),
            started_at: Utc::now(),
            ended_at: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> RebuildKind {
        self.kind
    }

    pub fn source_uri(&self) -> &str {
        &self.source_uri
    }

    pub fn destination_uri(&self) -> &str {
        &self.destination_uri
    }

    pub fn read_mode(&self) -> ReadMode {
        self.read_mode
    }

    /// Write-interception log fed by the I/O channels
    pub fn log(&self) -> &Arc<SegmentMap> {
        &self.log
    }

    pub fn state(&self) -> RebuildState {
        *self.state.borrow()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Device failure that ended the job; `None` when aborted from outside
    pub fn failure(&self) -> Option<RebuildError> {
        self.failure.lock().clone()
    }

    /// Move `from` -> `to` if the job is in one of `from`
    fn transition(&self, from: &[RebuildState], to: RebuildState) -> Result<(), RebuildState> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                result = Err(*state);
                false
            }
        });
        result
    }

    pub fn pause(&self) -> Result<(), RebuildState> {
        self.transition(&[RebuildState::Running], RebuildState::Paused)?;
        info!("{:?}: paused", self);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), RebuildState> {
        self.transition(&[RebuildState::Paused], RebuildState::Running)?;
        info!("{:?}: resumed", self);
        Ok(())
    }

    /// Cooperative stop: in-flight segments finish, no new ones start
    pub fn stop(&self) -> Result<(), RebuildState> {
        self.transition(
            &[RebuildState::Init, RebuildState::Running, RebuildState::Paused],
            RebuildState::Stopped,
        )?;
        info!("{:?}: stopping", self);
        Ok(())
    }

    /// Abort from outside, e.g. when the source child faults
    pub fn fail(&self, reason: impl Into<String>) -> Result<(), RebuildState> {
        let reason = reason.into();
        self.transition(
            &[RebuildState::Init, RebuildState::Running, RebuildState::Paused],
            RebuildState::Failed,
        )?;
        warn!("{:?}: aborted: {}", self, reason);
        *self.error.lock() = Some(reason);
        Ok(())
    }

    /// Wait for the job to reach a terminal state
    pub async fn wait(&self) -> RebuildState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(RebuildState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    pub fn stats(&self) -> RebuildStats {
        let transferred = self.counters.transferred.load(Ordering::Relaxed);
        let skipped = self.counters.skipped.load(Ordering::Relaxed);
        let done = transferred + skipped;
        let progress = if self.segments_total == 0 {
            100
        } else {
            (done * 100 / self.segments_total).min(100) as u8
        };
        RebuildStats {
            segments_total: self.segments_total,
            segments_transferred: transferred,
            segments_skipped: skipped,
            segments_replayed: self.counters.replayed.load(Ordering::Relaxed),
            bytes_transferred: self.counters.bytes.load(Ordering::Relaxed),
            progress,
        }
    }

    pub fn record(&self) -> RebuildRecord {
        RebuildRecord {
            job_id: self.id,
            source: self.source_uri.clone(),
            destination: self.destination_uri.clone(),
            kind: self.kind,
            state: self.state(),
            stats: self.stats(),
            started_at: self.started_at,
            ended_at: *self.ended_at.lock(),
            error: self.error(),
        }
    }

    /// Run the job to a terminal state.
    ///
    /// `finalize` runs once, with application I/O paused through `gate`,
    /// right after the last replay pass; it publishes the destination as
    /// synced.
    pub async fn run<F>(&self, gate: &IoGate, finalize: F) -> RebuildState
    where
        F: FnOnce() + Send,
    {
        if let Err(state) = self.transition(&[RebuildState::Init], RebuildState::Running) {
            return state;
        }
        info!(
            "{:?}: starting, {} segments of {} bytes",
            self, self.segments_total, self.segment_size
        );

        match self.run_passes(gate, finalize).await {
            Ok(true) => {
                let stats = self.stats();
                info!(
                    "{:?}: completed, {} transferred, {} skipped, {} replayed",
                    self, stats.segments_transferred, stats.segments_skipped, stats.segments_replayed
                );
            }
            Ok(false) => {
                info!("{:?}: ended early", self);
            }
            Err(e) => {
                error!("{:?}: failed: {}", self, e);
                if self.transition(
                    &[RebuildState::Running, RebuildState::Paused],
                    RebuildState::Failed,
                )
                .is_ok()
                {
                    *self.error.lock() = Some(e.to_string());
                    *self.failure.lock() = Some(e);
                }
            }
        }
        *self.ended_at.lock() = Some(Utc::now());
        self.state()
    }

    /// Returns `Ok(false)` when stopped or failed from outside
    async fn run_passes<F>(&self, gate: &IoGate, finalize: F) -> Result<bool, RebuildError>
    where
        F: FnOnce() + Send,
    {
        let segments = match self.bitmap {
            Some(ref bitmap) => bitmap.segments(),
            None => (0..self.size_bytes.div_ceil(self.segment_size)).collect(),
        };
        if !self.copy_segments(segments, Pass::Bulk).await? {
            return Ok(false);
        }

        for pass in 1..=self.config.max_replay_passes {
            let dirty = self.log.take();
            if dirty.is_empty() {
                break;
            }
            debug!("{:?}: replay pass {}, {} segments", self, pass, dirty.len());
            if !self.copy_segments(dirty, Pass::Replay).await? {
                return Ok(false);
            }
        }

        let _pause = gate.pause().await;
        let dirty = self.log.take();
        debug!("{:?}: final replay, {} segments", self, dirty.len());
        if !self.copy_segments(dirty, Pass::Final).await? {
            return Ok(false);
        }
        if self
            .transition(
                &[RebuildState::Running, RebuildState::Paused],
                RebuildState::Completed,
            )
            .is_err()
        {
            return Ok(false);
        }
        finalize();
        Ok(true)
    }

    /// Copy `segments` with bounded concurrency.
    ///
    /// Every started segment runs to completion; after a failure or a
    /// stop the remaining ones are abandoned.
    async fn copy_segments(&self, segments: Vec<u64>, pass: Pass) -> Result<bool, RebuildError> {
        let mut results = stream::iter(segments)
            .map(|segment| self.process_segment(segment, pass))
            .buffer_unordered(self.config.max_concurrent_segments.max(1));

        let mut failure = None;
        while let Some(result) = results.next().await {
            match result {
                Ok(SegmentOutcome::Copied(bytes)) => {
                    self.counters.bytes.fetch_add(bytes, Ordering::Relaxed);
                    let counter = if pass == Pass::Bulk {
                        &self.counters.transferred
                    } else {
                        &self.counters.replayed
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                Ok(SegmentOutcome::Skipped) => {
                    if pass == Pass::Bulk {
                        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(SegmentOutcome::Abandoned) => {}
                Err(e) => {
                    self.aborting.store(true, Ordering::SeqCst);
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        Ok(matches!(
            self.state(),
            RebuildState::Running | RebuildState::Paused
        ))
    }

    /// Wait out a pause; false when the job should not start new work
    async fn runnable(&self, pass: Pass) -> bool {
        if self.aborting.load(Ordering::SeqCst) {
            return false;
        }
        let mut rx = self.state.subscribe();
        let state = match rx
            .wait_for(|state| pass == Pass::Final || *state != RebuildState::Paused)
            .await
        {
            Ok(state) => *state,
            Err(_) => return false,
        };
        matches!(state, RebuildState::Running | RebuildState::Paused)
            && !self.aborting.load(Ordering::SeqCst)
    }

    async fn process_segment(&self, segment: u64, pass: Pass) -> Result<SegmentOutcome, RebuildError> {
        if !self.runnable(pass).await {
            return Ok(SegmentOutcome::Abandoned);
        }
        let offset = segment * self.segment_size;
        let length = self.segment_size.min(self.size_bytes - offset);

        let outcome = self
            .source
            .read(offset, length, self.read_mode)
            .await
            .map_err(|source| RebuildError::Source {
                uri: self.source_uri.clone(),
                source,
            })?;

        match outcome {
            ReadOutcome::Unwritten => {
                self.zero_destination(offset, length).await?;
                Ok(SegmentOutcome::Skipped)
            }
            ReadOutcome::Data(data) => {
                self.destination
                    .write(offset, data.clone())
                    .await
                    .map_err(|source| self.destination_error(source))?;
                if self.config.verify {
                    self.verify(offset, &data).await?;
                }
                Ok(SegmentOutcome::Copied(length))
            }
        }
    }

    /// Make an unwritten source segment read back as zeroes on the
    /// destination, issuing nothing when it already is unwritten there.
    async fn zero_destination(&self, offset: u64, length: u64) -> Result<(), RebuildError> {
        let capabilities = self.destination.capabilities();
        if capabilities.reports_unwritten {
            let current = self
                .destination
                .read(offset, length, ReadMode::UnwrittenAsStatus)
                .await
                .map_err(|source| self.destination_error(source))?;
            if current.is_unwritten() {
                return Ok(());
            }
        }
        let result = if capabilities.write_zeroes {
            self.destination.write_zeroes(offset, length).await
        } else {
            self.destination
                .write(offset, Bytes::from(vec![0u8; length as usize]))
                .await
        };
        result.map_err(|source| self.destination_error(source))
    }

    async fn verify(&self, offset: u64, expected: &Bytes) -> Result<(), RebuildError> {
        let written = self
            .destination
            .read(offset, expected.len() as u64, ReadMode::Normal)
            .await
            .map_err(|source| self.destination_error(source))?
            .into_bytes(expected.len() as u64);
        if crc32c::crc32c(&written) != crc32c::crc32c(expected) {
            return Err(RebuildError::VerifyMismatch {
                uri: self.destination_uri.clone(),
                offset,
            });
        }
        Ok(())
    }

    fn destination_error(&self, source: nexio_device::DeviceError) -> RebuildError {
        RebuildError::Destination {
            uri: self.destination_uri.clone(),
            source,
        }
    }
}
