#![allow(clippy::result_large_err)]
//! Nexio Nexus
//!
//! A nexus presents one virtual block device on top of several replicas
//! ("children"). Writes are mirrored to every healthy child and reads are
//! served by any one of them.
//!
//! # Features
//!
//! - **Child health tracking**: faults on the data path take a child out of
//!   service without failing the application request
//! - **Rebuild**: full or partial resynchronization of a child, with writes
//!   landing during the copy logged and replayed
//! - **Snapshots**: point-in-time snapshots across all replicas with I/O
//!   paused for the duration
//! - **Reservations**: persistent reservations keep two nexuses from
//!   writing the same replicas
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Application   │
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │      Nexus      │
//! │  - IoGate       │
//! │  - IoChannels   │
//! │  - RebuildJobs  │
//! └──┬─────┬─────┬──┘
//!    │     │     │
//! ┌──▼─┐ ┌─▼──┐ ┌▼───┐
//! │ C0 │ │ C1 │ │ C2 │  (children: local or remote devices)
//! └────┘ └────┘ └────┘
//! ```

pub mod channel;
pub mod child;
pub mod error;
pub mod gate;
pub mod manager;
pub mod metrics;
pub mod nexus;
pub mod rebuild;
pub mod reservation;
pub mod segment_map;
pub mod snapshot;

pub use channel::{IoChannel, LastError};
pub use child::{
    ChildInfo, ChildStateSnapshot, ChildStatus, DestroyState, FaultReason, NexusChild,
    OperationalState, SyncState,
};
pub use error::{NexusError, NexusResult};
pub use gate::{IoGate, IoPermit, PauseGuard};
pub use manager::NexusManager;
pub use metrics::{ChildMetrics, MetricsCollector, NexusMetrics, PrometheusExporter};
pub use nexus::{
    ChildIoStats, ChildReservation, Nexus, NexusInfo, NexusState, NexusStats, NexusStatus,
    ReservationStatus,
};
pub use rebuild::{
    RebuildError, RebuildHistory, RebuildJob, RebuildKind, RebuildRecord, RebuildState,
    RebuildStats,
};
pub use reservation::ReservationToken;
pub use segment_map::SegmentMap;
pub use snapshot::{
    ChildSnapshotOutcome, ChildSnapshotResult, NexusSnapshotResult, SnapshotDescriptor,
};
