//! Nexio Device
//!
//! The device layer consumed by the replication engine: an async handle
//! abstraction over block backends, their error taxonomy and I/O counters,
//! plus a memory and a file backend resolved from URIs.

pub mod device;
pub mod error;
pub mod factory;
pub mod file;
pub mod memory;
pub mod stats;

pub use device::{
    BlockDevice, DeviceCapabilities, DeviceEvent, DeviceGeometry, DeviceHandle, ReadMode,
    ReadOutcome, ReservationReport,
};
pub use error::{DeviceError, DeviceResult};
pub use factory::{DeviceFactory, UriDeviceFactory};
pub use file::FileDevice;
pub use memory::{InjectedFault, MemoryDevice};
pub use stats::{IoStats, IoStatsSnapshot, IoType, LatencyHistogram, LatencySummary};
