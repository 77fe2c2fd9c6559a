//! Per-device I/O statistics
//!
//! Lock-free counters updated on every completed command, plus logarithmic
//! latency histograms for read and write percentiles.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Kind of command counted in [`IoStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IoType {
    Read,
    Write,
    Unmap,
    WriteZeroes,
    Flush,
}

impl IoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IoType::Read => "read",
            IoType::Write => "write",
            IoType::Unmap => "unmap",
            IoType::WriteZeroes => "write_zeroes",
            IoType::Flush => "flush",
        }
    }

    /// Whether the command mutates the device
    pub fn is_write(&self) -> bool {
        !matches!(self, IoType::Read)
    }
}

/// Bucket upper bounds in microseconds; the last bucket is open-ended.
const BUCKET_BOUNDARIES_US: [u64; 12] = [
    10,
    50,
    100,
    250,
    500,
    1_000,
    2_500,
    5_000,
    10_000,
    50_000,
    250_000,
    u64::MAX,
];

/// Latency histogram with fixed logarithmic buckets
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; 12],
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Record a latency sample in microseconds
    pub fn record(&self, latency_us: u64) {
        let idx = BUCKET_BOUNDARIES_US
            .iter()
            .position(|&boundary| latency_us < boundary)
            .unwrap_or(BUCKET_BOUNDARIES_US.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(latency_us, Ordering::Relaxed);
        self.max.fetch_max(latency_us, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Upper bound of the bucket holding the given percentile (0.0 - 1.0)
    pub fn percentile(&self, percentile: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }
        let target = ((total as f64) * percentile).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                // Open-ended bucket reports the observed maximum
                if i == BUCKET_BOUNDARIES_US.len() - 1 {
                    return self.max.load(Ordering::Relaxed);
                }
                return BUCKET_BOUNDARIES_US[i];
            }
        }
        self.max.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LatencySummary {
        let count = self.count();
        LatencySummary {
            avg_us: if count == 0 {
                0
            } else {
                self.sum.load(Ordering::Relaxed) / count
            },
            max_us: self.max.load(Ordering::Relaxed),
            p50_us: self.percentile(0.50),
            p99_us: self.percentile(0.99),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency summary in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub avg_us: u64,
    pub max_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
}

/// Live I/O counters for one device or handle
#[derive(Debug, Default)]
pub struct IoStats {
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    unmap_ops: AtomicU64,
    write_zeroes_ops: AtomicU64,
    flush_ops: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    errors: AtomicU64,
    read_latency: LatencyHistogram,
    write_latency: LatencyHistogram,
}

impl IoStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed command
    pub fn record(&self, io_type: IoType, bytes: u64, started: Instant) {
        let latency_us = started.elapsed().as_micros() as u64;
        match io_type {
            IoType::Read => {
                self.read_ops.fetch_add(1, Ordering::Relaxed);
                self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
                self.read_latency.record(latency_us);
            }
            IoType::Write => {
                self.write_ops.fetch_add(1, Ordering::Relaxed);
                self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
                self.write_latency.record(latency_us);
            }
            IoType::Unmap => {
                self.unmap_ops.fetch_add(1, Ordering::Relaxed);
            }
            IoType::WriteZeroes => {
                self.write_zeroes_ops.fetch_add(1, Ordering::Relaxed);
            }
            IoType::Flush => {
                self.flush_ops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record a failed command
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            read_ops: self.read_ops.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            unmap_ops: self.unmap_ops.load(Ordering::Relaxed),
            write_zeroes_ops: self.write_zeroes_ops.load(Ordering::Relaxed),
            flush_ops: self.flush_ops.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            read_latency: self.read_latency.snapshot(),
            write_latency: self.write_latency.snapshot(),
        }
    }
}

/// Point-in-time copy of [`IoStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoStatsSnapshot {
    pub read_ops: u64,
    pub write_ops: u64,
    pub unmap_ops: u64,
    pub write_zeroes_ops: u64,
    pub flush_ops: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub errors: u64,
    pub read_latency: LatencySummary,
    pub write_latency: LatencySummary,
}

impl IoStatsSnapshot {
    /// Sum two snapshots (aggregating children)
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            read_ops: self.read_ops + other.read_ops,
            write_ops: self.write_ops + other.write_ops,
            unmap_ops: self.unmap_ops + other.unmap_ops,
            write_zeroes_ops: self.write_zeroes_ops + other.write_zeroes_ops,
            flush_ops: self.flush_ops + other.flush_ops,
            bytes_read: self.bytes_read + other.bytes_read,
            bytes_written: self.bytes_written + other.bytes_written,
            errors: self.errors + other.errors,
            read_latency: LatencySummary {
                avg_us: self.read_latency.avg_us.max(other.read_latency.avg_us),
                max_us: self.read_latency.max_us.max(other.read_latency.max_us),
                p50_us: self.read_latency.p50_us.max(other.read_latency.p50_us),
                p99_us: self.read_latency.p99_us.max(other.read_latency.p99_us),
            },
            write_latency: LatencySummary {
                avg_us: self.write_latency.avg_us.max(other.write_latency.avg_us),
                max_us: self.write_latency.max_us.max(other.write_latency.max_us),
                p50_us: self.write_latency.p50_us.max(other.write_latency.p50_us),
                p99_us: self.write_latency.p99_us.max(other.write_latency.p99_us),
            },
        }
    }
}
