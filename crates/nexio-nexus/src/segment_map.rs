//! Segment bitmap over a byte range
//!
//! One bit per fixed-size segment. Used both as the dirty map handed to a
//! partial rebuild and as the write-interception log that records writes
//! landing while a child is out of date.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct SegmentMap {
    /// Bitmap data
    data: RwLock<Vec<u8>>,
    /// Size of one segment in bytes
    segment_size: u64,
    /// Total number of segments
    total_segments: u64,
    /// Number of set bits (cached)
    dirty: AtomicU64,
}

impl SegmentMap {
    /// Create an empty map covering `size_bytes`
    #[must_use]
    pub fn new(size_bytes: u64, segment_size: u64) -> Self {
        let total_segments = size_bytes.div_ceil(segment_size);
        Self {
            data: RwLock::new(vec![0u8; total_segments.div_ceil(8) as usize]),
            segment_size,
            total_segments,
            dirty: AtomicU64::new(0),
        }
    }

    /// Create a map with every segment set
    #[must_use]
    pub fn full(size_bytes: u64, segment_size: u64) -> Self {
        let map = Self::new(size_bytes, segment_size);
        map.mark_range(0, size_bytes);
        map
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    pub fn total_segments(&self) -> u64 {
        self.total_segments
    }

    fn is_set_in_slice(data: &[u8], segment: u64) -> bool {
        let byte_idx = (segment / 8) as usize;
        let bit_idx = (segment % 8) as u8;
        data[byte_idx] & (1 << bit_idx) != 0
    }

    /// Set a bit, returning whether it was previously clear
    fn set_in_slice(data: &mut [u8], segment: u64) -> bool {
        let byte_idx = (segment / 8) as usize;
        let bit = 1 << (segment % 8) as u8;
        let was_clear = data[byte_idx] & bit == 0;
        data[byte_idx] |= bit;
        was_clear
    }

    /// Mark every segment overlapping `[offset, offset + length)`.
    ///
    /// Zero-length ranges (flush) mark nothing.
    pub fn mark_range(&self, offset: u64, length: u64) {
        if length == 0 || self.total_segments == 0 {
            return;
        }
        let first = offset / self.segment_size;
        let last = ((offset + length - 1) / self.segment_size).min(self.total_segments - 1);
        if first > last {
            return;
        }
        let mut data = self.data.write();
        let mut newly = 0;
        for segment in first..=last {
            if Self::set_in_slice(&mut data, segment) {
                newly += 1;
            }
        }
        self.dirty.fetch_add(newly, Ordering::Relaxed);
    }

    pub fn is_set(&self, segment: u64) -> bool {
        if segment >= self.total_segments {
            return false;
        }
        Self::is_set_in_slice(&self.data.read(), segment)
    }

    /// Number of set segments
    pub fn count(&self) -> u64 {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Indices of set segments in ascending order
    pub fn segments(&self) -> Vec<u64> {
        let data = self.data.read();
        (0..self.total_segments)
            .filter(|&segment| Self::is_set_in_slice(&data, segment))
            .collect()
    }

    /// Atomically clear the map, returning the segments that were set
    pub fn take(&self) -> Vec<u64> {
        let mut data = self.data.write();
        let taken: Vec<u64> = (0..self.total_segments)
            .filter(|&segment| Self::is_set_in_slice(&data, segment))
            .collect();
        data.fill(0);
        self.dirty.store(0, Ordering::Relaxed);
        taken
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Self {
        let data = self.data.read().clone();
        Self {
            data: RwLock::new(data),
            segment_size: self.segment_size,
            total_segments: self.total_segments,
            dirty: AtomicU64::new(self.count()),
        }
    }

    /// OR another map with the same layout into this one
    pub fn merge(&self, other: &SegmentMap) {
        debug_assert_eq!(self.segment_size, other.segment_size);
        let theirs = other.data.read();
        let mut ours = self.data.write();
        for (mine, their) in ours.iter_mut().zip(theirs.iter()) {
            *mine |= *their;
        }
        let count: u32 = ours.iter().map(|b| b.count_ones()).sum();
        self.dirty.store(u64::from(count), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for SegmentMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentMap")
            .field("segment_size", &self.segment_size)
            .field("total_segments", &self.total_segments)
            .field("dirty", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_range_spans_segments() {
        let map = SegmentMap::new(1024 * 1024, 64 * 1024);
        assert_eq!(map.total_segments(), 16);

        // 4 KiB write straddling the boundary between segments 0 and 1
        map.mark_range(62 * 1024, 4096);
        assert!(map.is_set(0));
        assert!(map.is_set(1));
        assert!(!map.is_set(2));
        assert_eq!(map.count(), 2);

        // Re-marking does not double count
        map.mark_range(0, 4096);
        assert_eq!(map.count(), 2);

        map.mark_range(0, 0);
        assert_eq!(map.count(), 2);
    }

    #[test]
    fn test_take_clears() {
        let map = SegmentMap::new(256 * 1024, 64 * 1024);
        map.mark_range(192 * 1024, 512);
        map.mark_range(0, 512);
        assert_eq!(map.take(), vec![0, 3]);
        assert!(map.is_empty());
        assert!(map.take().is_empty());
    }

    #[test]
    fn test_partial_last_segment() {
        // 100 KiB with 64 KiB segments leaves a short tail segment
        let map = SegmentMap::full(100 * 1024, 64 * 1024);
        assert_eq!(map.total_segments(), 2);
        assert_eq!(map.count(), 2);
    }

    #[test]
    fn test_merge_and_snapshot() {
        let a = SegmentMap::new(1024 * 1024, 64 * 1024);
        let b = SegmentMap::new(1024 * 1024, 64 * 1024);
        a.mark_range(0, 1);
        b.mark_range(0, 1);
        b.mark_range(5 * 64 * 1024, 1);
        a.merge(&b);
        assert_eq!(a.segments(), vec![0, 5]);

        let copy = a.snapshot();
        a.take();
        assert_eq!(copy.count(), 2);
        assert!(a.is_empty());
    }
}
