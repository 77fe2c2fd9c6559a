//! Bounded log of finished rebuild jobs

use super::{RebuildKind, RebuildState, RebuildStats};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use uuid::Uuid;

/// Outcome of one rebuild job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildRecord {
    pub job_id: Uuid,
    pub source: String,
    pub destination: String,
    pub kind: RebuildKind,
    pub state: RebuildState,
    pub stats: RebuildStats,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Ring buffer keeping the most recent records
#[derive(Debug)]
pub struct RebuildHistory {
    capacity: usize,
    records: Mutex<VecDeque<RebuildRecord>>,
}

impl RebuildHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a record, evicting the oldest when full
    pub fn push(&self, record: RebuildRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.lock();
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Records oldest first
    pub fn records(&self) -> Vec<RebuildRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Records for one destination child, oldest first
    pub fn for_child(&self, uri: &str) -> Vec<RebuildRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.destination == uri)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(destination: &str) -> RebuildRecord {
        RebuildRecord {
            job_id: Uuid::new_v4(),
            source: "malloc:///src".into(),
            destination: destination.into(),
            kind: RebuildKind::Full,
            state: RebuildState::Completed,
            stats: RebuildStats::default(),
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            error: None,
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let history = RebuildHistory::new(2);
        history.push(record("a"));
        history.push(record("b"));
        history.push(record("c"));

        let records = history.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].destination, "b");
        assert_eq!(records[1].destination, "c");
        assert_eq!(history.for_child("c").len(), 1);
        assert!(history.for_child("a").is_empty());
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let history = RebuildHistory::new(0);
        history.push(record("a"));
        assert!(history.is_empty());
    }
}
