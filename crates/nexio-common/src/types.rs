//! Value types shared across crates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reservation type requested when acquiring the exclusivity token.
///
/// Both variants let every registrant write. They differ in what
/// non-registrants may do: `ExclusiveAllRegistrants` denies them all access,
/// `WriteExclusiveAllRegistrants` still lets them read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReservationPolicy {
    ExclusiveAllRegistrants,
    #[default]
    WriteExclusiveAllRegistrants,
}

impl ReservationPolicy {
    /// Whether a non-registrant may read under this reservation
    pub fn allows_foreign_reads(&self) -> bool {
        matches!(self, ReservationPolicy::WriteExclusiveAllRegistrants)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationPolicy::ExclusiveAllRegistrants => "exclusive_all_registrants",
            ReservationPolicy::WriteExclusiveAllRegistrants => "write_exclusive_all_registrants",
        }
    }
}

impl fmt::Display for ReservationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many children must hold the token before the nexus treats the
/// replica set as exclusively owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReservationQuorum {
    /// Every write-eligible child
    #[default]
    AllWriters,
    /// At least this many children
    AtLeast(usize),
}

impl ReservationQuorum {
    /// Number of holders required given the current writer count
    pub fn required(&self, writers: usize) -> usize {
        match *self {
            ReservationQuorum::AllWriters => writers,
            ReservationQuorum::AtLeast(n) => n,
        }
    }
}

/// Parameters of a point-in-time capture issued to one child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotParams {
    /// Snapshot name as known to the device
    pub name: String,
    /// Owning entity (usually the volume ID)
    pub entity_id: String,
    /// Transaction ID shared by all replicas of one nexus snapshot
    pub txn_id: String,
    /// Per-replica snapshot UUID
    pub snapshot_uuid: String,
    /// Creation time
    pub create_time: DateTime<Utc>,
}

/// Result of a successful per-child snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub snapshot_uuid: String,
    pub txn_id: String,
    /// Device the snapshot was taken on
    pub device: String,
    /// Logical size captured
    pub size_bytes: u64,
    /// Bytes actually allocated at capture time
    pub allocated_bytes: u64,
    pub create_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_required() {
        assert_eq!(ReservationQuorum::AllWriters.required(3), 3);
        assert_eq!(ReservationQuorum::AtLeast(2).required(3), 2);
        // Asking for more holders than writers still requires the full count
        assert_eq!(ReservationQuorum::AtLeast(4).required(3), 4);
    }

    #[test]
    fn test_policy_serde_names() {
        let json = serde_json::to_string(&ReservationPolicy::ExclusiveAllRegistrants).unwrap();
        assert_eq!(json, "\"exclusive_all_registrants\"");
        assert!(ReservationPolicy::WriteExclusiveAllRegistrants.allows_foreign_reads());
        assert!(!ReservationPolicy::ExclusiveAllRegistrants.allows_foreign_reads());
    }
}
