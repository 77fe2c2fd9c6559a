//! Multi-replica snapshot coordination
//!
//! A nexus snapshot runs in three phases: pause application I/O, create a
//! snapshot on every participating child concurrently, resume. Resume
//! happens whatever the fan-out returned. The fan-out runs in its own task
//! so a caller that goes away cannot cut it short.

use crate::child::NexusChild;
use crate::error::{NexusError, NexusResult};
use crate::gate::IoGate;

use futures::future::join_all;
use nexio_common::{SnapshotInfo, SnapshotParams};
use nexio_device::DeviceHandle;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Per-child part of a snapshot request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotDescriptor {
    pub child_uri: String,
    pub params: SnapshotParams,
    /// Leave this child out; the snapshot has one replica less
    pub skip: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildSnapshotOutcome {
    Created(SnapshotInfo),
    Failed(String),
    Skipped,
    /// Created, then destroyed because another child failed
    RolledBack,
}

impl ChildSnapshotOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ChildSnapshotOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildSnapshotResult {
    pub child_uri: String,
    pub outcome: ChildSnapshotOutcome,
}

/// Outcome of a successful nexus snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NexusSnapshotResult {
    pub results: Vec<ChildSnapshotResult>,
    /// Number of replica snapshots taken
    pub replicas: usize,
}

impl NexusSnapshotResult {
    pub fn created(&self) -> impl Iterator<Item = &SnapshotInfo> {
        self.results.iter().filter_map(|r| match r.outcome {
            ChildSnapshotOutcome::Created(ref info) => Some(info),
            _ => None,
        })
    }
}

/// A validated participant
pub(crate) struct Participant {
    uri: String,
    handle: Arc<dyn DeviceHandle>,
    params: SnapshotParams,
}

/// Validated snapshot plan
pub(crate) struct SnapshotPlan {
    participants: Vec<Participant>,
    skipped: Vec<String>,
}

/// Check `descriptors` against the healthy children before anything is
/// touched.
///
/// Every healthy child must be named, either participating or skipped.
/// Unhealthy children may only appear skipped.
pub(crate) fn plan(
    children: &[Arc<NexusChild>],
    descriptors: &[SnapshotDescriptor],
) -> NexusResult<SnapshotPlan> {
    let mut seen = HashSet::new();
    let mut participants = Vec::new();
    let mut skipped = Vec::new();

    for descriptor in descriptors {
        let uri = descriptor.child_uri.as_str();
        let Some(child) = children.iter().find(|c| c.uri() == uri) else {
            return Err(NexusError::SnapshotUnknownChild {
                child: uri.to_string(),
            });
        };
        if !seen.insert(uri) {
            return Err(NexusError::SnapshotDuplicateChild {
                child: uri.to_string(),
            });
        }
        if descriptor.skip {
            skipped.push(uri.to_string());
            continue;
        }
        let handle = child
            .handle()
            .filter(|_| child.state().is_read_eligible())
            .ok_or_else(|| NexusError::SnapshotUnhealthyChild {
                child: uri.to_string(),
            })?;
        participants.push(Participant {
            uri: uri.to_string(),
            handle,
            params: descriptor.params.clone(),
        });
    }

    if let Some(missing) = children
        .iter()
        .find(|c| c.state().is_read_eligible() && !seen.contains(c.uri()))
    {
        return Err(NexusError::SnapshotMissingChild {
            child: missing.uri().to_string(),
        });
    }
    if participants.is_empty() {
        return Err(NexusError::SnapshotNoParticipants);
    }

    Ok(SnapshotPlan {
        participants,
        skipped,
    })
}

/// Pause, fan out, resume; roll back on any participant failure
pub(crate) async fn execute(
    nexus: &str,
    gate: &IoGate,
    plan: SnapshotPlan,
) -> NexusResult<NexusSnapshotResult> {
    let SnapshotPlan {
        participants,
        skipped,
    } = plan;
    let uris: Vec<String> = participants.iter().map(|p| p.uri.clone()).collect();
    let gate = gate.clone();
    let name = nexus.to_string();

    let task = tokio::spawn(async move {
        let pause = gate.pause().await;
        info!("{}: I/O paused, snapshotting {} children", name, participants.len());
        let outcomes = join_all(participants.iter().map(|p| async move {
            p.handle.create_snapshot(&p.params).await
        }))
        .await;
        drop(pause);
        info!("{}: I/O resumed", name);

        let failed = outcomes.iter().any(Result::is_err);
        let mut results = Vec::with_capacity(outcomes.len());
        for (participant, outcome) in participants.iter().zip(outcomes) {
            let outcome = match outcome {
                Ok(info) if failed => {
                    if let Err(e) = participant.handle.destroy_snapshot(&info.name).await {
                        warn!(
                            "{}: failed to roll back snapshot {} on {}: {}",
                            name, info.name, participant.uri, e
                        );
                    }
                    ChildSnapshotOutcome::RolledBack
                }
                Ok(info) => ChildSnapshotOutcome::Created(info),
                Err(e) => {
                    warn!("{}: snapshot failed on {}: {}", name, participant.uri, e);
                    ChildSnapshotOutcome::Failed(e.to_string())
                }
            };
            results.push(ChildSnapshotResult {
                child_uri: participant.uri.clone(),
                outcome,
            });
        }
        results
    });

    let mut results = match task.await {
        Ok(results) => results,
        Err(e) => uris
            .into_iter()
            .map(|child_uri| ChildSnapshotResult {
                child_uri,
                outcome: ChildSnapshotOutcome::Failed(e.to_string()),
            })
            .collect(),
    };
    results.extend(skipped.into_iter().map(|child_uri| ChildSnapshotResult {
        child_uri,
        outcome: ChildSnapshotOutcome::Skipped,
    }));

    if results.iter().any(|r| r.outcome.is_failed()) {
        return Err(NexusError::SnapshotFailed {
            nexus: nexus.to_string(),
            results,
        });
    }
    let replicas = results
        .iter()
        .filter(|r| matches!(r.outcome, ChildSnapshotOutcome::Created(_)))
        .count();
    info!("{}: snapshot taken on {} replicas", nexus, replicas);
    Ok(NexusSnapshotResult { results, replicas })
}
