//! Admission gate for application I/O
//!
//! Every application request holds an [`IoPermit`] for its whole lifetime.
//! [`IoGate::pause`] stops new admissions and waits for the outstanding
//! permits to drain; new requests queue until the returned guard is dropped.
//! Pauses nest, so a snapshot and a rebuild may pause concurrently.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct GateState {
    pause_depth: u32,
    shutdown: bool,
    in_flight: usize,
}

/// Returned by [`IoGate::admit`] once the gate is shut
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateClosed;

#[derive(Debug, Clone)]
pub struct IoGate {
    state: Arc<watch::Sender<GateState>>,
}

impl IoGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::default());
        Self {
            state: Arc::new(state),
        }
    }

    /// Wait for admission. Fails once the gate is shut.
    pub async fn admit(&self) -> Result<IoPermit, GateClosed> {
        // Subscribe before checking so a resume in between is not missed
        let mut rx = self.state.subscribe();
        loop {
            let mut admitted = None;
            self.state.send_if_modified(|state| {
                if state.shutdown {
                    admitted = Some(false);
                } else if state.pause_depth == 0 {
                    state.in_flight += 1;
                    admitted = Some(true);
                }
                false
            });
            match admitted {
                Some(true) => {
                    return Ok(IoPermit {
                        state: Arc::clone(&self.state),
                    });
                }
                Some(false) => return Err(GateClosed),
                None => {
                    if rx.changed().await.is_err() {
                        return Err(GateClosed);
                    }
                }
            }
        }
    }

    /// Stop admitting new I/O and wait for in-flight I/O to drain.
    ///
    /// I/O resumes when the returned guard is dropped.
    pub async fn pause(&self) -> PauseGuard {
        self.state.send_modify(|state| state.pause_depth += 1);
        let guard = PauseGuard {
            state: Arc::clone(&self.state),
        };
        let depth = self.state.borrow().pause_depth;
        debug!("I/O paused (depth {})", depth);
        self.wait_drained().await;
        guard
    }

    /// Shut the gate: queued and future requests fail. In-flight requests
    /// finish; use [`IoGate::wait_drained`] to wait for them.
    pub fn shutdown(&self) {
        self.state.send_modify(|state| state.shutdown = true);
    }

    pub async fn wait_drained(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|state| state.in_flight == 0).await;
    }

    pub fn is_paused(&self) -> bool {
        self.state.borrow().pause_depth > 0
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.borrow().shutdown
    }

    pub fn in_flight(&self) -> usize {
        self.state.borrow().in_flight
    }
}

impl Default for IoGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Admission for one application request
#[derive(Debug)]
pub struct IoPermit {
    state: Arc<watch::Sender<GateState>>,
}

impl Drop for IoPermit {
    fn drop(&mut self) {
        self.state.send_if_modified(|state| {
            state.in_flight -= 1;
            // Only drainers care, and only about reaching zero
            state.in_flight == 0 && (state.pause_depth > 0 || state.shutdown)
        });
    }
}

/// Keeps I/O paused until dropped
#[derive(Debug)]
#[must_use = "I/O resumes as soon as the guard is dropped"]
pub struct PauseGuard {
    state: Arc<watch::Sender<GateState>>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.state.send_modify(|state| state.pause_depth -= 1);
        debug!("I/O resumed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_admit_when_open() {
        let gate = IoGate::new();
        let permit = gate.admit().await.unwrap();
        assert_eq!(gate.in_flight(), 1);
        drop(permit);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_pause_waits_for_in_flight() {
        let gate = IoGate::new();
        let permit = gate.admit().await.unwrap();

        let pausing = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.pause().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pausing.is_finished());
        assert!(gate.is_paused());

        drop(permit);
        let guard = timeout(Duration::from_secs(1), pausing)
            .await
            .unwrap()
            .unwrap();

        // New I/O queues while paused
        let queued = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.admit().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!queued.is_finished());

        drop(guard);
        timeout(Duration::from_secs(1), queued)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!gate.is_paused());
    }

    #[tokio::test]
    async fn test_nested_pause() {
        let gate = IoGate::new();
        let outer = gate.pause().await;
        let inner = gate.pause().await;
        drop(outer);
        assert!(gate.is_paused());
        drop(inner);
        assert!(!gate.is_paused());
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued() {
        let gate = IoGate::new();
        let guard = gate.pause().await;
        let queued = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.admit().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.shutdown();
        assert_eq!(queued.await.unwrap(), Err(GateClosed));
        drop(guard);
        assert!(gate.admit().await.is_err());
    }
}
