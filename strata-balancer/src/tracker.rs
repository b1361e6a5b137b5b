//! Move tracker
//!
//! Submits asynchronous move requests to the replication engine and
//! collects their outcomes under a deadline. One watcher task per
//! submission forwards the engine's eventual outcome into an outcome
//! channel; `pending` remembers what is still unresolved so the deadline
//! path can cooperatively cancel it. At most one submission is ever in
//! flight per `(container, source, target)`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use strata_core::{ContainerId, NodeId};

use crate::cluster::{MoveOutcome, ReplicationClient};

/// Identity of one scheduled move.
pub type MoveKey = (ContainerId, NodeId, NodeId);

pub struct MoveTracker {
    replication: Arc<dyn ReplicationClient>,
    outcome_tx: mpsc::UnboundedSender<(MoveKey, MoveOutcome)>,
    outcome_rx: mpsc::UnboundedReceiver<(MoveKey, MoveOutcome)>,
    pending: HashMap<MoveKey, Option<JoinHandle<()>>>,
}

impl MoveTracker {
    pub fn new(replication: Arc<dyn ReplicationClient>) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            replication,
            outcome_tx,
            outcome_rx,
            pending: HashMap::new(),
        }
    }

    /// Number of moves whose outcome has not been collected yet.
    pub fn pending_moves(&self) -> usize {
        self.pending.len()
    }

    /// Submit a move to the replication engine. Synchronous rejections
    /// resolve immediately as `Failed` but are tracked like any other
    /// move. Re-submitting a key already in flight is a no-op.
    pub async fn submit(&mut self, container: ContainerId, source: NodeId, target: NodeId) {
        let key = (container, source, target);
        if self.pending.contains_key(&key) {
            debug!(container = %container, "move already submitted, reusing it");
            return;
        }
        match self.replication.begin_move(container, source, target).await {
            Ok(receiver) => {
                let tx = self.outcome_tx.clone();
                let watcher = tokio::spawn(async move {
                    // a dropped sender means the engine abandoned the move
                    let outcome = receiver.await.unwrap_or(MoveOutcome::Cancelled);
                    let _ = tx.send((key, outcome));
                });
                self.pending.insert(key, Some(watcher));
            }
            Err(err) => {
                warn!(
                    container = %container,
                    source = %source,
                    target = %target,
                    error = %err,
                    "replication engine rejected move"
                );
                let _ = self
                    .outcome_tx
                    .send((key, MoveOutcome::Failed(err.to_string())));
                self.pending.insert(key, None);
            }
        }
    }

    /// Wait until every submitted move has resolved or `timeout` elapses.
    /// On the deadline, every still-unresolved move is asked to cancel and
    /// reported as `TimedOut`. Outcomes are returned in arrival order.
    pub async fn await_all(&mut self, timeout: Duration) -> Vec<(MoveKey, MoveOutcome)> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut outcomes = Vec::with_capacity(self.pending.len());

        while !self.pending.is_empty() {
            match tokio::time::timeout_at(deadline, self.outcome_rx.recv()).await {
                Ok(Some((key, outcome))) => {
                    if self.pending.remove(&key).is_some() {
                        outcomes.push((key, outcome));
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    let mut unresolved: Vec<MoveKey> = self.pending.keys().copied().collect();
                    unresolved.sort();
                    warn!(count = unresolved.len(), "container moves cancelled due to timeout");
                    for key in unresolved {
                        let (container, source, target) = key;
                        warn!(
                            container = %container,
                            target = %target,
                            "container move cancelled due to timeout"
                        );
                        self.replication.cancel_move(container, source, target).await;
                        if let Some(Some(watcher)) = self.pending.remove(&key) {
                            watcher.abort();
                        }
                        outcomes.push((key, MoveOutcome::TimedOut));
                    }
                }
            }
        }
        outcomes
    }
}

impl Drop for MoveTracker {
    fn drop(&mut self) {
        // moves themselves are fire-and-forget with the engine, but the
        // watcher tasks must not outlive the iteration
        for watcher in self.pending.values_mut().flatten() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{MovePlan, SimCluster};
    use std::time::Duration;
    use strata_core::{ContainerState, GB};

    #[tokio::test]
    async fn test_outcomes_collected() {
        let cluster = SimCluster::new();
        let source = cluster.add_node("dn-1", 100 * GB, 0);
        let target = cluster.add_node("dn-2", 100 * GB, 0);
        let container = cluster.add_container(GB, &[source], ContainerState::Closed);

        let mut tracker = MoveTracker::new(cluster.replication());
        tracker.submit(container, source, target).await;
        assert_eq!(tracker.pending_moves(), 1);

        let outcomes = tracker.await_all(Duration::from_secs(1)).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].1, MoveOutcome::Completed);
        assert_eq!(tracker.pending_moves(), 0);
    }

    #[tokio::test]
    async fn test_synchronous_rejection_resolves_failed() {
        let cluster = SimCluster::new();
        let source = cluster.add_node("dn-1", 100 * GB, 0);
        let target = cluster.add_node("dn-2", 100 * GB, 0);
        let missing = strata_core::ContainerId::new(999);

        let mut tracker = MoveTracker::new(cluster.replication());
        tracker.submit(missing, source, target).await;
        // the rejected move is still tracked
        assert_eq!(tracker.pending_moves(), 1);

        let outcomes = tracker.await_all(Duration::from_secs(1)).await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0].1, MoveOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_deadline_times_out_unresolved_moves() {
        let cluster = SimCluster::new();
        let source = cluster.add_node("dn-1", 100 * GB, 0);
        let target = cluster.add_node("dn-2", 100 * GB, 0);
        let fast = cluster.add_container(GB, &[source], ContainerState::Closed);
        let slow = cluster.add_container(GB, &[source], ContainerState::Closed);
        cluster.set_move_plan(slow, MovePlan::never());

        let mut tracker = MoveTracker::new(cluster.replication());
        tracker.submit(fast, source, target).await;
        tracker.submit(slow, source, target).await;

        let outcomes = tracker.await_all(Duration::from_millis(200)).await;
        assert_eq!(outcomes.len(), 2);
        let completed = outcomes
            .iter()
            .filter(|(_, o)| *o == MoveOutcome::Completed)
            .count();
        let timed_out = outcomes
            .iter()
            .filter(|(_, o)| *o == MoveOutcome::TimedOut)
            .count();
        assert_eq!(completed, 1);
        assert_eq!(timed_out, 1);
        // the engine was asked to cancel the unresolved move
        assert!(cluster.cancelled_moves().contains(&slow));
    }

    #[tokio::test]
    async fn test_resubmission_is_idempotent() {
        let cluster = SimCluster::new();
        let source = cluster.add_node("dn-1", 100 * GB, 0);
        let target = cluster.add_node("dn-2", 100 * GB, 0);
        let container = cluster.add_container(GB, &[source], ContainerState::Closed);

        let mut tracker = MoveTracker::new(cluster.replication());
        tracker.submit(container, source, target).await;
        tracker.submit(container, source, target).await;
        assert_eq!(tracker.pending_moves(), 1);

        let outcomes = tracker.await_all(Duration::from_secs(1)).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(cluster.begun_moves(), 1);
    }
}
