//! Source selection strategy
//!
//! Greedy iterator over the over-utilized nodes of the current snapshot.
//! Candidates are ordered by scheduled utilization (what their utilization
//! will be once all bytes already picked to leave them are gone), most
//! utilized first. A source is retired once its per-iteration leaving cap
//! is reached or once draining it further would drop it out of the
//! over-utilized band.

use std::collections::HashMap;

use tracing::debug;

use strata_core::{NodeId, NodeUsage};

/// Greedy source iterator for one iteration.
pub struct FindSourceGreedy {
    /// Remaining candidates, kept sorted by scheduled utilization
    /// descending, ties broken by node id.
    candidates: Vec<NodeUsage>,
    bytes_leaving: HashMap<NodeId, u64>,
    max_size_leaving_source: u64,
    upper_limit: f64,
}

impl FindSourceGreedy {
    /// `over_utilized` is the snapshot's over-utilized list; `upper_limit`
    /// is the utilization above which a node counts as over-utilized.
    pub fn new(
        over_utilized: Vec<NodeUsage>,
        max_size_leaving_source: u64,
        upper_limit: f64,
    ) -> Self {
        let mut strategy = Self {
            candidates: over_utilized,
            bytes_leaving: HashMap::new(),
            max_size_leaving_source,
            upper_limit,
        };
        strategy.resort();
        strategy
    }

    /// The next source to try, or `None` once every source is exhausted.
    /// The same source keeps being returned until it is retired.
    pub fn next_candidate(&self) -> Option<NodeId> {
        self.candidates.first().map(|usage| usage.id())
    }

    /// Retire a source for the rest of the iteration.
    pub fn remove_candidate(&mut self, node: NodeId) {
        self.candidates.retain(|usage| usage.id() != node);
    }

    /// Record bytes scheduled to leave a source. Retires the source once
    /// its leaving cap is reached or once it would no longer be
    /// over-utilized.
    pub fn increase_leaving(&mut self, node: NodeId, bytes: u64) {
        let total = self.bytes_leaving.entry(node).or_insert(0);
        *total += bytes;
        let total = *total;

        let Some(usage) = self.candidates.iter().find(|u| u.id() == node) else {
            return;
        };
        let scheduled = usage.utilization_after(-(total as i64));
        if total >= self.max_size_leaving_source || scheduled < self.upper_limit {
            debug!(
                node = %node,
                bytes_leaving = total,
                scheduled_utilization = scheduled,
                "source exhausted for this iteration"
            );
            self.remove_candidate(node);
        } else {
            self.resort();
        }
    }

    /// Whether `bytes` more may leave the source without breaking its
    /// per-iteration leaving cap.
    pub fn can_size_leave_source(&self, node: NodeId, bytes: u64) -> bool {
        self.bytes_leaving.get(&node).copied().unwrap_or(0) + bytes
            <= self.max_size_leaving_source
    }

    /// Bytes scheduled to leave the node so far this iteration.
    pub fn bytes_leaving(&self, node: NodeId) -> u64 {
        self.bytes_leaving.get(&node).copied().unwrap_or(0)
    }

    fn scheduled_utilization(&self, usage: &NodeUsage) -> f64 {
        let leaving = self.bytes_leaving.get(&usage.id()).copied().unwrap_or(0);
        usage.utilization_after(-(leaving as i64))
    }

    fn resort(&mut self) {
        let mut keyed: Vec<(f64, NodeUsage)> = self
            .candidates
            .drain(..)
            .map(|usage| (0.0, usage))
            .collect();
        for entry in keyed.iter_mut() {
            entry.0 = self.scheduled_utilization(&entry.1);
        }
        keyed.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id().cmp(&b.1.id()))
        });
        self.candidates = keyed.into_iter().map(|(_, usage)| usage).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{NodeDescriptor, GB};
    use uuid::Uuid;

    fn usage(index: u8, capacity: u64, used: u64) -> NodeUsage {
        let id = NodeId::from_uuid(Uuid::from_u128(index as u128));
        NodeUsage {
            node: NodeDescriptor::new(id, format!("dn-{index}"), format!("10.0.0.{index}")),
            capacity,
            used,
            remaining: capacity - used,
        }
    }

    #[test]
    fn test_most_used_comes_first() {
        let strategy = FindSourceGreedy::new(
            vec![usage(1, 100 * GB, 80 * GB), usage(2, 100 * GB, 95 * GB)],
            26 * GB,
            0.6,
        );
        assert_eq!(strategy.next_candidate(), Some(usage(2, 1, 0).id()));
    }

    #[test]
    fn test_remove_candidate() {
        let mut strategy = FindSourceGreedy::new(
            vec![usage(1, 100 * GB, 90 * GB), usage(2, 100 * GB, 95 * GB)],
            26 * GB,
            0.6,
        );
        strategy.remove_candidate(usage(2, 1, 0).id());
        assert_eq!(strategy.next_candidate(), Some(usage(1, 1, 0).id()));
        strategy.remove_candidate(usage(1, 1, 0).id());
        assert_eq!(strategy.next_candidate(), None);
    }

    #[test]
    fn test_exhausted_by_leaving_cap() {
        let node = usage(1, 100 * GB, 95 * GB);
        let mut strategy = FindSourceGreedy::new(vec![node.clone()], 10 * GB, 0.6);
        strategy.increase_leaving(node.id(), 5 * GB);
        assert_eq!(strategy.next_candidate(), Some(node.id()));
        strategy.increase_leaving(node.id(), 5 * GB);
        assert_eq!(strategy.next_candidate(), None);
    }

    #[test]
    fn test_exhausted_once_no_longer_over_utilized() {
        // draining 10 GB leaves the node at 0.70, below the 0.75 limit
        let node = usage(1, 100 * GB, 80 * GB);
        let mut strategy = FindSourceGreedy::new(vec![node.clone()], 100 * GB, 0.75);
        strategy.increase_leaving(node.id(), 10 * GB);
        assert_eq!(strategy.next_candidate(), None);
    }

    #[test]
    fn test_reorders_after_scheduled_moves() {
        let heavy = usage(1, 100 * GB, 96 * GB);
        let light = usage(2, 100 * GB, 94 * GB);
        let mut strategy =
            FindSourceGreedy::new(vec![heavy.clone(), light.clone()], 100 * GB, 0.5);
        assert_eq!(strategy.next_candidate(), Some(heavy.id()));
        // schedule enough out of the heavy node that the other overtakes it
        strategy.increase_leaving(heavy.id(), 5 * GB);
        assert_eq!(strategy.next_candidate(), Some(light.id()));
    }

    #[test]
    fn test_can_size_leave_source() {
        let node = usage(1, 100 * GB, 95 * GB);
        let mut strategy = FindSourceGreedy::new(vec![node.clone()], 10 * GB, 0.6);
        assert!(strategy.can_size_leave_source(node.id(), 10 * GB));
        assert!(!strategy.can_size_leave_source(node.id(), 11 * GB));
        strategy.increase_leaving(node.id(), 6 * GB);
        assert!(strategy.can_size_leave_source(node.id(), 4 * GB));
        assert!(!strategy.can_size_leave_source(node.id(), 5 * GB));
    }
}
