//! Target selection strategies
//!
//! Given a source node and its candidate containers, picks the
//! `(container, target)` pair to move, or nothing if no target satisfies
//! every constraint. Two interchangeable strategies exist: one that walks
//! targets from least utilized upward, and a topology-aware one that
//! prefers targets close to the container's existing replicas.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use strata_core::{ContainerId, ContainerInfo, NodeId, NodeUsage};

use crate::cluster::{NetworkTopology, PlacementPolicy};

/// A container paired with the node it should move to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveSelection {
    pub container: ContainerId,
    pub target: NodeId,
}

/// Strategy interface for picking a move target.
pub trait FindTargetStrategy: Send {
    /// Pick a `(container, target)` pair for the source, or `None` if no
    /// candidate container fits on any remaining target.
    fn find_target(&mut self, source: NodeId, candidates: &[ContainerInfo])
        -> Option<MoveSelection>;

    /// Record bytes scheduled to enter a target.
    fn increase_entering(&mut self, target: NodeId, bytes: u64);

    /// Bytes scheduled to enter the node so far this iteration.
    fn bytes_entering(&self, target: NodeId) -> u64;
}

/// Shared constraint checking and byte accounting for both strategies.
struct TargetPool {
    /// The snapshot's under-utilized nodes.
    targets: Vec<NodeUsage>,
    bytes_entering: HashMap<NodeId, u64>,
    upper_limit: f64,
    max_size_entering_target: u64,
    placement: Arc<dyn PlacementPolicy>,
}

impl TargetPool {
    fn new(
        under_utilized: Vec<NodeUsage>,
        upper_limit: f64,
        max_size_entering_target: u64,
        placement: Arc<dyn PlacementPolicy>,
    ) -> Self {
        Self {
            targets: under_utilized,
            bytes_entering: HashMap::new(),
            upper_limit,
            max_size_entering_target,
            placement,
        }
    }

    fn bytes_entering(&self, target: NodeId) -> u64 {
        self.bytes_entering.get(&target).copied().unwrap_or(0)
    }

    fn increase_entering(&mut self, target: NodeId, bytes: u64) {
        *self.bytes_entering.entry(target).or_insert(0) += bytes;
    }

    fn scheduled_utilization(&self, target: &NodeUsage) -> f64 {
        target.utilization_after(self.bytes_entering(target.id()) as i64)
    }

    /// Whether the container may land on this target.
    fn accepts(&self, container: &ContainerInfo, source: NodeId, target: &NodeUsage) -> bool {
        let target_id = target.id();
        if container.replicas.contains(&target_id) {
            return false;
        }
        let entering = self.bytes_entering(target_id);
        if entering + container.used_bytes > self.max_size_entering_target {
            return false;
        }
        let after = target.utilization_after((entering + container.used_bytes) as i64);
        if after > self.upper_limit {
            return false;
        }
        let mut proposed: BTreeSet<NodeId> = container.replicas.clone();
        proposed.remove(&source);
        proposed.insert(target_id);
        if !self.placement.validate(&proposed) {
            debug!(
                container = %container.id,
                target = %target_id,
                "placement policy rejected proposed replica set"
            );
            return false;
        }
        true
    }

    /// First acceptable target for the container among `ordered`, which
    /// lists indices into `self.targets`.
    fn first_fit(
        &self,
        container: &ContainerInfo,
        source: NodeId,
        ordered: &[usize],
    ) -> Option<MoveSelection> {
        for &index in ordered {
            let target = &self.targets[index];
            if self.accepts(container, source, target) {
                return Some(MoveSelection {
                    container: container.id,
                    target: target.id(),
                });
            }
        }
        None
    }

    /// Target indices ordered by ascending scheduled utilization, ties by
    /// node id. Recomputed per selection since scheduled bytes change.
    fn by_usage_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.targets.len()).collect();
        order.sort_by(|&a, &b| {
            let ua = self.scheduled_utilization(&self.targets[a]);
            let ub = self.scheduled_utilization(&self.targets[b]);
            ua.partial_cmp(&ub)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.targets[a].id().cmp(&self.targets[b].id()))
        });
        order
    }
}

/// Walks targets from least utilized upward and picks the first fit.
pub struct FindTargetByUsage {
    pool: TargetPool,
}

impl FindTargetByUsage {
    pub fn new(
        under_utilized: Vec<NodeUsage>,
        upper_limit: f64,
        max_size_entering_target: u64,
        placement: Arc<dyn PlacementPolicy>,
    ) -> Self {
        Self {
            pool: TargetPool::new(
                under_utilized,
                upper_limit,
                max_size_entering_target,
                placement,
            ),
        }
    }
}

impl FindTargetStrategy for FindTargetByUsage {
    fn find_target(
        &mut self,
        source: NodeId,
        candidates: &[ContainerInfo],
    ) -> Option<MoveSelection> {
        let order = self.pool.by_usage_order();
        for container in candidates {
            if let Some(selection) = self.pool.first_fit(container, source, &order) {
                return Some(selection);
            }
        }
        None
    }

    fn increase_entering(&mut self, target: NodeId, bytes: u64) {
        self.pool.increase_entering(target, bytes);
    }

    fn bytes_entering(&self, target: NodeId) -> u64 {
        self.pool.bytes_entering(target)
    }
}

/// Topology-aware variant. For each candidate container: when one of its
/// replicas already shares the source's rack, targets on racks that hold a
/// replica are tried first, so the move preserves the rack-locality the
/// placement policy expects; otherwise targets are tried closest-rack
/// first. Utilization and node id break ties.
pub struct FindTargetByTopology {
    pool: TargetPool,
    topology: Arc<dyn NetworkTopology>,
}

impl FindTargetByTopology {
    pub fn new(
        under_utilized: Vec<NodeUsage>,
        upper_limit: f64,
        max_size_entering_target: u64,
        placement: Arc<dyn PlacementPolicy>,
        topology: Arc<dyn NetworkTopology>,
    ) -> Self {
        Self {
            pool: TargetPool::new(
                under_utilized,
                upper_limit,
                max_size_entering_target,
                placement,
            ),
            topology,
        }
    }

    fn topology_order(&self, source: NodeId, container: &ContainerInfo) -> Vec<usize> {
        let replica_near_source = container
            .replicas
            .iter()
            .any(|&replica| replica != source && self.topology.same_rack(source, replica));

        let mut order: Vec<usize> = (0..self.pool.targets.len()).collect();
        order.sort_by(|&a, &b| {
            let ta = &self.pool.targets[a];
            let tb = &self.pool.targets[b];
            let key = |t: &NodeUsage| -> (u32, f64) {
                if replica_near_source {
                    // group 0: target shares a rack with an existing replica
                    let near_replica = container
                        .replicas
                        .iter()
                        .any(|&replica| self.topology.same_rack(t.id(), replica));
                    (u32::from(!near_replica), self.pool.scheduled_utilization(t))
                } else {
                    (
                        self.topology.rack_distance(source, t.id()),
                        self.pool.scheduled_utilization(t),
                    )
                }
            };
            let (ga, ua) = key(ta);
            let (gb, ub) = key(tb);
            ga.cmp(&gb)
                .then(ua.partial_cmp(&ub).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| ta.id().cmp(&tb.id()))
        });
        order
    }
}

impl FindTargetStrategy for FindTargetByTopology {
    fn find_target(
        &mut self,
        source: NodeId,
        candidates: &[ContainerInfo],
    ) -> Option<MoveSelection> {
        for container in candidates {
            let order = self.topology_order(source, container);
            if let Some(selection) = self.pool.first_fit(container, source, &order) {
                return Some(selection);
            }
        }
        None
    }

    fn increase_entering(&mut self, target: NodeId, bytes: u64) {
        self.pool.increase_entering(target, bytes);
    }

    fn bytes_entering(&self, target: NodeId) -> u64 {
        self.pool.bytes_entering(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::AcceptAllPlacement;
    use strata_core::{ContainerState, NodeDescriptor, GB};
    use uuid::Uuid;

    fn node(index: u8, capacity: u64, used: u64) -> NodeUsage {
        let id = NodeId::from_uuid(Uuid::from_u128(index as u128));
        NodeUsage {
            node: NodeDescriptor::new(id, format!("dn-{index}"), format!("10.0.0.{index}")),
            capacity,
            used,
            remaining: capacity - used,
        }
    }

    fn container(id: u64, used: u64, replicas: &[NodeId]) -> ContainerInfo {
        ContainerInfo {
            id: ContainerId::new(id),
            used_bytes: used,
            replicas: replicas.iter().copied().collect(),
            state: ContainerState::Closed,
            replication_factor: replicas.len(),
        }
    }

    fn accept_all() -> Arc<dyn PlacementPolicy> {
        Arc::new(AcceptAllPlacement)
    }

    #[test]
    fn test_least_utilized_target_wins() {
        let source = node(1, 100 * GB, 90 * GB);
        let cold = node(2, 100 * GB, 10 * GB);
        let warm = node(3, 100 * GB, 30 * GB);
        let c = container(1, 5 * GB, &[source.id()]);

        let mut strategy = FindTargetByUsage::new(
            vec![warm.clone(), cold.clone()],
            0.8,
            26 * GB,
            accept_all(),
        );
        let selection = strategy.find_target(source.id(), &[c]).unwrap();
        assert_eq!(selection.target, cold.id());
    }

    #[test]
    fn test_existing_replica_is_not_a_target() {
        let source = node(1, 100 * GB, 90 * GB);
        let holder = node(2, 100 * GB, 10 * GB);
        let other = node(3, 100 * GB, 30 * GB);
        let c = container(1, 5 * GB, &[source.id(), holder.id()]);

        let mut strategy = FindTargetByUsage::new(
            vec![holder.clone(), other.clone()],
            0.8,
            26 * GB,
            accept_all(),
        );
        let selection = strategy.find_target(source.id(), &[c]).unwrap();
        assert_eq!(selection.target, other.id());
    }

    #[test]
    fn test_upper_limit_respected() {
        let source = node(1, 100 * GB, 90 * GB);
        // 5 GB more would put the target at 0.55, above the 0.5 limit
        let target = node(2, 100 * GB, 52 * GB);
        let c = container(1, 5 * GB, &[source.id()]);

        let mut strategy =
            FindTargetByUsage::new(vec![target], 0.5, 26 * GB, accept_all());
        assert!(strategy.find_target(source.id(), &[c]).is_none());
    }

    #[test]
    fn test_entering_cap_respected() {
        let source = node(1, 100 * GB, 90 * GB);
        let target = node(2, 100 * GB, 10 * GB);
        let c1 = container(1, 5 * GB, &[source.id()]);
        let c2 = container(2, 5 * GB, &[source.id()]);

        let mut strategy =
            FindTargetByUsage::new(vec![target.clone()], 0.9, 8 * GB, accept_all());
        let first = strategy.find_target(source.id(), &[c1]).unwrap();
        strategy.increase_entering(first.target, 5 * GB);
        // 5 GB already entering; 5 more would exceed the 8 GB cap
        assert!(strategy.find_target(source.id(), &[c2]).is_none());
    }

    #[test]
    fn test_larger_container_tried_first() {
        let source = node(1, 100 * GB, 90 * GB);
        let target = node(2, 100 * GB, 10 * GB);
        let big = container(1, 6 * GB, &[source.id()]);
        let small = container(2, 2 * GB, &[source.id()]);

        let mut strategy =
            FindTargetByUsage::new(vec![target], 0.9, 26 * GB, accept_all());
        let selection = strategy
            .find_target(source.id(), &[big.clone(), small])
            .unwrap();
        assert_eq!(selection.container, big.id);
    }
}
