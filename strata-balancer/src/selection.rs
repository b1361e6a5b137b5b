//! Container selection criteria
//!
//! Given a source node, yields the containers on it that are eligible to
//! move, largest first. A container qualifies only if it is immutable, has
//! not already been picked this iteration, has no replication work in
//! flight, sits at exactly its configured replication factor, and still
//! fits under the source's per-iteration leaving cap.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use strata_core::{ContainerId, ContainerInfo, NodeId};

use crate::cluster::{ContainerManager, NodeManager, ReplicationClient};
use crate::find_source::FindSourceGreedy;

pub struct SelectionCriteria {
    node_manager: Arc<dyn NodeManager>,
    container_manager: Arc<dyn ContainerManager>,
    replication: Arc<dyn ReplicationClient>,
}

impl SelectionCriteria {
    pub fn new(
        node_manager: Arc<dyn NodeManager>,
        container_manager: Arc<dyn ContainerManager>,
        replication: Arc<dyn ReplicationClient>,
    ) -> Self {
        Self {
            node_manager,
            container_manager,
            replication,
        }
    }

    /// Containers on `source` eligible for a move this iteration, ordered
    /// by descending size, ties broken by container id. Containers the
    /// catalogue no longer knows are skipped with a warning.
    pub async fn candidate_containers(
        &self,
        source: NodeId,
        selected: &BTreeSet<ContainerId>,
        source_strategy: &FindSourceGreedy,
    ) -> Vec<ContainerInfo> {
        let ids = match self.node_manager.containers_on(source).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(node = %source, error = %err, "could not list containers on node");
                return Vec::new();
            }
        };

        let mut candidates = Vec::new();
        for id in ids {
            if selected.contains(&id) {
                continue;
            }
            let info = match self.container_manager.get_container(id).await {
                Ok(info) => info,
                Err(err) => {
                    warn!(container = %id, error = %err, "container missing during selection");
                    continue;
                }
            };
            if !info.state.is_movable() {
                continue;
            }
            if !info.is_fully_replicated() {
                debug!(
                    container = %id,
                    replicas = info.replicas.len(),
                    factor = info.replication_factor,
                    "skipping container that is not at its replication factor"
                );
                continue;
            }
            if !source_strategy.can_size_leave_source(source, info.used_bytes) {
                continue;
            }
            if self.replication.is_replicating(id).await {
                continue;
            }
            candidates.push(info);
        }

        candidates.sort_by(|a, b| b.used_bytes.cmp(&a.used_bytes).then_with(|| a.id.cmp(&b.id)));
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCluster;
    use strata_core::{ContainerState, GB};

    fn strategy_for(cluster: &SimCluster, source: NodeId) -> FindSourceGreedy {
        let over = cluster.usage_of(source);
        FindSourceGreedy::new(vec![over], 26 * GB, 0.0)
    }

    #[tokio::test]
    async fn test_candidates_largest_first() {
        let cluster = SimCluster::new();
        let source = cluster.add_node("dn-1", 100 * GB, 0);
        let small = cluster.add_container(2 * GB, &[source], ContainerState::Closed);
        let large = cluster.add_container(4 * GB, &[source], ContainerState::Closed);

        let criteria = SelectionCriteria::new(
            cluster.node_manager(),
            cluster.container_manager(),
            cluster.replication(),
        );
        let strategy = strategy_for(&cluster, source);
        let candidates = criteria
            .candidate_containers(source, &BTreeSet::new(), &strategy)
            .await;
        let ids: Vec<ContainerId> = candidates.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![large, small]);
    }

    #[tokio::test]
    async fn test_open_and_selected_containers_are_skipped() {
        let cluster = SimCluster::new();
        let source = cluster.add_node("dn-1", 100 * GB, 0);
        let open = cluster.add_container(2 * GB, &[source], ContainerState::Open);
        let picked = cluster.add_container(2 * GB, &[source], ContainerState::Closed);
        let eligible = cluster.add_container(2 * GB, &[source], ContainerState::Closed);

        let criteria = SelectionCriteria::new(
            cluster.node_manager(),
            cluster.container_manager(),
            cluster.replication(),
        );
        let strategy = strategy_for(&cluster, source);
        let mut selected = BTreeSet::new();
        selected.insert(picked);
        let candidates = criteria
            .candidate_containers(source, &selected, &strategy)
            .await;
        let ids: Vec<ContainerId> = candidates.iter().map(|c| c.id).collect();
        assert!(!ids.contains(&open));
        assert!(!ids.contains(&picked));
        assert_eq!(ids, vec![eligible]);
    }

    #[tokio::test]
    async fn test_under_replicated_container_is_skipped() {
        let cluster = SimCluster::new();
        let source = cluster.add_node("dn-1", 100 * GB, 0);
        let id = cluster.add_container(2 * GB, &[source], ContainerState::Closed);
        cluster.set_replication_factor(id, 3);

        let criteria = SelectionCriteria::new(
            cluster.node_manager(),
            cluster.container_manager(),
            cluster.replication(),
        );
        let strategy = strategy_for(&cluster, source);
        let candidates = criteria
            .candidate_containers(source, &BTreeSet::new(), &strategy)
            .await;
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_leaving_cap_filters_large_containers() {
        let cluster = SimCluster::new();
        let source = cluster.add_node("dn-1", 100 * GB, 0);
        let big = cluster.add_container(30 * GB, &[source], ContainerState::Closed);
        let ok = cluster.add_container(5 * GB, &[source], ContainerState::Closed);

        let criteria = SelectionCriteria::new(
            cluster.node_manager(),
            cluster.container_manager(),
            cluster.replication(),
        );
        let strategy = strategy_for(&cluster, source);
        let candidates = criteria
            .candidate_containers(source, &BTreeSet::new(), &strategy)
            .await;
        let ids: Vec<ContainerId> = candidates.iter().map(|c| c.id).collect();
        assert!(!ids.contains(&big));
        assert_eq!(ids, vec![ok]);
    }
}
