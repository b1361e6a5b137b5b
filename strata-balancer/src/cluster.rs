//! Collaborator interfaces
//!
//! The balancer is a pure control loop: everything that touches cluster
//! state goes through the traits in this module. Production wires them to
//! the node manager, container manager, replication engine, placement
//! policy, network topology, and the surrounding manager context; the test
//! suite and the binary's simulation mode wire them to [`crate::sim`].

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use strata_core::{ContainerId, ContainerInfo, NodeId, NodeUsage, Result};

/// Final outcome of an asynchronous container move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The replica now lives on the target.
    Completed,
    /// The replication engine gave up.
    Failed(String),
    /// The balancer's deadline elapsed before the engine reported back.
    TimedOut,
    /// The move was cancelled before finishing.
    Cancelled,
    /// The container is no longer where the balancer thought it was.
    Replaced,
    /// The proposed placement was rejected when the engine re-validated it.
    PlacementInvalid,
}

/// Aggregated view of the data-node fleet.
#[async_trait]
pub trait NodeManager: Send + Sync {
    /// Usage reports for all in-service, healthy nodes, most used first.
    async fn most_used_first(&self) -> Vec<NodeUsage>;

    /// Ask every healthy node to recompute its disk usage. Fresh reports
    /// arrive asynchronously with the next node report.
    async fn refresh_all_healthy_node_usage(&self);

    /// Whether the node is currently registered.
    async fn exists(&self, node: NodeId) -> bool;

    /// Ids of the containers with a replica on the given node.
    async fn containers_on(&self, node: NodeId) -> Result<BTreeSet<ContainerId>>;
}

/// Catalogue of containers.
#[async_trait]
pub trait ContainerManager: Send + Sync {
    async fn get_container(&self, id: ContainerId) -> Result<ContainerInfo>;
}

/// Hand-off to the external replication engine, which performs the
/// physical data movement.
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    /// Start an asynchronous move of one container replica. The returned
    /// receiver resolves when the engine finishes or abandons the move.
    /// Synchronous rejections (unknown container or node) are returned as
    /// `Err` instead.
    async fn begin_move(
        &self,
        container: ContainerId,
        source: NodeId,
        target: NodeId,
    ) -> Result<oneshot::Receiver<MoveOutcome>>;

    /// Cooperatively cancel a move. Whether the physical transfer actually
    /// stops is the engine's concern.
    async fn cancel_move(&self, container: ContainerId, source: NodeId, target: NodeId);

    /// True while the engine has any operation in flight for the container.
    async fn is_replicating(&self, container: ContainerId) -> bool;
}

/// Cluster placement rules for container replicas.
pub trait PlacementPolicy: Send + Sync {
    /// Whether the proposed replica set satisfies the placement rules.
    fn validate(&self, replicas: &BTreeSet<NodeId>) -> bool;
}

/// Rack-level view of the cluster network.
pub trait NetworkTopology: Send + Sync {
    fn same_rack(&self, a: NodeId, b: NodeId) -> bool;

    /// Hop distance between the racks of two nodes; 0 for the same rack.
    fn rack_distance(&self, a: NodeId, b: NodeId) -> u32;
}

/// The set of collaborator handles the balancer operates through.
#[derive(Clone)]
pub struct ClusterHandles {
    pub node_manager: Arc<dyn NodeManager>,
    pub container_manager: Arc<dyn ContainerManager>,
    pub replication: Arc<dyn ReplicationClient>,
    pub placement: Arc<dyn PlacementPolicy>,
    pub topology: Arc<dyn NetworkTopology>,
    pub context: Arc<dyn ClusterContext>,
}

/// Leadership and safe-mode status of the surrounding manager. The context
/// outlives the balancer; the balancer only pulls status from it, and the
/// manager pushes transitions via
/// [`crate::service::ContainerBalancer::notify_status_changed`].
pub trait ClusterContext: Send + Sync {
    /// Whether this manager instance currently holds leadership.
    fn is_leader(&self) -> bool;

    /// Leadership plus a fully replayed state machine.
    fn is_leader_ready(&self) -> bool;

    /// Safe mode forbids all cluster-state writes.
    fn is_in_safe_mode(&self) -> bool;
}
