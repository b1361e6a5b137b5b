//! In-memory cluster
//!
//! A small, fully deterministic cluster implementing every collaborator
//! trait. The service binary uses it for its simulation mode and the test
//! suite drives the balancer against it. Completed moves really move
//! bytes: replica sets and node usage are updated, so multi-iteration runs
//! converge the way a live cluster would.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use strata_core::{
    ContainerId, ContainerInfo, ContainerState, NodeDescriptor, NodeId, NodeUsage, Result,
    StrataError,
};

use crate::cluster::{
    ClusterContext, ClusterHandles, ContainerManager, MoveOutcome, NetworkTopology, NodeManager,
    PlacementPolicy, ReplicationClient,
};

/// How the simulated replication engine should handle a move.
#[derive(Debug, Clone)]
pub struct MovePlan {
    pub delay: Duration,
    /// `None` means the move never resolves on its own.
    pub outcome: Option<MoveOutcome>,
}

impl Default for MovePlan {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Some(MoveOutcome::Completed),
        }
    }
}

impl MovePlan {
    /// A move that hangs until cancelled.
    pub fn never() -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: None,
        }
    }

    pub fn after(delay: Duration, outcome: MoveOutcome) -> Self {
        Self {
            delay,
            outcome: Some(outcome),
        }
    }
}

type MoveKey = (ContainerId, NodeId, NodeId);

struct SimInner {
    nodes: RwLock<BTreeMap<NodeId, NodeUsage>>,
    containers: RwLock<BTreeMap<ContainerId, ContainerInfo>>,
    racks: RwLock<HashMap<NodeId, u32>>,
    rejected_targets: RwLock<HashSet<NodeId>>,
    move_plans: RwLock<HashMap<ContainerId, MovePlan>>,
    replicating: RwLock<HashSet<ContainerId>>,
    /// Senders for moves that never resolve on their own.
    parked_moves: RwLock<HashMap<MoveKey, oneshot::Sender<MoveOutcome>>>,
    cancelled: RwLock<Vec<ContainerId>>,
    begun: AtomicU64,
    gate_waiters: AtomicU64,
    node_seq: AtomicU64,
    container_seq: AtomicU64,
    leader: AtomicBool,
    leader_ready: AtomicBool,
    safe_mode: AtomicBool,
    node_manager_down: AtomicBool,
    /// While true, `begin_move` blocks. Lets tests stop the balancer at a
    /// known point inside the matching loop.
    move_gate: watch::Sender<bool>,
}

/// Cheap cloneable handle to the simulated cluster.
#[derive(Clone)]
pub struct SimCluster {
    inner: Arc<SimInner>,
}

impl Default for SimCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCluster {
    pub fn new() -> Self {
        let (move_gate, _) = watch::channel(false);
        Self {
            inner: Arc::new(SimInner {
                nodes: RwLock::new(BTreeMap::new()),
                containers: RwLock::new(BTreeMap::new()),
                racks: RwLock::new(HashMap::new()),
                rejected_targets: RwLock::new(HashSet::new()),
                move_plans: RwLock::new(HashMap::new()),
                replicating: RwLock::new(HashSet::new()),
                parked_moves: RwLock::new(HashMap::new()),
                cancelled: RwLock::new(Vec::new()),
                begun: AtomicU64::new(0),
                gate_waiters: AtomicU64::new(0),
                node_seq: AtomicU64::new(0),
                container_seq: AtomicU64::new(0),
                leader: AtomicBool::new(true),
                leader_ready: AtomicBool::new(true),
                safe_mode: AtomicBool::new(false),
                node_manager_down: AtomicBool::new(false),
                move_gate,
            }),
        }
    }

    /// Add a node with the given capacity and baseline (non-container)
    /// used bytes. Node ids are sequential so runs are reproducible.
    pub fn add_node(&self, hostname: &str, capacity: u64, used: u64) -> NodeId {
        let seq = self.inner.node_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = NodeId::from_uuid(Uuid::from_u128(seq as u128));
        let descriptor = NodeDescriptor::new(id, hostname, format!("10.0.0.{seq}"));
        let usage = NodeUsage {
            node: descriptor,
            capacity,
            used,
            remaining: capacity.saturating_sub(used),
        };
        self.inner.nodes.write().unwrap().insert(id, usage);
        id
    }

    /// Add a container replicated on the given nodes. Each replica's used
    /// bytes grow accordingly. The replication factor is the replica
    /// count, so the container starts out fully replicated.
    pub fn add_container(
        &self,
        used_bytes: u64,
        replicas: &[NodeId],
        state: ContainerState,
    ) -> ContainerId {
        let seq = self.inner.container_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = ContainerId::new(seq);
        let info = ContainerInfo {
            id,
            used_bytes,
            replicas: replicas.iter().copied().collect(),
            state,
            replication_factor: replicas.len(),
        };
        self.inner.containers.write().unwrap().insert(id, info);

        let mut nodes = self.inner.nodes.write().unwrap();
        for replica in replicas {
            if let Some(usage) = nodes.get_mut(replica) {
                usage.used += used_bytes;
                usage.remaining = usage.remaining.saturating_sub(used_bytes);
            }
        }
        id
    }

    pub fn set_replication_factor(&self, container: ContainerId, factor: usize) {
        if let Some(info) = self.inner.containers.write().unwrap().get_mut(&container) {
            info.replication_factor = factor;
        }
    }

    pub fn set_move_plan(&self, container: ContainerId, plan: MovePlan) {
        self.inner.move_plans.write().unwrap().insert(container, plan);
    }

    pub fn set_leader(&self, leader: bool) {
        self.inner.leader.store(leader, Ordering::Relaxed);
    }

    pub fn set_leader_ready(&self, ready: bool) {
        self.inner.leader_ready.store(ready, Ordering::Relaxed);
    }

    pub fn set_safe_mode(&self, safe_mode: bool) {
        self.inner.safe_mode.store(safe_mode, Ordering::Relaxed);
    }

    /// Simulate the node manager being unreachable: snapshots come back
    /// empty.
    pub fn set_node_manager_down(&self, down: bool) {
        self.inner.node_manager_down.store(down, Ordering::Relaxed);
    }

    /// Make the placement policy reject any replica set containing the
    /// node.
    pub fn reject_target(&self, node: NodeId) {
        self.inner.rejected_targets.write().unwrap().insert(node);
    }

    pub fn set_rack(&self, node: NodeId, rack: u32) {
        self.inner.racks.write().unwrap().insert(node, rack);
    }

    /// While gated, `begin_move` blocks until the gate opens.
    pub fn set_move_gate(&self, gated: bool) {
        self.inner.move_gate.send_replace(gated);
    }

    pub fn usage_of(&self, node: NodeId) -> NodeUsage {
        self.inner.nodes.read().unwrap()[&node].clone()
    }

    pub fn replicas_of(&self, container: ContainerId) -> BTreeSet<NodeId> {
        self.inner.containers.read().unwrap()[&container]
            .replicas
            .clone()
    }

    /// Containers whose move was cooperatively cancelled.
    pub fn cancelled_moves(&self) -> Vec<ContainerId> {
        self.inner.cancelled.read().unwrap().clone()
    }

    /// How many moves the engine was asked to begin.
    pub fn begun_moves(&self) -> u64 {
        self.inner.begun.load(Ordering::Relaxed)
    }

    /// Number of callers currently parked at the move gate.
    pub fn gate_waiters(&self) -> u64 {
        self.inner.gate_waiters.load(Ordering::Relaxed)
    }

    pub fn node_manager(&self) -> Arc<dyn NodeManager> {
        Arc::new(self.clone())
    }

    pub fn container_manager(&self) -> Arc<dyn ContainerManager> {
        Arc::new(self.clone())
    }

    pub fn replication(&self) -> Arc<dyn ReplicationClient> {
        Arc::new(self.clone())
    }

    pub fn placement(&self) -> Arc<dyn PlacementPolicy> {
        Arc::new(self.clone())
    }

    pub fn topology(&self) -> Arc<dyn NetworkTopology> {
        Arc::new(self.clone())
    }

    pub fn context(&self) -> Arc<dyn ClusterContext> {
        Arc::new(self.clone())
    }

    pub fn handles(&self) -> ClusterHandles {
        ClusterHandles {
            node_manager: self.node_manager(),
            container_manager: self.container_manager(),
            replication: self.replication(),
            placement: self.placement(),
            topology: self.topology(),
            context: self.context(),
        }
    }

    fn rack_of(&self, node: NodeId) -> u32 {
        self.inner.racks.read().unwrap().get(&node).copied().unwrap_or(0)
    }

    /// Resolve a move: apply it to the cluster state if completed, then
    /// deliver the outcome.
    fn finish_move(inner: &SimInner, key: MoveKey, outcome: MoveOutcome, tx: oneshot::Sender<MoveOutcome>) {
        let (container, source, target) = key;
        let outcome = if outcome == MoveOutcome::Completed {
            Self::apply_move(inner, container, source, target)
        } else {
            outcome
        };
        inner.replicating.write().unwrap().remove(&container);
        let _ = tx.send(outcome);
    }

    /// Move the replica and the bytes. If the source no longer holds a
    /// replica the container has been replaced under us.
    fn apply_move(
        inner: &SimInner,
        container: ContainerId,
        source: NodeId,
        target: NodeId,
    ) -> MoveOutcome {
        let mut containers = inner.containers.write().unwrap();
        let Some(info) = containers.get_mut(&container) else {
            return MoveOutcome::Failed(format!("container {container} vanished"));
        };
        if !info.replicas.remove(&source) {
            return MoveOutcome::Replaced;
        }
        info.replicas.insert(target);
        let bytes = info.used_bytes;
        drop(containers);

        let mut nodes = inner.nodes.write().unwrap();
        if let Some(usage) = nodes.get_mut(&source) {
            usage.used = usage.used.saturating_sub(bytes);
            usage.remaining += bytes;
        }
        if let Some(usage) = nodes.get_mut(&target) {
            usage.used += bytes;
            usage.remaining = usage.remaining.saturating_sub(bytes);
        }
        MoveOutcome::Completed
    }
}

#[async_trait]
impl NodeManager for SimCluster {
    async fn most_used_first(&self) -> Vec<NodeUsage> {
        if self.inner.node_manager_down.load(Ordering::Relaxed) {
            return Vec::new();
        }
        let mut nodes: Vec<NodeUsage> =
            self.inner.nodes.read().unwrap().values().cloned().collect();
        nodes.sort_by(|a, b| {
            b.utilization()
                .partial_cmp(&a.utilization())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id().cmp(&b.id()))
        });
        nodes
    }

    async fn refresh_all_healthy_node_usage(&self) {
        // usage is always current in the simulation
    }

    async fn exists(&self, node: NodeId) -> bool {
        self.inner.nodes.read().unwrap().contains_key(&node)
    }

    async fn containers_on(&self, node: NodeId) -> Result<BTreeSet<ContainerId>> {
        Ok(self
            .inner
            .containers
            .read()
            .unwrap()
            .values()
            .filter(|info| info.replicas.contains(&node))
            .map(|info| info.id)
            .collect())
    }
}

#[async_trait]
impl ContainerManager for SimCluster {
    async fn get_container(&self, id: ContainerId) -> Result<ContainerInfo> {
        self.inner
            .containers
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StrataError::ContainerNotFound(id))
    }
}

#[async_trait]
impl ReplicationClient for SimCluster {
    async fn begin_move(
        &self,
        container: ContainerId,
        source: NodeId,
        target: NodeId,
    ) -> Result<oneshot::Receiver<MoveOutcome>> {
        let mut gate = self.inner.move_gate.subscribe();
        if *gate.borrow() {
            self.inner.gate_waiters.fetch_add(1, Ordering::Relaxed);
            let _ = gate.wait_for(|gated| !*gated).await;
            self.inner.gate_waiters.fetch_sub(1, Ordering::Relaxed);
        }

        self.inner.begun.fetch_add(1, Ordering::Relaxed);
        if !self.inner.containers.read().unwrap().contains_key(&container) {
            return Err(StrataError::ContainerNotFound(container));
        }
        {
            let nodes = self.inner.nodes.read().unwrap();
            for node in [source, target] {
                if !nodes.contains_key(&node) {
                    return Err(StrataError::NodeNotFound(node));
                }
            }
        }

        let plan = self
            .inner
            .move_plans
            .read()
            .unwrap()
            .get(&container)
            .cloned()
            .unwrap_or_default();
        self.inner.replicating.write().unwrap().insert(container);

        let key = (container, source, target);
        let (tx, rx) = oneshot::channel();
        match plan.outcome {
            None => {
                self.inner.parked_moves.write().unwrap().insert(key, tx);
            }
            Some(outcome) if plan.delay.is_zero() => {
                SimCluster::finish_move(&self.inner, key, outcome, tx);
            }
            Some(outcome) => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(plan.delay).await;
                    SimCluster::finish_move(&inner, key, outcome, tx);
                });
            }
        }
        Ok(rx)
    }

    async fn cancel_move(&self, container: ContainerId, source: NodeId, target: NodeId) {
        self.inner
            .parked_moves
            .write()
            .unwrap()
            .remove(&(container, source, target));
        self.inner.replicating.write().unwrap().remove(&container);
        self.inner.cancelled.write().unwrap().push(container);
    }

    async fn is_replicating(&self, container: ContainerId) -> bool {
        self.inner.replicating.read().unwrap().contains(&container)
    }
}

impl PlacementPolicy for SimCluster {
    fn validate(&self, replicas: &BTreeSet<NodeId>) -> bool {
        if replicas.is_empty() {
            return false;
        }
        let rejected = self.inner.rejected_targets.read().unwrap();
        !replicas.iter().any(|node| rejected.contains(node))
    }
}

impl NetworkTopology for SimCluster {
    fn same_rack(&self, a: NodeId, b: NodeId) -> bool {
        self.rack_of(a) == self.rack_of(b)
    }

    fn rack_distance(&self, a: NodeId, b: NodeId) -> u32 {
        self.rack_of(a).abs_diff(self.rack_of(b))
    }
}

impl ClusterContext for SimCluster {
    fn is_leader(&self) -> bool {
        self.inner.leader.load(Ordering::Relaxed)
    }

    fn is_leader_ready(&self) -> bool {
        self.inner.leader_ready.load(Ordering::Relaxed)
    }

    fn is_in_safe_mode(&self) -> bool {
        self.inner.safe_mode.load(Ordering::Relaxed)
    }
}

/// Placement policy that accepts any non-empty replica set.
pub struct AcceptAllPlacement;

impl PlacementPolicy for AcceptAllPlacement {
    fn validate(&self, replicas: &BTreeSet<NodeId>) -> bool {
        !replicas.is_empty()
    }
}
