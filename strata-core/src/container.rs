//! Container identity and placement
//!
//! A container is a fixed-maximum-size unit of storage replicated across a
//! set of data nodes. The balancer moves whole container replicas; only
//! sealed or closed containers may move.

use std::collections::BTreeSet;
use std::fmt;

use crate::node::NodeId;

/// Opaque stable identifier for a container. Ids are issued from the
/// container manager's monotonic sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(u64);

impl ContainerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Accepting writes.
    Open,
    /// Writes fenced, replicas converging.
    Closing,
    /// Immutable, but not all replicas have acknowledged the seal.
    Sealed,
    /// Immutable on every replica.
    Closed,
    /// Being removed.
    Deleting,
}

impl ContainerState {
    /// Only immutable containers may be moved between nodes.
    pub fn is_movable(&self) -> bool {
        matches!(self, ContainerState::Sealed | ContainerState::Closed)
    }
}

/// Container metadata as known to the container manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub used_bytes: u64,
    pub replicas: BTreeSet<NodeId>,
    pub state: ContainerState,
    /// Configured replication factor for this container.
    pub replication_factor: usize,
}

impl ContainerInfo {
    /// Whether the container currently has exactly as many replicas as
    /// configured. Under- and over-replicated containers are the
    /// replication engine's problem, not the balancer's.
    pub fn is_fully_replicated(&self) -> bool {
        self.replicas.len() == self.replication_factor
    }
}
