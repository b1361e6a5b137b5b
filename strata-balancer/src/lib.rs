//! Strata Container Balancer Library
//!
//! This crate provides the container balancer service for the Strata
//! distributed object store. The balancer continuously evens out storage
//! utilization across the data-node fleet by moving container replicas
//! from over-utilized to under-utilized nodes, one bounded iteration at a
//! time:
//! - Usage snapshot and node classification against the balanced band
//! - Greedy source/target matching under per-iteration safety caps
//! - Asynchronous move tracking with a deadline and cooperative cancel
//! - Leader and safe-mode gating of the whole service

pub mod cluster;
pub mod config;
pub mod find_source;
pub mod find_target;
pub mod iteration;
pub mod metrics;
pub mod selection;
pub mod service;
pub mod sim;
pub mod snapshot;
pub mod tracker;

// Re-export main types
pub use cluster::{
    ClusterContext, ClusterHandles, ContainerManager, MoveOutcome, NetworkTopology, NodeManager,
    PlacementPolicy, ReplicationClient,
};
pub use config::{BalancerConfig, ConfigError};
pub use find_source::FindSourceGreedy;
pub use find_target::{
    FindTargetByTopology, FindTargetByUsage, FindTargetStrategy, MoveSelection,
};
pub use iteration::{
    IterationEngine, IterationError, IterationReport, IterationResult, ScheduledMove,
};
pub use metrics::BalancerMetrics;
pub use selection::SelectionCriteria;
pub use service::{ratio_to_percent, BalancerError, ContainerBalancer, StopHandle};
pub use snapshot::{NodeFilter, UsageCollector};
pub use tracker::MoveTracker;
