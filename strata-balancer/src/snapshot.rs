//! Usage snapshot
//!
//! Builds the per-iteration view of the fleet: usage reports for every
//! in-service healthy node, ranked most used first, with the configured
//! include/exclude filters applied. The snapshot is immutable for the
//! duration of an iteration; the next iteration rebuilds it from scratch.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use strata_core::{NodeDescriptor, NodeUsage};

use crate::cluster::NodeManager;
use crate::service::StopHandle;

/// Hostname/IP filter over the fleet.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl NodeFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    /// Whether the node participates in balancing. Excluded nodes never do;
    /// with a non-empty include list, only listed nodes do.
    pub fn admits(&self, node: &NodeDescriptor) -> bool {
        if self.exclude.iter().any(|entry| node.matches(entry)) {
            return false;
        }
        if !self.include.is_empty() {
            return self.include.iter().any(|entry| node.matches(entry));
        }
        true
    }
}

/// Pulls ranked usage snapshots from the node manager.
pub struct UsageCollector {
    node_manager: Arc<dyn NodeManager>,
    filter: NodeFilter,
}

impl UsageCollector {
    pub fn new(node_manager: Arc<dyn NodeManager>, filter: NodeFilter) -> Self {
        Self {
            node_manager,
            filter,
        }
    }

    /// Snapshot the fleet, most used first. Empty means the node manager
    /// has nothing to report and balancing cannot proceed right now.
    pub async fn snapshot(&self) -> Vec<NodeUsage> {
        let mut nodes = self.node_manager.most_used_first().await;
        let before = nodes.len();
        nodes.retain(|usage| self.filter.admits(&usage.node));
        if nodes.len() < before {
            debug!(
                admitted = nodes.len(),
                filtered = before - nodes.len(),
                "node filter applied to usage snapshot"
            );
        }
        nodes
    }

    /// Ask every healthy node to recompute its disk usage, then wait long
    /// enough for fresh reports to land: one report interval to dispatch
    /// the command, one for the nodes to run it, one for them to report
    /// back. Returns false if the balancer was stopped during the wait.
    pub async fn refresh_and_wait(
        &self,
        node_report_interval: Duration,
        stop: &StopHandle,
    ) -> bool {
        info!("triggering disk-usage refresh on all healthy nodes");
        self.node_manager.refresh_all_healthy_node_usage().await;
        stop.sleep(3 * node_report_interval).await
    }
}
