//! Iteration engine
//!
//! Orchestrates one balancing pass: snapshot the fleet, classify nodes
//! against the balanced band around the cluster average, greedily match
//! over-utilized sources with under-utilized targets until a cap trips,
//! submit the moves, then collect their outcomes under the move deadline.
//!
//! All iteration state lives on the stack of `run_iteration` and dies with
//! it; the next iteration starts from a fresh snapshot. That is what makes
//! retry trivial: nothing is retried within an iteration, everything is
//! reconsidered by the next one.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use strata_core::{ratio_to_bytes, ContainerId, NodeId, NodeUsage, GB};

use crate::cluster::{ClusterHandles, MoveOutcome};
use crate::config::BalancerConfig;
use crate::find_source::FindSourceGreedy;
use crate::find_target::{
    FindTargetByTopology, FindTargetByUsage, FindTargetStrategy, MoveSelection,
};
use crate::metrics::BalancerMetrics;
use crate::selection::SelectionCriteria;
use crate::service::StopHandle;
use crate::snapshot::{NodeFilter, UsageCollector};
use crate::tracker::{MoveKey, MoveTracker};

/// How an iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationResult {
    /// Moves were scheduled and their outcomes collected.
    Completed,
    /// The balancer was stopped while the iteration was running.
    Interrupted,
    /// No move could be generated; the cluster is as balanced as the
    /// current policy can make it.
    CannotBalance,
}

/// Why an iteration could not start.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IterationError {
    #[error("this instance is not the leader")]
    NotLeader,

    #[error("cluster is in safe mode")]
    SafeMode,

    #[error("usage snapshot unavailable")]
    SnapshotUnavailable,
}

/// One move the iteration decided on, in generation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledMove {
    pub container: ContainerId,
    pub source: NodeId,
    pub target: NodeId,
    pub bytes: u64,
}

/// What an iteration did, for logs and tests.
#[derive(Debug)]
pub struct IterationReport {
    pub result: IterationResult,
    pub moves: Vec<ScheduledMove>,
    pub size_moved: u64,
    pub datanodes_involved: usize,
    pub over_utilized: usize,
    pub under_utilized: usize,
}

impl IterationReport {
    fn empty(result: IterationResult) -> Self {
        Self {
            result,
            moves: Vec::new(),
            size_moved: 0,
            datanodes_involved: 0,
            over_utilized: 0,
            under_utilized: 0,
        }
    }
}

pub struct IterationEngine {
    config: BalancerConfig,
    metrics: Arc<BalancerMetrics>,
    cluster: ClusterHandles,
    collector: UsageCollector,
}

impl IterationEngine {
    pub fn new(
        config: BalancerConfig,
        metrics: Arc<BalancerMetrics>,
        cluster: ClusterHandles,
    ) -> Self {
        let filter = NodeFilter::new(config.include_nodes.clone(), config.exclude_nodes.clone());
        let collector = UsageCollector::new(cluster.node_manager.clone(), filter);
        Self {
            config,
            metrics,
            cluster,
            collector,
        }
    }

    /// Run one balancing iteration.
    ///
    /// Errors mean the iteration could not even start; the service decides
    /// whether that stops the balancer or is retried next interval.
    #[instrument(skip(self, stop))]
    pub async fn run_iteration(
        &self,
        stop: &StopHandle,
    ) -> Result<IterationReport, IterationError> {
        if self.cluster.context.is_in_safe_mode() {
            error!("balancer cannot operate while the cluster is in safe mode");
            return Err(IterationError::SafeMode);
        }
        if !self.cluster.context.is_leader() {
            warn!("this instance is not the leader");
            return Err(IterationError::NotLeader);
        }

        self.metrics.reset_latest_iteration();

        if self.config.trigger_du_enable {
            // aggressive: every node re-runs du before we look. Worth it
            // when usage reports are too coarse for good decisions.
            if !self
                .collector
                .refresh_and_wait(self.config.node_report_interval, stop)
                .await
            {
                info!("interrupted while waiting for disk-usage refresh");
                return Ok(IterationReport::empty(IterationResult::Interrupted));
            }
        }

        let snapshot = self.collector.snapshot().await;
        if snapshot.is_empty() {
            warn!("no usage reports available from the node manager");
            return Err(IterationError::SnapshotUnavailable);
        }

        let Some(bands) = self.classify(&snapshot, stop) else {
            return Ok(IterationReport::empty(IterationResult::Interrupted));
        };
        if bands.over.is_empty() && bands.under.is_empty() {
            info!("no unbalanced datanodes found");
            return Ok(IterationReport::empty(IterationResult::CannotBalance));
        }
        info!(
            over_utilized = bands.over.len(),
            under_utilized = bands.under.len(),
            "identified datanodes that need balancing"
        );

        self.match_and_move(snapshot.len(), bands, stop).await
    }

    /// Split the snapshot into over-/under-/within-threshold bands around
    /// the cluster average utilization. Returns `None` when stopped
    /// mid-scan.
    fn classify(&self, snapshot: &[NodeUsage], stop: &StopHandle) -> Option<Bands> {
        let capacity: u64 = snapshot.iter().map(|u| u.capacity).sum();
        let remaining: u64 = snapshot.iter().map(|u| u.remaining).sum();
        let cluster_avg = if capacity == 0 {
            0.0
        } else {
            (capacity - remaining) as f64 / capacity as f64
        };
        let upper_limit = cluster_avg + self.config.threshold;
        let lower_limit = cluster_avg - self.config.threshold;
        debug!(
            cluster_avg,
            lower_limit, upper_limit, "utilization band for this iteration"
        );

        let mut bands = Bands {
            over: Vec::new(),
            under: Vec::new(),
            within: Vec::new(),
            upper_limit,
        };
        let mut over_bytes: i64 = 0;
        let mut under_bytes: i64 = 0;

        for usage in snapshot {
            if !stop.is_running() {
                return None;
            }
            let utilization = usage.utilization();
            debug!(
                node = %usage.id(),
                capacity = usage.capacity,
                used = usage.used,
                remaining = usage.remaining,
                utilization,
                "node utilization"
            );
            if utilization > upper_limit {
                self.metrics.increment_datanodes_unbalanced(1);
                over_bytes += (ratio_to_bytes(usage.capacity, utilization)
                    - ratio_to_bytes(usage.capacity, upper_limit))
                .max(0);
                bands.over.push(usage.clone());
            } else if utilization < lower_limit {
                self.metrics.increment_datanodes_unbalanced(1);
                under_bytes += (ratio_to_bytes(usage.capacity, lower_limit)
                    - ratio_to_bytes(usage.capacity, utilization))
                .max(0);
                bands.under.push(usage.clone());
            } else {
                bands.within.push(usage.clone());
            }
        }
        self.metrics
            .set_data_unbalanced_gb(over_bytes.max(under_bytes) as u64 / GB);

        // the snapshot is most-used first, so the under-utilized band ends
        // up least-used first after reversal
        bands.under.reverse();
        Some(bands)
    }

    /// The matching loop plus outcome collection.
    async fn match_and_move(
        &self,
        total_nodes: usize,
        bands: Bands,
        stop: &StopHandle,
    ) -> Result<IterationReport, IterationError> {
        let over_count = bands.over.len();
        let under_count = bands.under.len();

        let mut source_strategy = FindSourceGreedy::new(
            bands.over,
            self.config.max_size_leaving_source,
            bands.upper_limit,
        );
        let mut target_strategy: Box<dyn FindTargetStrategy> =
            if self.config.network_topology_enable {
                Box::new(FindTargetByTopology::new(
                    bands.under,
                    bands.upper_limit,
                    self.config.max_size_entering_target,
                    self.cluster.placement.clone(),
                    self.cluster.topology.clone(),
                ))
            } else {
                Box::new(FindTargetByUsage::new(
                    bands.under,
                    bands.upper_limit,
                    self.config.max_size_entering_target,
                    self.cluster.placement.clone(),
                ))
            };
        let criteria = SelectionCriteria::new(
            self.cluster.node_manager.clone(),
            self.cluster.container_manager.clone(),
            self.cluster.replication.clone(),
        );
        let mut tracker = MoveTracker::new(self.cluster.replication.clone());

        let max_datanodes_to_involve = (self.config.max_datanodes_ratio_to_involve_per_iteration
            * total_nodes as f64) as usize;

        let mut selected_containers: BTreeSet<ContainerId> = BTreeSet::new();
        let mut selected_targets: HashSet<NodeId> = HashSet::new();
        let mut source_to_target: HashMap<NodeId, MoveSelection> = HashMap::new();
        let mut move_sizes: HashMap<MoveKey, u64> = HashMap::new();
        let mut moves: Vec<ScheduledMove> = Vec::new();
        let mut datanodes_involved = 0usize;
        let mut size_moved = 0u64;
        let mut result = IterationResult::Completed;

        loop {
            if !stop.is_running() {
                result = IterationResult::Interrupted;
                break;
            }
            // +2 reserves room for the next source/target pair
            if datanodes_involved + 2 > max_datanodes_to_involve {
                debug!(
                    datanodes_involved,
                    max_datanodes_to_involve, "hit max datanodes to involve"
                );
                break;
            }
            if size_moved + self.config.container_size > self.config.max_size_to_move_per_iteration
            {
                debug!(
                    size_moved,
                    max = self.config.max_size_to_move_per_iteration,
                    "hit max size to move"
                );
                break;
            }

            let Some(source) = source_strategy.next_candidate() else {
                break;
            };

            let candidates = criteria
                .candidate_containers(source, &selected_containers, &source_strategy)
                .await;
            if candidates.is_empty() {
                debug!(node = %source, "no candidate containers on source");
                source_strategy.remove_candidate(source);
                continue;
            }

            let Some(selection) = target_strategy.find_target(source, &candidates) else {
                debug!(node = %source, "no suitable target for source");
                source_strategy.remove_candidate(source);
                continue;
            };
            let Some(container) = candidates.iter().find(|c| c.id == selection.container) else {
                warn!(container = %selection.container, "selected container vanished");
                source_strategy.remove_candidate(source);
                continue;
            };
            let bytes = container.used_bytes;
            let target = selection.target;

            if !self.cluster.node_manager.exists(source).await
                || !self.cluster.node_manager.exists(target).await
            {
                warn!(
                    source = %source,
                    target = %target,
                    "node disappeared while matching"
                );
                source_strategy.remove_candidate(source);
                continue;
            }

            info!(
                container = %selection.container,
                source = %source,
                target = %target,
                bytes,
                "scheduling container move"
            );

            // record intent before handing off to the replication engine
            selected_containers.insert(selection.container);
            if source_to_target
                .insert(source, selection.clone())
                .is_none()
            {
                datanodes_involved += 1;
            }
            if selected_targets.insert(target) {
                datanodes_involved += 1;
            }
            source_strategy.increase_leaving(source, bytes);
            target_strategy.increase_entering(target, bytes);
            size_moved += bytes;
            move_sizes.insert((selection.container, source, target), bytes);
            moves.push(ScheduledMove {
                container: selection.container,
                source,
                target,
                bytes,
            });

            tracker.submit(selection.container, source, target).await;
        }

        if moves.is_empty() {
            info!("no move generated this iteration");
            return Ok(IterationReport {
                result: IterationResult::CannotBalance,
                moves,
                size_moved,
                datanodes_involved,
                over_utilized: over_count,
                under_utilized: under_count,
            });
        }

        if result != IterationResult::Interrupted {
            self.collect_outcomes(&mut tracker, &move_sizes).await;
            self.metrics
                .set_datanodes_involved_latest(datanodes_involved as u64);
            self.metrics.roll_up_latest_iteration();
            info!(
                datanodes_involved,
                size_moved_gb = self.metrics.data_moved_gb_latest(),
                "iteration finished"
            );
        }

        Ok(IterationReport {
            result,
            moves,
            size_moved,
            datanodes_involved,
            over_utilized: over_count,
            under_utilized: under_count,
        })
    }

    /// Drain move outcomes under the configured deadline and tally them.
    async fn collect_outcomes(
        &self,
        tracker: &mut MoveTracker,
        move_sizes: &HashMap<MoveKey, u64>,
    ) {
        let outcomes = tracker.await_all(self.config.move_timeout).await;
        for (key, outcome) in outcomes {
            let (container, _, target) = key;
            match outcome {
                MoveOutcome::Completed => {
                    self.metrics.increment_moves_completed_latest(1);
                    let bytes = move_sizes.get(&key).copied().unwrap_or(0);
                    self.metrics.increment_data_moved_gb_latest(bytes / GB);
                    debug!(container = %container, target = %target, "container move completed");
                }
                MoveOutcome::TimedOut => {
                    self.metrics.increment_moves_timeout_latest(1);
                }
                MoveOutcome::Failed(reason) => {
                    warn!(
                        container = %container,
                        target = %target,
                        reason,
                        "container move failed"
                    );
                }
                other => {
                    warn!(
                        container = %container,
                        target = %target,
                        outcome = ?other,
                        "container move did not complete"
                    );
                }
            }
        }
    }
}

/// Classified snapshot plus the utilization band it was classified
/// against.
struct Bands {
    over: Vec<NodeUsage>,
    under: Vec<NodeUsage>,
    // TODO: widen the source/target candidate pools with the
    // within-threshold band once the strategies can rank mixed pools
    #[allow(dead_code)]
    within: Vec<NodeUsage>,
    upper_limit: f64,
}
