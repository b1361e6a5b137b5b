//! Balancer metrics
//!
//! Counters and gauges exported through the `metrics` facade. The values
//! the control loop needs to read back (the `*_latest` family and the
//! per-iteration gauges) are also kept as atomics on [`BalancerMetrics`];
//! every update is mirrored to the facade so a Prometheus exporter sees the
//! same numbers.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Metric names as constants
pub mod names {
    pub const NUM_ITERATIONS: &str = "strata_balancer_iterations_total";
    pub const MOVES_COMPLETED: &str = "strata_balancer_container_moves_completed_total";
    pub const MOVES_TIMEOUT: &str = "strata_balancer_container_moves_timeout_total";
    pub const DATA_MOVED_GB: &str = "strata_balancer_data_moved_gb_total";

    pub const MOVES_COMPLETED_LATEST: &str = "strata_balancer_container_moves_completed_latest";
    pub const MOVES_TIMEOUT_LATEST: &str = "strata_balancer_container_moves_timeout_latest";
    pub const DATANODES_INVOLVED_LATEST: &str = "strata_balancer_datanodes_involved_latest";
    pub const DATA_MOVED_GB_LATEST: &str = "strata_balancer_data_moved_gb_latest";

    pub const DATANODES_UNBALANCED: &str = "strata_balancer_datanodes_unbalanced";
    pub const DATA_UNBALANCED_GB: &str = "strata_balancer_data_unbalanced_gb";
}

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(names::NUM_ITERATIONS, "Balancer iterations run");
    describe_counter!(
        names::MOVES_COMPLETED,
        "Container moves completed over the balancer's lifetime"
    );
    describe_counter!(
        names::MOVES_TIMEOUT,
        "Container moves timed out over the balancer's lifetime"
    );
    describe_counter!(names::DATA_MOVED_GB, "Data moved over the balancer's lifetime, in GB");
    describe_gauge!(
        names::MOVES_COMPLETED_LATEST,
        "Container moves completed in the latest iteration"
    );
    describe_gauge!(
        names::MOVES_TIMEOUT_LATEST,
        "Container moves timed out in the latest iteration"
    );
    describe_gauge!(
        names::DATANODES_INVOLVED_LATEST,
        "Datanodes involved in the latest iteration"
    );
    describe_gauge!(
        names::DATA_MOVED_GB_LATEST,
        "Data moved in the latest iteration, in GB"
    );
    describe_gauge!(
        names::DATANODES_UNBALANCED,
        "Over- plus under-utilized datanodes found by the latest iteration"
    );
    describe_gauge!(
        names::DATA_UNBALANCED_GB,
        "Data that would have to move to balance the cluster, in GB"
    );
}

/// Readable metric state for the balancer.
#[derive(Debug, Default)]
pub struct BalancerMetrics {
    num_iterations: AtomicU64,
    moves_completed: AtomicU64,
    moves_timeout: AtomicU64,
    data_moved_gb: AtomicU64,

    moves_completed_latest: AtomicU64,
    moves_timeout_latest: AtomicU64,
    datanodes_involved_latest: AtomicU64,
    data_moved_gb_latest: AtomicU64,

    datanodes_unbalanced: AtomicU64,
    data_unbalanced_gb: AtomicU64,
}

impl BalancerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_num_iterations(&self, n: u64) {
        self.num_iterations.fetch_add(n, Ordering::Relaxed);
        counter!(names::NUM_ITERATIONS).increment(n);
    }

    pub fn num_iterations(&self) -> u64 {
        self.num_iterations.load(Ordering::Relaxed)
    }

    pub fn increment_moves_completed_latest(&self, n: u64) {
        self.moves_completed_latest.fetch_add(n, Ordering::Relaxed);
        gauge!(names::MOVES_COMPLETED_LATEST)
            .set(self.moves_completed_latest.load(Ordering::Relaxed) as f64);
    }

    pub fn moves_completed_latest(&self) -> u64 {
        self.moves_completed_latest.load(Ordering::Relaxed)
    }

    pub fn increment_moves_timeout_latest(&self, n: u64) {
        self.moves_timeout_latest.fetch_add(n, Ordering::Relaxed);
        gauge!(names::MOVES_TIMEOUT_LATEST)
            .set(self.moves_timeout_latest.load(Ordering::Relaxed) as f64);
    }

    pub fn moves_timeout_latest(&self) -> u64 {
        self.moves_timeout_latest.load(Ordering::Relaxed)
    }

    pub fn increment_data_moved_gb_latest(&self, gb: u64) {
        self.data_moved_gb_latest.fetch_add(gb, Ordering::Relaxed);
        gauge!(names::DATA_MOVED_GB_LATEST)
            .set(self.data_moved_gb_latest.load(Ordering::Relaxed) as f64);
    }

    pub fn data_moved_gb_latest(&self) -> u64 {
        self.data_moved_gb_latest.load(Ordering::Relaxed)
    }

    pub fn set_datanodes_involved_latest(&self, n: u64) {
        self.datanodes_involved_latest.store(n, Ordering::Relaxed);
        gauge!(names::DATANODES_INVOLVED_LATEST).set(n as f64);
    }

    pub fn datanodes_involved_latest(&self) -> u64 {
        self.datanodes_involved_latest.load(Ordering::Relaxed)
    }

    pub fn increment_datanodes_unbalanced(&self, n: u64) {
        self.datanodes_unbalanced.fetch_add(n, Ordering::Relaxed);
        gauge!(names::DATANODES_UNBALANCED)
            .set(self.datanodes_unbalanced.load(Ordering::Relaxed) as f64);
    }

    pub fn datanodes_unbalanced(&self) -> u64 {
        self.datanodes_unbalanced.load(Ordering::Relaxed)
    }

    pub fn set_data_unbalanced_gb(&self, gb: u64) {
        self.data_unbalanced_gb.store(gb, Ordering::Relaxed);
        gauge!(names::DATA_UNBALANCED_GB).set(gb as f64);
    }

    pub fn data_unbalanced_gb(&self) -> u64 {
        self.data_unbalanced_gb.load(Ordering::Relaxed)
    }

    pub fn moves_completed(&self) -> u64 {
        self.moves_completed.load(Ordering::Relaxed)
    }

    pub fn moves_timeout(&self) -> u64 {
        self.moves_timeout.load(Ordering::Relaxed)
    }

    pub fn data_moved_gb(&self) -> u64 {
        self.data_moved_gb.load(Ordering::Relaxed)
    }

    /// Fold the latest-iteration counters into their lifetime counterparts.
    /// Called once at the end of every iteration that generated moves.
    pub fn roll_up_latest_iteration(&self) {
        let completed = self.moves_completed_latest.load(Ordering::Relaxed);
        let timeout = self.moves_timeout_latest.load(Ordering::Relaxed);
        let moved = self.data_moved_gb_latest.load(Ordering::Relaxed);

        self.moves_completed.fetch_add(completed, Ordering::Relaxed);
        self.moves_timeout.fetch_add(timeout, Ordering::Relaxed);
        self.data_moved_gb.fetch_add(moved, Ordering::Relaxed);

        counter!(names::MOVES_COMPLETED).increment(completed);
        counter!(names::MOVES_TIMEOUT).increment(timeout);
        counter!(names::DATA_MOVED_GB).increment(moved);
    }

    /// Reset everything scoped to a single iteration. Called at the start
    /// of every iteration.
    pub fn reset_latest_iteration(&self) {
        self.moves_completed_latest.store(0, Ordering::Relaxed);
        self.moves_timeout_latest.store(0, Ordering::Relaxed);
        self.datanodes_involved_latest.store(0, Ordering::Relaxed);
        self.data_moved_gb_latest.store(0, Ordering::Relaxed);
        self.datanodes_unbalanced.store(0, Ordering::Relaxed);
        self.data_unbalanced_gb.store(0, Ordering::Relaxed);

        gauge!(names::MOVES_COMPLETED_LATEST).set(0.0);
        gauge!(names::MOVES_TIMEOUT_LATEST).set(0.0);
        gauge!(names::DATANODES_INVOLVED_LATEST).set(0.0);
        gauge!(names::DATA_MOVED_GB_LATEST).set(0.0);
        gauge!(names::DATANODES_UNBALANCED).set(0.0);
        gauge!(names::DATA_UNBALANCED_GB).set(0.0);
    }
}
