//! Service lifecycle
//!
//! The balancer runs as a service of the surrounding storage container
//! manager: a single worker task executes iterations while a run flag,
//! guarded by one lifecycle mutex, gates `Stopped ↔ Running` transitions.
//! Leadership and safe-mode changes are pushed in via
//! [`ContainerBalancer::notify_status_changed`]; everything else the
//! balancer pulls from the [`ClusterContext`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use strata_core::GB;

use crate::cluster::{ClusterContext, ClusterHandles};
use crate::config::{BalancerConfig, ConfigError};
use crate::iteration::{IterationEngine, IterationError, IterationResult};
use crate::metrics::BalancerMetrics;

/// Errors starting the balancer. All are surfaced to the operator.
#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("container balancer is already running")]
    AlreadyRunning,

    #[error("this instance is not leader-ready")]
    NotLeaderReady,

    #[error("cluster is in safe mode")]
    SafeMode,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Cancellable view of the balancer's run flag. Handed to everything that
/// sleeps or loops on the worker task so a stop wakes it promptly.
#[derive(Clone)]
pub struct StopHandle {
    running: watch::Receiver<bool>,
}

impl StopHandle {
    /// Wrap a run-flag receiver. The service creates these for its worker;
    /// anything driving [`crate::iteration::IterationEngine`] directly
    /// supplies its own channel.
    pub fn new(running: watch::Receiver<bool>) -> Self {
        Self { running }
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Sleep that wakes early on stop. Returns false if the balancer was
    /// stopped before the duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if !self.is_running() {
            return false;
        }
        let mut running = self.running.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = running.wait_for(|r| !*r) => false,
        }
    }
}

/// The container balancer service.
#[derive(Clone)]
pub struct ContainerBalancer {
    inner: Arc<Inner>,
}

struct Inner {
    config: BalancerConfig,
    metrics: Arc<BalancerMetrics>,
    context: Arc<dyn ClusterContext>,
    engine: IterationEngine,
    running: watch::Sender<bool>,
    /// Guards Stopped ↔ Running transitions and owns the worker handle.
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerBalancer {
    pub fn new(config: BalancerConfig, cluster: ClusterHandles) -> Self {
        let metrics = Arc::new(BalancerMetrics::new());
        let engine = IterationEngine::new(config.clone(), metrics.clone(), cluster.clone());
        let (running, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                metrics,
                context: cluster.context,
                engine,
                running,
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn metrics(&self) -> Arc<BalancerMetrics> {
        self.inner.metrics.clone()
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.borrow()
    }

    /// Whether the service manager should start balancing on its own.
    /// Always false: balancing moves real data and is only ever started by
    /// an explicit operator action through [`Self::start_balancer`].
    pub fn should_run(&self) -> bool {
        false
    }

    /// Service-manager start path. A no-op unless [`Self::should_run`]
    /// asks for autostart.
    pub async fn start(&self) {
        if self.should_run() {
            let mut worker = self.inner.worker.lock().await;
            if worker.is_none() {
                self.spawn_worker(&mut worker);
            }
        }
    }

    /// Operator start path: validates service state and configuration,
    /// then launches the worker.
    pub async fn start_balancer(&self) -> Result<(), BalancerError> {
        let mut worker = self.inner.worker.lock().await;
        if self.is_running() || worker.is_some() {
            warn!("cannot start the container balancer because it is already running");
            return Err(BalancerError::AlreadyRunning);
        }
        if !self.inner.context.is_leader_ready() {
            warn!("cannot start the container balancer, instance is not leader-ready");
            return Err(BalancerError::NotLeaderReady);
        }
        if self.inner.context.is_in_safe_mode() {
            warn!("cannot start the container balancer in safe mode");
            return Err(BalancerError::SafeMode);
        }
        self.inner.config.validate()?;
        self.spawn_worker(&mut worker);
        info!("container balancer started");
        Ok(())
    }

    fn spawn_worker(&self, worker: &mut Option<JoinHandle<()>>) {
        self.inner.running.send_replace(true);
        let inner = self.inner.clone();
        *worker = Some(tokio::spawn(async move { inner.balance_loop().await }));
    }

    /// Stop the balancer and wait for the worker to exit. Idempotent.
    pub async fn stop_balancer(&self) {
        let handle = {
            let mut worker = self.inner.worker.lock().await;
            if !self.is_running() && worker.is_none() {
                info!("container balancer is not running");
                return;
            }
            self.inner.running.send_replace(false);
            worker.take()
        };
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    error!(error = %err, "balancer worker panicked");
                }
            }
        }
        info!("container balancer stopped");
    }

    /// Called by the service manager on leadership or safe-mode
    /// transitions. Stops a running balancer when this instance can no
    /// longer write cluster state.
    pub async fn notify_status_changed(&self) {
        if (!self.inner.context.is_leader() || self.inner.context.is_in_safe_mode())
            && self.is_running()
        {
            info!("lost leadership or entered safe mode, stopping the container balancer");
            self.stop_balancer().await;
        }
    }

    /// Human-readable status for operator tooling.
    pub fn status_report(&self) -> String {
        let c = &self.inner.config;
        format!(
            "Container balancer status:\n\
             {:<44} {}\n\
             {:<44} {}%\n\
             {:<44} {}\n\
             {:<44} {}%\n\
             {:<44} {} GB\n\
             {:<44} {} GB\n\
             {:<44} {} GB\n\
             {:<44} {:?}\n\
             {:<44} {:?}\n\
             {:<44} {}\n\
             {:<44} {}\n",
            "Running",
            self.is_running(),
            "Threshold",
            ratio_to_percent(c.threshold),
            "Max iterations",
            c.iterations,
            "Max datanodes to involve per iteration",
            ratio_to_percent(c.max_datanodes_ratio_to_involve_per_iteration),
            "Max size to move per iteration",
            c.max_size_to_move_per_iteration / GB,
            "Max size entering target",
            c.max_size_entering_target / GB,
            "Max size leaving source",
            c.max_size_leaving_source / GB,
            "Balancing interval",
            c.balancing_interval,
            "Move timeout",
            c.move_timeout,
            "Trigger du before iteration",
            c.trigger_du_enable,
            "Network topology aware",
            c.network_topology_enable,
        )
    }
}

impl Inner {
    /// The worker: runs iterations until the configured count is reached,
    /// the cluster cannot be balanced further, a precondition fails, or
    /// the service is stopped.
    async fn balance_loop(self: Arc<Self>) {
        let stop = StopHandle::new(self.running.subscribe());
        let max_iterations = if self.config.iterations < 0 {
            u64::MAX
        } else {
            self.config.iterations as u64
        };

        let mut finished = 0u64;
        while finished < max_iterations && stop.is_running() {
            match self.engine.run_iteration(&stop).await {
                Err(IterationError::SnapshotUnavailable) => {
                    // transient: the node manager has nothing for us right
                    // now, try again next interval
                    if !stop.sleep(self.config.balancing_interval).await {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "iteration precondition failed, stopping balancer");
                    break;
                }
                Ok(report) => {
                    self.metrics.increment_num_iterations(1);
                    info!(
                        result = ?report.result,
                        moves = report.moves.len(),
                        size_moved = report.size_moved,
                        "balancer iteration finished"
                    );
                    match report.result {
                        IterationResult::CannotBalance => {
                            info!("cluster cannot be balanced any further");
                            break;
                        }
                        IterationResult::Interrupted => break,
                        IterationResult::Completed => {}
                    }
                }
            }

            finished += 1;
            if finished < max_iterations && !stop.sleep(self.config.balancing_interval).await {
                break;
            }
        }

        // the worker never joins itself; it clears its own handle first so
        // a restart observing the cleared run flag finds a clean slate
        self.worker.lock().await.take();
        self.running.send_replace(false);
    }
}

/// Utilization ratio as a whole percentage, for reports and logs.
pub fn ratio_to_percent(ratio: f64) -> u32 {
    (ratio * 100.0) as u32
}
