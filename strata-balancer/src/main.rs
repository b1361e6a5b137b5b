//! Strata Container Balancer Service
//!
//! Evens out storage utilization across the data-node fleet by moving
//! container replicas from over- to under-utilized nodes.
//!
//! Without a manager endpoint to embed into, the binary runs against a
//! simulated cluster: a skewed in-memory fleet that the balancer drains
//! iteration by iteration. Useful for operator training, demos, and
//! watching the metrics endpoint do something.

use std::time::Duration;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::info;

use strata_balancer::config::BalancerConfig;
use strata_balancer::metrics::describe_metrics;
use strata_balancer::service::ContainerBalancer;
use strata_balancer::sim::SimCluster;
use strata_core::{ContainerState, GB};

#[derive(Parser)]
#[command(name = "strata-balancer")]
#[command(about = "Strata container balancer service")]
struct Cli {
    /// Balanced-band half width as a ratio, e.g. 0.1 for +/-10%
    #[arg(long, env = "BALANCER_THRESHOLD")]
    threshold: Option<f64>,

    /// Maximum iterations to run; -1 for unbounded
    #[arg(long, env = "BALANCER_ITERATIONS")]
    iterations: Option<i64>,

    /// Seconds to sleep between iterations
    #[arg(long, env = "BALANCER_INTERVAL_SECS")]
    interval_secs: Option<u64>,

    /// Seconds to wait for move outcomes at iteration end
    #[arg(long, env = "BALANCER_MOVE_TIMEOUT_SECS")]
    move_timeout_secs: Option<u64>,

    /// Use the topology-aware target strategy
    #[arg(long, default_value = "false")]
    network_topology: bool,

    /// Port for the Prometheus metrics endpoint
    #[arg(long, default_value = "9090")]
    metrics_port: u16,

    /// Number of nodes in the simulated cluster
    #[arg(long, default_value = "10")]
    sim_nodes: usize,

    /// Containers per over-utilized node in the simulated cluster
    #[arg(long, default_value = "20")]
    sim_containers: usize,
}

/// A fleet where the first third of the nodes hold all the data.
fn build_sim_cluster(nodes: usize, containers_per_hot_node: usize) -> SimCluster {
    let cluster = SimCluster::new();
    let hot = (nodes / 3).max(1);
    let mut ids = Vec::with_capacity(nodes);
    for i in 0..nodes {
        let id = cluster.add_node(&format!("dn-{i}.sim.strata"), 200 * GB, 0);
        cluster.set_rack(id, (i % 4) as u32);
        ids.push(id);
    }
    for id in ids.iter().take(hot) {
        for _ in 0..containers_per_hot_node {
            cluster.add_container(5 * GB, &[*id], ContainerState::Closed);
        }
    }
    cluster
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let defaults = BalancerConfig::from_env();
    let config = BalancerConfig {
        threshold: cli.threshold.unwrap_or(defaults.threshold),
        iterations: cli.iterations.unwrap_or(defaults.iterations),
        balancing_interval: cli
            .interval_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.balancing_interval),
        move_timeout: cli
            .move_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.move_timeout),
        network_topology_enable: cli.network_topology || defaults.network_topology_enable,
        ..defaults
    };

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], cli.metrics_port))
        .install()?;
    describe_metrics();

    info!(
        threshold = config.threshold,
        iterations = config.iterations,
        interval = ?config.balancing_interval,
        sim_nodes = cli.sim_nodes,
        metrics_port = cli.metrics_port,
        "starting strata container balancer (simulation mode)"
    );

    let cluster = build_sim_cluster(cli.sim_nodes, cli.sim_containers);
    let balancer = ContainerBalancer::new(config, cluster.handles());

    balancer.start_balancer().await?;
    info!("{}", balancer.status_report());

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
                balancer.stop_balancer().await;
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                if !balancer.is_running() {
                    info!("balancer finished on its own");
                    break;
                }
            }
        }
    }

    let metrics = balancer.metrics();
    info!(
        iterations = metrics.num_iterations(),
        moves_completed = metrics.moves_completed(),
        moves_timed_out = metrics.moves_timeout(),
        data_moved_gb = metrics.data_moved_gb(),
        "container balancer run summary"
    );

    Ok(())
}
