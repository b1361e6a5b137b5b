//! Service lifecycle scenarios
//!
//! Runs the full balancer service against the in-memory cluster: worker
//! start/stop, leadership changes mid-iteration, and transient snapshot
//! failures.
//!
//! Run with: cargo test --test service_test

use std::time::Duration;

use strata_balancer::config::BalancerConfig;
use strata_balancer::service::ContainerBalancer;
use strata_balancer::sim::SimCluster;
use strata_core::{ContainerState, GB};

fn service_config() -> BalancerConfig {
    BalancerConfig {
        threshold: 0.1,
        iterations: -1,
        max_datanodes_ratio_to_involve_per_iteration: 1.0,
        balancing_interval: Duration::from_secs(60),
        move_timeout: Duration::from_secs(60),
        ..Default::default()
    }
}

/// Poll until `predicate` holds or roughly two seconds pass.
async fn wait_until(mut predicate: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn test_leader_loss_mid_iteration_skips_outcome_collection() {
    let cluster = SimCluster::new();
    let source = cluster.add_node("dn-1", 100 * GB, 0);
    cluster.add_node("dn-2", 100 * GB, 0);
    for _ in 0..8 {
        cluster.add_container(5 * GB, &[source], ContainerState::Closed);
    }
    // park the worker inside its first move submission
    cluster.set_move_gate(true);

    let balancer = ContainerBalancer::new(service_config(), cluster.handles());
    let metrics = balancer.metrics();
    balancer.start_balancer().await.unwrap();

    assert!(wait_until(|| cluster.gate_waiters() > 0).await);

    // leadership is lost while the matching loop is mid-submission
    cluster.set_leader(false);
    let notifier = {
        let balancer = balancer.clone();
        tokio::spawn(async move { balancer.notify_status_changed().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cluster.set_move_gate(false);
    notifier.await.unwrap();

    assert!(!balancer.is_running());
    // the in-flight submission finished, nothing further was submitted
    assert_eq!(cluster.begun_moves(), 1);
    // outcome collection was bypassed: no timeouts, no cancels
    assert_eq!(metrics.moves_timeout_latest(), 0);
    assert!(cluster.cancelled_moves().is_empty());
}

#[tokio::test]
async fn test_unavailable_node_manager_is_retried_next_interval() {
    let cluster = SimCluster::new();
    for i in 0..4 {
        cluster.add_node(&format!("dn-{i}"), 100 * GB, 50 * GB);
    }
    cluster.set_node_manager_down(true);

    let config = BalancerConfig {
        balancing_interval: Duration::from_millis(30),
        ..service_config()
    };
    let balancer = ContainerBalancer::new(config, cluster.handles());
    let metrics = balancer.metrics();
    balancer.start_balancer().await.unwrap();

    // snapshot failures do not stop the balancer and do not count as
    // iterations
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(balancer.is_running());
    assert_eq!(metrics.num_iterations(), 0);

    // once reports come back the (balanced) cluster ends the run
    cluster.set_node_manager_down(false);
    assert!(wait_until(|| !balancer.is_running()).await);
    assert_eq!(metrics.num_iterations(), 1);
}

#[tokio::test]
async fn test_balanced_cluster_stops_the_service() {
    let cluster = SimCluster::new();
    for i in 0..10 {
        cluster.add_node(&format!("dn-{i}"), 100 * GB, 70 * GB);
    }

    let balancer = ContainerBalancer::new(service_config(), cluster.handles());
    let metrics = balancer.metrics();
    balancer.start_balancer().await.unwrap();

    assert!(wait_until(|| !balancer.is_running()).await);
    assert_eq!(metrics.num_iterations(), 1);
    assert_eq!(metrics.moves_completed(), 0);
    assert_eq!(cluster.begun_moves(), 0);
}

#[tokio::test]
async fn test_iteration_budget_stops_the_service() {
    let cluster = SimCluster::new();
    let source = cluster.add_node("dn-1", 100 * GB, 0);
    cluster.add_node("dn-2", 100 * GB, 0);
    for _ in 0..16 {
        cluster.add_container(5 * GB, &[source], ContainerState::Closed);
    }

    let config = BalancerConfig {
        iterations: 2,
        balancing_interval: Duration::from_millis(20),
        ..service_config()
    };
    let balancer = ContainerBalancer::new(config, cluster.handles());
    let metrics = balancer.metrics();
    balancer.start_balancer().await.unwrap();

    assert!(wait_until(|| !balancer.is_running()).await);
    assert_eq!(metrics.num_iterations(), 2);
    // one move per iteration with two nodes involved
    assert_eq!(metrics.moves_completed(), 2);
}

#[tokio::test]
async fn test_restart_after_natural_stop() {
    let cluster = SimCluster::new();
    for i in 0..4 {
        cluster.add_node(&format!("dn-{i}"), 100 * GB, 50 * GB);
    }

    let balancer = ContainerBalancer::new(service_config(), cluster.handles());
    balancer.start_balancer().await.unwrap();
    assert!(wait_until(|| !balancer.is_running()).await);

    // a stopped balancer can be started again
    balancer.start_balancer().await.unwrap();
    assert!(wait_until(|| !balancer.is_running()).await);
    assert_eq!(balancer.metrics().num_iterations(), 2);
}
