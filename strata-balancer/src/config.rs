//! Balancer configuration
//!
//! Configuration loaded from environment variables, with CLI overrides
//! applied by the binary. Defaults are conservative enough to run against a
//! production cluster.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use strata_core::GB;

/// Configuration errors. All of these are fatal to `start_balancer`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("{key} ({value}B) must exceed the container size ({container_size}B)")]
    CapBelowContainerSize {
        key: &'static str,
        value: u64,
        container_size: u64,
    },
}

/// Container balancer configuration.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Half-width of the balanced band around the cluster average
    /// utilization, as a ratio in (0, 1).
    pub threshold: f64,

    /// Maximum number of iterations to run; -1 means unbounded.
    pub iterations: i64,

    /// Caps the number of datanodes involved per iteration to this
    /// fraction of the fleet.
    pub max_datanodes_ratio_to_involve_per_iteration: f64,

    /// Caps total bytes scheduled for moving per iteration.
    pub max_size_to_move_per_iteration: u64,

    /// Per-target cap on bytes entering per iteration.
    pub max_size_entering_target: u64,

    /// Per-source cap on bytes leaving per iteration.
    pub max_size_leaving_source: u64,

    /// Sleep between iterations.
    pub balancing_interval: Duration,

    /// Deadline for collecting move outcomes at iteration end.
    pub move_timeout: Duration,

    /// Force a disk-usage recomputation on every node before each iteration.
    pub trigger_du_enable: bool,

    /// Use the topology-aware target strategy instead of the by-usage one.
    pub network_topology_enable: bool,

    /// If non-empty, only nodes matching these hostnames/IPs are balanced.
    pub include_nodes: Vec<String>,

    /// Nodes matching these hostnames/IPs are never balanced.
    pub exclude_nodes: Vec<String>,

    /// Maximum size of a single container.
    pub container_size: u64,

    /// Interval at which nodes report their usage to the node manager.
    pub node_report_interval: Duration,

    /// Period of the nodes' own background disk-usage refresh.
    pub du_refresh_period: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            iterations: 10,
            max_datanodes_ratio_to_involve_per_iteration: 0.2,
            max_size_to_move_per_iteration: 500 * GB,
            max_size_entering_target: 26 * GB,
            max_size_leaving_source: 26 * GB,
            balancing_interval: Duration::from_secs(70 * 60),
            move_timeout: Duration::from_secs(65 * 60),
            trigger_du_enable: false,
            network_topology_enable: false,
            include_nodes: Vec::new(),
            exclude_nodes: Vec::new(),
            container_size: 5 * GB,
            node_report_interval: Duration::from_secs(60),
            du_refresh_period: Duration::from_secs(60 * 60),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl BalancerConfig {
    /// Create configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            threshold: env_parse("BALANCER_THRESHOLD", defaults.threshold),
            iterations: env_parse("BALANCER_ITERATIONS", defaults.iterations),
            max_datanodes_ratio_to_involve_per_iteration: env_parse(
                "BALANCER_MAX_DATANODES_RATIO",
                defaults.max_datanodes_ratio_to_involve_per_iteration,
            ),
            max_size_to_move_per_iteration: env_parse(
                "BALANCER_MAX_SIZE_PER_ITERATION_GB",
                defaults.max_size_to_move_per_iteration / GB,
            ) * GB,
            max_size_entering_target: env_parse(
                "BALANCER_MAX_SIZE_ENTERING_TARGET_GB",
                defaults.max_size_entering_target / GB,
            ) * GB,
            max_size_leaving_source: env_parse(
                "BALANCER_MAX_SIZE_LEAVING_SOURCE_GB",
                defaults.max_size_leaving_source / GB,
            ) * GB,
            balancing_interval: Duration::from_secs(env_parse(
                "BALANCER_INTERVAL_SECS",
                defaults.balancing_interval.as_secs(),
            )),
            move_timeout: Duration::from_secs(env_parse(
                "BALANCER_MOVE_TIMEOUT_SECS",
                defaults.move_timeout.as_secs(),
            )),
            trigger_du_enable: env_parse("BALANCER_TRIGGER_DU", defaults.trigger_du_enable),
            network_topology_enable: env_parse(
                "BALANCER_NETWORK_TOPOLOGY",
                defaults.network_topology_enable,
            ),
            include_nodes: env_list("BALANCER_INCLUDE_NODES"),
            exclude_nodes: env_list("BALANCER_EXCLUDE_NODES"),
            container_size: env_parse(
                "STRATA_CONTAINER_SIZE_GB",
                defaults.container_size / GB,
            ) * GB,
            node_report_interval: Duration::from_secs(env_parse(
                "STRATA_NODE_REPORT_INTERVAL_SECS",
                defaults.node_report_interval.as_secs(),
            )),
            du_refresh_period: Duration::from_secs(env_parse(
                "STRATA_DU_REFRESH_PERIOD_SECS",
                defaults.du_refresh_period.as_secs(),
            )),
        }
    }

    /// Validate the configuration before starting the balancer.
    ///
    /// The per-node size caps must each exceed the container size, or no
    /// container could ever move. A balancing interval at or below the
    /// nodes' own disk-usage refresh period only earns a warning: balancing
    /// still works, it just acts on stale usage.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(ConfigError::InvalidValue {
                key: "threshold",
                reason: format!("{} is not in (0, 1)", self.threshold),
            });
        }
        if !(self.max_datanodes_ratio_to_involve_per_iteration > 0.0
            && self.max_datanodes_ratio_to_involve_per_iteration <= 1.0)
        {
            return Err(ConfigError::InvalidValue {
                key: "max_datanodes_ratio_to_involve_per_iteration",
                reason: format!(
                    "{} is not in (0, 1]",
                    self.max_datanodes_ratio_to_involve_per_iteration
                ),
            });
        }
        if self.max_size_entering_target <= self.container_size {
            return Err(ConfigError::CapBelowContainerSize {
                key: "max_size_entering_target",
                value: self.max_size_entering_target,
                container_size: self.container_size,
            });
        }
        if self.max_size_leaving_source <= self.container_size {
            return Err(ConfigError::CapBelowContainerSize {
                key: "max_size_leaving_source",
                value: self.max_size_leaving_source,
                container_size: self.container_size,
            });
        }
        if self.balancing_interval <= self.du_refresh_period {
            warn!(
                balancing_interval = ?self.balancing_interval,
                du_refresh_period = ?self.du_refresh_period,
                "balancing interval does not exceed the disk-usage refresh \
                 period; iterations will act on stale usage reports"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(BalancerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_entering_cap_must_exceed_container_size() {
        let config = BalancerConfig {
            max_size_entering_target: 4 * GB,
            container_size: 5 * GB,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CapBelowContainerSize {
                key: "max_size_entering_target",
                ..
            })
        ));
    }

    #[test]
    fn test_leaving_cap_must_exceed_container_size() {
        let config = BalancerConfig {
            max_size_leaving_source: 5 * GB,
            container_size: 5 * GB,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_range() {
        let config = BalancerConfig {
            threshold: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BalancerConfig {
            threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
