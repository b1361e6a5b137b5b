//! Error types for Strata
//!
//! Provides a unified error type for control-plane operations.

use thiserror::Error;

use crate::container::ContainerId;
use crate::node::NodeId;

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;

/// Unified error type for Strata control-plane code
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("container not found: {0}")]
    ContainerNotFound(ContainerId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error(
        "invalid usage report for node {node}: capacity {capacity}B, \
         used {used}B, remaining {remaining}B"
    )]
    InvalidUsage {
        node: NodeId,
        capacity: u64,
        used: u64,
        remaining: u64,
    },

    #[error("replication error: {0}")]
    Replication(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StrataError::ContainerNotFound(ContainerId::new(42));
        assert_eq!(err.to_string(), "container not found: #42");
    }
}
