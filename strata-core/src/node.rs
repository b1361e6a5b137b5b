//! Node identity and storage usage
//!
//! A data node is identified by a stable [`NodeId`] and additionally carries
//! a hostname and IP address, which the balancer's include/exclude filters
//! match against. [`NodeUsage`] is the periodic capacity report the node
//! manager aggregates for every healthy node.

use std::fmt;

use uuid::Uuid;

use crate::error::StrataError;

/// Opaque stable identifier for a data node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a data node: stable id plus the addresses operators use to
/// refer to it in include/exclude lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub hostname: String,
    pub ip: String,
}

impl NodeDescriptor {
    pub fn new(id: NodeId, hostname: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            id,
            hostname: hostname.into(),
            ip: ip.into(),
        }
    }

    /// Whether the given filter entry names this node, by hostname or IP.
    pub fn matches(&self, entry: &str) -> bool {
        self.hostname == entry || self.ip == entry
    }
}

/// A single node's storage usage report.
///
/// `capacity >= used`, `capacity >= remaining`, and
/// `capacity >= used + remaining` hold for every valid report; the slack
/// between `capacity` and `used + remaining` is reserved space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUsage {
    pub node: NodeDescriptor,
    pub capacity: u64,
    pub used: u64,
    pub remaining: u64,
}

impl NodeUsage {
    /// Build a usage report, rejecting one that violates the capacity
    /// accounting invariants.
    pub fn new(
        node: NodeDescriptor,
        capacity: u64,
        used: u64,
        remaining: u64,
    ) -> Result<Self, StrataError> {
        if used > capacity || remaining > capacity || used + remaining > capacity {
            return Err(StrataError::InvalidUsage {
                node: node.id,
                capacity,
                used,
                remaining,
            });
        }
        Ok(Self {
            node,
            capacity,
            used,
            remaining,
        })
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    /// Fraction of capacity that is not remaining, in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.capacity - self.remaining) as f64 / self.capacity as f64
    }

    /// Utilization this node would have after a net change of `delta` bytes
    /// of stored data. Negative `delta` models bytes scheduled to leave.
    pub fn utilization_after(&self, delta: i64) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        let occupied = (self.capacity - self.remaining) as i64 + delta;
        occupied as f64 / self.capacity as f64
    }
}

/// Number of bytes corresponding to a utilization ratio of the given
/// capacity, truncated toward zero.
pub fn ratio_to_bytes(capacity: u64, ratio: f64) -> i64 {
    (capacity as f64 * ratio).floor() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(host: &str) -> NodeDescriptor {
        NodeDescriptor::new(NodeId::random(), host, "10.0.0.1")
    }

    #[test]
    fn test_usage_invariants() {
        let node = descriptor("dn-1");
        assert!(NodeUsage::new(node.clone(), 100, 60, 40).is_ok());
        // reserved space between used and remaining is fine
        assert!(NodeUsage::new(node.clone(), 100, 50, 40).is_ok());
        assert!(NodeUsage::new(node.clone(), 100, 70, 40).is_err());
        assert!(NodeUsage::new(node, 100, 110, 0).is_err());
    }

    #[test]
    fn test_utilization() {
        let usage = NodeUsage::new(descriptor("dn-1"), 1000, 600, 400).unwrap();
        assert!((usage.utilization() - 0.6).abs() < f64::EPSILON);
        assert!((usage.utilization_after(-100) - 0.5).abs() < f64::EPSILON);
        assert!((usage.utilization_after(200) - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_utilization_zero_capacity() {
        let usage = NodeUsage {
            node: descriptor("dn-1"),
            capacity: 0,
            used: 0,
            remaining: 0,
        };
        assert_eq!(usage.utilization(), 0.0);
    }

    #[test]
    fn test_descriptor_matches() {
        let node = NodeDescriptor::new(NodeId::random(), "dn-3.example.com", "10.1.2.3");
        assert!(node.matches("dn-3.example.com"));
        assert!(node.matches("10.1.2.3"));
        assert!(!node.matches("dn-4.example.com"));
    }

    #[test]
    fn test_ratio_to_bytes_truncates() {
        assert_eq!(ratio_to_bytes(1000, 0.6), 600);
        assert_eq!(ratio_to_bytes(3, 0.5), 1);
    }
}
