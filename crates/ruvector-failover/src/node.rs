//! Node and partition identity

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Node identifier type
pub type NodeId = String;

/// Partition identifier type
pub type PartitionId = Uuid;

/// The reserved partition hosting the failover manager itself
pub const BOOTSTRAP_PARTITION_ID: PartitionId = Uuid::from_u128(1);

/// Returns true if `id` is the reserved bootstrap partition
pub fn is_bootstrap_partition(id: &PartitionId) -> bool {
    *id == BOOTSTRAP_PARTITION_ID
}

/// A specific incarnation of a node
///
/// The instance id grows every time the node process restarts, so two
/// instances of the same node can be ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeInstance {
    /// Node identifier
    pub id: NodeId,
    /// Incarnation of the node
    pub instance_id: u64,
}

impl NodeInstance {
    /// Create a new node instance
    pub fn new(id: impl Into<NodeId>, instance_id: u64) -> Self {
        Self {
            id: id.into(),
            instance_id,
        }
    }

    /// Returns true if both instances refer to the same node
    pub fn same_node(&self, other: &NodeInstance) -> bool {
        self.id == other.id
    }

    /// Returns true if this is a later incarnation of the same node
    pub fn is_newer_than(&self, other: &NodeInstance) -> bool {
        self.same_node(other) && self.instance_id > other.instance_id
    }
}

impl fmt::Display for NodeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_ordering() {
        let old = NodeInstance::new("node1", 1);
        let new = NodeInstance::new("node1", 2);
        let other = NodeInstance::new("node2", 5);

        assert!(new.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));
        assert!(!other.is_newer_than(&old));
        assert_eq!(new.to_string(), "node1:2");
    }

    #[test]
    fn test_bootstrap_partition() {
        assert!(is_bootstrap_partition(&BOOTSTRAP_PARTITION_ID));
        assert!(!is_bootstrap_partition(&Uuid::new_v4()));
    }
}
