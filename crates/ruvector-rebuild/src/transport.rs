//! Seams to the cluster
//!
//! The rebuild protocol never talks to the network or the membership layer
//! directly. It goes through [`RebuildTransport`] for messages and
//! [`ClusterMembership`] for node liveness.

use crate::{config::RebuildConfig, rpc::RebuildMessage, RebuildResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use ruvector_failover::{NodeId, NodeInstance};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Replies to a broadcast, as raw bytes tagged with the replying node
///
/// The stream ends when the transport stops collecting replies.
pub type ReplyReceiver = mpsc::Receiver<(NodeInstance, Vec<u8>)>;

#[async_trait]
pub trait RebuildTransport: Send + Sync {
    /// Send `message` to every node and stream back the replies
    async fn broadcast(&self, message: RebuildMessage) -> RebuildResult<ReplyReceiver>;

    /// Send `message` to one node instance
    async fn send(&self, to: &NodeInstance, message: RebuildMessage) -> RebuildResult<()>;
}

/// Liveness view of the cluster
pub trait ClusterMembership: Send + Sync {
    /// Returns true if `node` is the live instance of its node
    fn is_node_up(&self, node: &NodeInstance) -> bool;

    /// Number of nodes that must be up before rebuild recovery completes
    fn expected_cluster_size(&self) -> usize;

    fn up_node_count(&self) -> usize;
}

/// Membership kept in memory and driven by node up/down notifications
#[derive(Debug)]
pub struct StaticMembership {
    nodes: RwLock<HashMap<NodeId, NodeInstance>>,
    expected_cluster_size: usize,
}

impl StaticMembership {
    pub fn new(expected_cluster_size: usize) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            expected_cluster_size,
        }
    }

    pub fn from_config(config: &RebuildConfig) -> Self {
        Self::new(config.expected_cluster_size)
    }

    pub fn with_nodes(
        expected_cluster_size: usize,
        nodes: impl IntoIterator<Item = NodeInstance>,
    ) -> Self {
        let membership = Self::new(expected_cluster_size);
        for node in nodes {
            membership.node_up(node);
        }
        membership
    }

    /// Record `node` as up; an older instance never replaces a newer one
    pub fn node_up(&self, node: NodeInstance) {
        let mut nodes = self.nodes.write();
        match nodes.get(&node.id) {
            Some(existing) if existing.instance_id > node.instance_id => {}
            _ => {
                nodes.insert(node.id.clone(), node);
            }
        }
    }

    /// Record `node` as down if it is the known instance or older
    pub fn node_down(&self, node: &NodeInstance) {
        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.get(&node.id) {
            if existing.instance_id <= node.instance_id {
                nodes.remove(&node.id);
            }
        }
    }
}

impl ClusterMembership for StaticMembership {
    fn is_node_up(&self, node: &NodeInstance) -> bool {
        self.nodes.read().get(&node.id) == Some(node)
    }

    fn expected_cluster_size(&self) -> usize {
        self.expected_cluster_size
    }

    fn up_node_count(&self) -> usize {
        self.nodes.read().len()
    }
}
