//! Cluster membership.
//!
//! The scheduler does not discover nodes itself. It consumes a
//! [`MembershipProvider`] that reports the live node set and notifies on
//! changes through a `watch` channel carrying a generation counter.

use std::sync::{Arc, RwLock};
use tokio::sync::watch;

use super::node::NodeDescriptor;
use crate::core::types::NodeId;

/// Source of the live node set.
pub trait MembershipProvider: Send + Sync {
    /// The node this scheduler runs on.
    fn local_node(&self) -> NodeDescriptor;

    /// Snapshot of the currently live nodes.
    fn live_nodes(&self) -> Vec<NodeDescriptor>;

    /// Receiver that changes whenever the live node set changes.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// Single-node membership: the local node is the whole cluster.
#[derive(Debug)]
pub struct LocalMembership {
    node: NodeDescriptor,
    generation: watch::Sender<u64>,
}

impl LocalMembership {
    pub fn new(node: NodeDescriptor) -> Self {
        let (generation, _) = watch::channel(0);
        Self { node, generation }
    }
}

impl Default for LocalMembership {
    fn default() -> Self {
        Self::new(NodeDescriptor::new("local"))
    }
}

impl MembershipProvider for LocalMembership {
    fn local_node(&self) -> NodeDescriptor {
        self.node.clone()
    }

    fn live_nodes(&self) -> Vec<NodeDescriptor> {
        vec![self.node.clone()]
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

#[derive(Debug)]
struct Roster {
    nodes: RwLock<Vec<NodeDescriptor>>,
    generation: watch::Sender<u64>,
}

/// A roster shared by several simulated nodes.
///
/// Every clone sees the same node list; [`for_node`](Self::for_node) gives
/// each scheduler its own view with a different local node.
#[derive(Debug, Clone)]
pub struct StaticMembership {
    roster: Arc<Roster>,
    local: NodeDescriptor,
}

impl StaticMembership {
    /// Create a roster with the given nodes; `local` is this view's node.
    pub fn new(local: NodeDescriptor, nodes: Vec<NodeDescriptor>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            roster: Arc::new(Roster {
                nodes: RwLock::new(nodes),
                generation,
            }),
            local,
        }
    }

    /// A view of the same roster from another node.
    pub fn for_node(&self, local: NodeDescriptor) -> Self {
        Self {
            roster: self.roster.clone(),
            local,
        }
    }

    /// Add a node, replacing any node with the same id.
    pub fn add_node(&self, node: NodeDescriptor) {
        self.update(|nodes| {
            nodes.retain(|n| n.id != node.id);
            nodes.push(node);
        });
    }

    /// Remove a node by id.
    pub fn remove_node(&self, id: &NodeId) {
        self.update(|nodes| nodes.retain(|n| &n.id != id));
    }

    /// Replace the whole node set.
    pub fn set_nodes(&self, new_nodes: Vec<NodeDescriptor>) {
        self.update(|nodes| *nodes = new_nodes);
    }

    fn update(&self, f: impl FnOnce(&mut Vec<NodeDescriptor>)) {
        {
            let mut nodes = self
                .roster
                .nodes
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut nodes);
        }
        self.roster.generation.send_modify(|g| *g += 1);
    }
}

impl MembershipProvider for StaticMembership {
    fn local_node(&self) -> NodeDescriptor {
        self.local.clone()
    }

    fn live_nodes(&self) -> Vec<NodeDescriptor> {
        self.roster
            .nodes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.roster.generation.subscribe()
    }
}
