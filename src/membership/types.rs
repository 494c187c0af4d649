use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    /// Handshake not completed yet.
    Joining,
    Active,
    /// Missed too many heartbeats; may still refute.
    Suspect,
    Left,
}

/// A single member of the cluster.
///
/// `last_heartbeat`, `suspected_at` and `left_at` are local observations and
/// never leave the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: NodeState,

    #[serde(skip)]
    pub last_heartbeat: Option<Instant>,
    #[serde(skip)]
    pub suspected_at: Option<Instant>,
    /// When this node was last declared LEFT; drives pruning of departed records.
    #[serde(skip)]
    pub left_at: Option<Instant>,
}

impl Node {
    pub fn new(id: NodeId, gossip_addr: SocketAddr, http_addr: SocketAddr) -> Self {
        Self {
            id,
            gossip_addr,
            http_addr,
            state: NodeState::Joining,
            last_heartbeat: None,
            suspected_at: None,
            left_at: None,
        }
    }

    /// Copy of this node as it appears inside a [`ClusterView`].
    pub fn as_active(&self) -> Node {
        Node {
            state: NodeState::Active,
            last_heartbeat: None,
            suspected_at: None,
            left_at: None,
            ..self.clone()
        }
    }
}

/// The versioned set of active nodes, ordered by id.
///
/// Views are immutable; every change produces a new view with a higher
/// version.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterView {
    pub version: u64,
    pub members: Vec<Node>,
}

impl ClusterView {
    pub fn founding(node: &Node) -> Self {
        Self {
            version: 1,
            members: vec![node.as_active()],
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.iter().any(|member| &member.id == id)
    }

    pub fn member(&self, id: &NodeId) -> Option<&Node> {
        self.members.iter().find(|member| &member.id == id)
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|member| member.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// New view with `node` added (or its addresses refreshed). Any other
    /// member at the same gossip address is dropped: it is a previous
    /// incarnation of the same process slot.
    pub fn with_member(&self, node: &Node) -> ClusterView {
        let mut members: Vec<Node> = self
            .members
            .iter()
            .filter(|member| member.id != node.id && member.gossip_addr != node.gossip_addr)
            .cloned()
            .collect();
        members.push(node.as_active());
        members.sort_by(|a, b| a.id.cmp(&b.id));
        ClusterView {
            version: self.version + 1,
            members,
        }
    }

    pub fn without_member(&self, id: &NodeId) -> ClusterView {
        ClusterView {
            version: self.version + 1,
            members: self
                .members
                .iter()
                .filter(|member| &member.id != id)
                .cloned()
                .collect(),
        }
    }

    /// Union of two views that share a version but disagree on membership.
    pub fn merge(&self, other: &ClusterView) -> ClusterView {
        let mut merged = self.clone();
        for node in &other.members {
            if !merged.contains(&node.id) {
                merged.members.push(node.as_active());
            }
        }
        merged.members.sort_by(|a, b| a.id.cmp(&b.id));
        merged.version = self.version.max(other.version) + 1;
        merged
    }

    pub fn same_members(&self, other: &ClusterView) -> bool {
        self.member_ids() == other.member_ids()
    }
}

/// Gossip wire protocol, carried over UDP.
///
/// Every message carries an ordering token: a view version or a timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    /// Sent by a joining node to each candidate address.
    Handshake {
        cluster_name: String,
        node: Node,
        view_version: u64,
    },

    /// Reply carrying the view the joiner adopts.
    HandshakeAck {
        cluster_name: String,
        view: ClusterView,
    },

    /// Announcement sent by a node once it has adopted a view.
    Join { node: Node },

    Heartbeat {
        node_id: NodeId,
        timestamp_ms: u64,
        view_version: u64,
    },

    Suspect {
        node_id: NodeId,
        view_version: u64,
    },

    /// Refutes a suspicion.
    Alive {
        node_id: NodeId,
        view_version: u64,
    },

    ViewRequest { node_id: NodeId },

    ViewUpdate { view: ClusterView },

    /// Graceful departure.
    Leave { node_id: NodeId, view_version: u64 },

    /// Offered periodically to known addresses outside the sender's view.
    /// Two segments that lost each other union their views on receipt.
    Merge {
        cluster_name: String,
        node: Node,
        view: ClusterView,
    },
}
