//! Error types.
//!
//! `StoreError` is everything a caller of the session CRUD surface can see.
//! `ClusterError` stays inside the node: it is logged, counted, or mapped to
//! `StoreError::Timeout` before it reaches the application layer.

use std::net::SocketAddr;
use std::time::Duration;

use crate::membership::types::NodeId;
use crate::storage::entry::SessionId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    /// Session absent, expired, evicted or deleted.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("attribute '{attribute}' not found in session {session}")]
    AttributeNotFound {
        session: SessionId,
        attribute: String,
    },

    /// The owning node could not be reached within the operation timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::SessionNotFound(_) | StoreError::AttributeNotFound { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// No candidate member answered the handshake during startup.
    #[error("cluster unreachable: none of {candidates:?} answered within {timeout:?}")]
    ClusterUnreachable {
        candidates: Vec<SocketAddr>,
        timeout: Duration,
    },

    /// The node a request was routed to no longer owns the partition.
    #[error("partition {partition} is not owned by this node (view v{view_version})")]
    OwnershipStale { partition: u32, view_version: u64 },

    /// A backup did not acknowledge a replicated write.
    #[error("replication to {node} degraded: {reason}")]
    ReplicationDegraded { node: NodeId, reason: String },

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("transport error: {0}")]
    Transport(String),

    /// A gossip message could not be encoded.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        ClusterError::Codec(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cluster name must not be empty")]
    EmptyClusterName,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("backup timeout {backup:?} must be shorter than operation timeout {operation:?}")]
    BackupTimeoutTooLong { backup: Duration, operation: Duration },

    #[error("port {port} with {count} candidates and http offset {offset} exceeds 65535")]
    PortRange { port: u16, count: u16, offset: u16 },

    #[error("{0}")]
    Invalid(String),
}
