//! Storage Network Protocol
//!
//! Defines the HTTP endpoints and Data Transfer Objects (DTOs) exchanged
//! between nodes: forwarded session commands, replicated entry changes and
//! bulk partition transfers used when ownership moves.
//!
//! Everything here travels as JSON over HTTP.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::entry::{EntryRecord, EntryVersion, RemovalCause, SessionId, SessionState};

// --- API Endpoints ---

/// Executes a session command on the partition primary.
pub const ENDPOINT_EXECUTE: &str = "/internal/execute";
/// Applies a replicated change on a backup.
pub const ENDPOINT_REPLICATE: &str = "/internal/replicate";
/// Bulk transfer of one partition (GET to pull, POST to push).
pub const ENDPOINT_PARTITION: &str = "/internal/partition";
/// Node-level counters.
pub const ENDPOINT_STATS: &str = "/internal/stats";
/// Liveness and membership summary.
pub const ENDPOINT_HEALTH: &str = "/health";
/// Public session CRUD.
pub const ENDPOINT_SESSIONS: &str = "/sessions";

// --- Forwarded commands ---

/// A session operation, executed by whichever node is primary for the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionCommand {
    Create {
        id: SessionId,
        time_to_live_ms: u64,
        idle_timeout_ms: u64,
    },
    Get {
        id: SessionId,
    },
    SetAttribute {
        id: SessionId,
        name: String,
        value: serde_json::Value,
    },
    GetAttribute {
        id: SessionId,
        name: String,
    },
    RemoveAttribute {
        id: SessionId,
        name: String,
    },
    Delete {
        id: SessionId,
    },
}

impl SessionCommand {
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionCommand::Create { id, .. }
            | SessionCommand::Get { id }
            | SessionCommand::SetAttribute { id, .. }
            | SessionCommand::GetAttribute { id, .. }
            | SessionCommand::RemoveAttribute { id, .. }
            | SessionCommand::Delete { id } => id,
        }
    }
}

/// Request used when a node receives a command for a key it doesn't own.
#[derive(Debug, Serialize, Deserialize)]
pub struct ForwardRequest {
    /// The partition the sender resolved the key to.
    pub partition: u32,
    /// View version the sender routed with.
    pub view_version: u64,
    pub command: SessionCommand,
}

/// Outcome of a forwarded command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandResponse {
    Created {
        id: SessionId,
    },
    Session {
        session: SessionSnapshot,
    },
    Value {
        value: serde_json::Value,
    },
    Done,
    SessionNotFound {
        id: SessionId,
    },
    AttributeNotFound {
        id: SessionId,
        name: String,
    },
    /// The receiver is not primary for the partition under its own view.
    OwnershipStale {
        view_version: u64,
    },
}

/// Read-only copy of a session handed back to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub attributes: HashMap<String, serde_json::Value>,
    pub state: SessionState,
    pub created_at_ms: u64,
    pub last_accessed_at_ms: u64,
    pub version: u64,
}

// --- Replication ---

/// Payload for synchronizing one entry from its primary to a backup.
///
/// Sent by the primary after every local change. Backups apply it
/// last-writer-wins on `version`, so redelivery and reordering are harmless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub partition: u32,
    pub key: SessionId,
    pub version: EntryVersion,
    pub op: ReplicaOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ReplicaOp {
    /// Full entry state after a create or a write.
    Put { entry: EntryRecord },
    /// Removal with its cause.
    Delete { cause: RemovalCause },
    /// Access-time refresh without a version change.
    Touch { idle_ms: u64, accessed_at_ms: u64 },
}

/// Standard acknowledgment for replication and partition pushes.
#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    /// How many items won over the receiver's state.
    #[serde(default)]
    pub applied: usize,
}

// --- Partition transfer ---

/// A removed entry as carried in partition transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TombstoneRecord {
    pub id: SessionId,
    pub version: EntryVersion,
    pub cause: RemovalCause,
}

/// Complete contents of one partition on the sending node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    pub partition: u32,
    pub entries: Vec<EntryRecord>,
    pub tombstones: Vec<TombstoneRecord>,
}

// --- Introspection ---

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsResponse {
    pub node_id: String,
    pub view_version: u64,
    pub members: usize,
    pub entries: usize,
    pub primary_entries: usize,
    pub primary_partitions: usize,
    pub backup_partitions: usize,
    pub creates: u64,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub forwards: u64,
    pub degraded_replications: u64,
    pub promotions: u64,
    pub migrations: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub view_version: u64,
    pub members: Vec<String>,
}

// --- Public API ---

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub time_to_live_secs: Option<u64>,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub id: SessionId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
