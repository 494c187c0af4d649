//! Session Store API.
//!
//! [`SessionStore`] is the CRUD surface the application layer talks to. Any
//! node accepts any call: the key is hashed to its partition, and the command
//! either runs here (this node is primary) or is forwarded once to the
//! primary over HTTP. A forward that lands on a node which no longer owns the
//! partition, or on a node that has died, is re-resolved against a newer
//! partition table exactly once before the call fails with a timeout.
//!
//! On the primary every command runs in its own task, so local mutation and
//! the synchronous backup fan-out finish even when the caller goes away.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::entry::{EntryVersion, RemovalCause, SessionEntry, SessionId};
use super::eviction::EvictionPolicy;
use super::memory::{Lookup, PartitionStore};
use super::partitioner::{PartitionAssignment, PartitionManager};
use super::protocol::{
    CommandResponse, ENDPOINT_EXECUTE, ForwardRequest, ReplicaOp, ReplicateRequest,
    SessionCommand, SessionSnapshot, StatsResponse,
};
use super::replication::Replicator;
use super::stats::StoreStats;
use super::transport::PeerClient;
use crate::clock::{millis, now_ms};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, StoreError};
use crate::hooks::SessionListener;
use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;

const TABLE_POLL_INTERVAL: Duration = Duration::from_millis(20);
const MIGRATION_POLL_INTERVAL: Duration = Duration::from_millis(10);
const STALE_OWNER_SETTLE: Duration = Duration::from_millis(100);

pub struct SessionStore {
    pub(super) membership: Arc<MembershipService>,
    pub(super) partitioner: Arc<PartitionManager>,
    pub(super) data: Arc<PartitionStore>,
    pub(super) eviction: Mutex<EvictionPolicy>,
    pub(super) replicator: Replicator,
    pub(super) client: PeerClient,
    pub(super) listener: Arc<dyn SessionListener>,
    pub(super) stats: Arc<StoreStats>,
    /// Partitions whose entries are still being pulled from a previous owner.
    pub(super) migrating: DashMap<u32, ()>,
    time_to_live: Duration,
    idle_timeout: Duration,
    pub(super) operation_timeout: Duration,
    pub(super) backup_timeout: Duration,
}

impl SessionStore {
    pub fn new(
        config: &ClusterConfig,
        membership: Arc<MembershipService>,
        partitioner: Arc<PartitionManager>,
        listener: Arc<dyn SessionListener>,
    ) -> Arc<Self> {
        let client = PeerClient::new();
        let stats = Arc::new(StoreStats::default());
        let replicator = Replicator::new(
            membership.clone(),
            client.clone(),
            config.backup_timeout,
            stats.clone(),
        );

        Arc::new(Self {
            data: Arc::new(PartitionStore::new(partitioner.num_partitions)),
            eviction: Mutex::new(EvictionPolicy::new(config.capacity_per_node)),
            membership,
            partitioner,
            replicator,
            client,
            listener,
            stats,
            migrating: DashMap::new(),
            time_to_live: config.time_to_live,
            idle_timeout: config.idle_timeout,
            operation_timeout: config.operation_timeout,
            backup_timeout: config.backup_timeout,
        })
    }

    // --- Public CRUD surface ---

    /// Creates an empty session with the configured lifetime defaults.
    pub async fn create(self: &Arc<Self>) -> Result<SessionId, StoreError> {
        self.create_with(self.time_to_live, self.idle_timeout).await
    }

    /// Creates an empty session with its own time-to-live and idle timeout.
    pub async fn create_with(
        self: &Arc<Self>,
        time_to_live: Duration,
        idle_timeout: Duration,
    ) -> Result<SessionId, StoreError> {
        let command = SessionCommand::Create {
            id: SessionId::new(),
            time_to_live_ms: millis(time_to_live),
            idle_timeout_ms: millis(idle_timeout),
        };
        match self.route(command).await? {
            CommandResponse::Created { id } => Ok(id),
            other => Err(self.unexpected(other)),
        }
    }

    pub async fn get(self: &Arc<Self>, id: &SessionId) -> Result<SessionSnapshot, StoreError> {
        let command = SessionCommand::Get { id: id.clone() };
        match self.route(command).await? {
            CommandResponse::Session { session } => Ok(session),
            other => Err(self.unexpected(other)),
        }
    }

    /// Creates or overwrites one attribute and refreshes the last access.
    pub async fn set_attribute(
        self: &Arc<Self>,
        id: &SessionId,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let command = SessionCommand::SetAttribute {
            id: id.clone(),
            name: name.to_string(),
            value,
        };
        match self.route(command).await? {
            CommandResponse::Done => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    pub async fn get_attribute(
        self: &Arc<Self>,
        id: &SessionId,
        name: &str,
    ) -> Result<serde_json::Value, StoreError> {
        let command = SessionCommand::GetAttribute {
            id: id.clone(),
            name: name.to_string(),
        };
        match self.route(command).await? {
            CommandResponse::Value { value } => Ok(value),
            other => Err(self.unexpected(other)),
        }
    }

    /// Removes one attribute. Removing an absent attribute is not an error.
    pub async fn remove_attribute(
        self: &Arc<Self>,
        id: &SessionId,
        name: &str,
    ) -> Result<(), StoreError> {
        let command = SessionCommand::RemoveAttribute {
            id: id.clone(),
            name: name.to_string(),
        };
        match self.route(command).await? {
            CommandResponse::Done => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    /// Deletes a session. Deleting an absent session succeeds.
    pub async fn delete(self: &Arc<Self>, id: &SessionId) -> Result<(), StoreError> {
        let command = SessionCommand::Delete { id: id.clone() };
        match self.route(command).await? {
            CommandResponse::Done => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    // --- Routing ---

    async fn route(self: &Arc<Self>, command: SessionCommand) -> Result<CommandResponse, StoreError> {
        let timeout = self.operation_timeout;
        let response = match tokio::time::timeout(timeout, self.dispatch(command)).await {
            Ok(response) => response?,
            Err(_) => {
                tracing::warn!("Session operation timed out after {:?}", timeout);
                return Err(StoreError::Timeout(timeout));
            }
        };

        match response {
            CommandResponse::SessionNotFound { id } => Err(StoreError::SessionNotFound(id)),
            CommandResponse::AttributeNotFound { id, name } => Err(StoreError::AttributeNotFound {
                session: id,
                attribute: name,
            }),
            other => Ok(other),
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        command: SessionCommand,
    ) -> Result<CommandResponse, StoreError> {
        let partition = self.partitioner.get_partition(command.session_id().as_str());
        let mut re_resolved = false;

        loop {
            let table = self.partitioner.table();
            let routed_version = table.view_version;
            let owners = table.assignment(partition);

            let attempt = match &owners.primary {
                None => Err(ClusterError::OwnershipStale {
                    partition,
                    view_version: routed_version,
                }),
                Some(primary) if primary == self.local_id() => {
                    Ok(self.execute_detached(partition, command.clone()).await)
                }
                Some(primary) => {
                    StoreStats::incr(&self.stats.forwards);
                    self.forward(primary, partition, routed_version, &command).await
                }
            };

            // The first stale answer or dead primary waits for a newer table
            // and routes again; the second one gives up.
            let wait_for = match attempt {
                Ok(CommandResponse::OwnershipStale { view_version }) => {
                    tracing::debug!(
                        "Partition {} ownership stale (routed v{}, owner at v{})",
                        partition,
                        routed_version,
                        view_version
                    );
                    if view_version > routed_version {
                        Some(view_version)
                    } else {
                        // The owner lags behind us; give it a moment to catch up.
                        None
                    }
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!("Routing partition {} failed: {}", partition, e);
                    Some(routed_version + 1)
                }
            };

            if re_resolved {
                return Err(StoreError::Timeout(self.operation_timeout));
            }
            re_resolved = true;
            match wait_for {
                Some(version) => self.wait_for_table(version).await,
                None => tokio::time::sleep(STALE_OWNER_SETTLE).await,
            }
        }
    }

    async fn forward(
        &self,
        primary: &NodeId,
        partition: u32,
        view_version: u64,
        command: &SessionCommand,
    ) -> Result<CommandResponse, ClusterError> {
        let node = self
            .membership
            .get_member(primary)
            .ok_or_else(|| ClusterError::UnknownNode(primary.clone()))?;

        let request = ForwardRequest {
            partition,
            view_version,
            command: command.clone(),
        };
        self.client
            .post_json(
                PeerClient::url(node.http_addr, ENDPOINT_EXECUTE),
                &request,
                self.operation_timeout,
                1,
            )
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))
    }

    /// Waits until the local partition table reaches `version`. Bounded by
    /// the operation timeout wrapped around the whole call.
    async fn wait_for_table(&self, version: u64) {
        while self.partitioner.view_version() < version {
            tokio::time::sleep(TABLE_POLL_INTERVAL).await;
        }
    }

    /// Gives the local table up to `bound` to reach `version`, the view a
    /// forwarding peer routed with.
    pub async fn catch_up(&self, version: u64, bound: Duration) {
        if self.partitioner.view_version() >= version {
            return;
        }
        if tokio::time::timeout(bound, self.wait_for_table(version)).await.is_err() {
            tracing::debug!(
                "Partition table still at v{} after waiting for v{}",
                self.partitioner.view_version(),
                version
            );
        }
    }

    /// Runs `command` on this node in a task of its own.
    pub async fn execute_detached(
        self: &Arc<Self>,
        partition: u32,
        command: SessionCommand,
    ) -> CommandResponse {
        let store = self.clone();
        let handle = tokio::spawn(async move { store.execute_local(partition, command).await });
        match handle.await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("Command task for partition {} failed: {}", partition, e);
                CommandResponse::OwnershipStale {
                    view_version: self.partitioner.view_version(),
                }
            }
        }
    }

    // --- Primary execution ---

    /// Executes a command against the local partition, provided this node
    /// is its primary under the current table.
    pub async fn execute_local(&self, partition: u32, command: SessionCommand) -> CommandResponse {
        while self.migrating.contains_key(&partition) {
            tokio::time::sleep(MIGRATION_POLL_INTERVAL).await;
        }

        let owners = self.partitioner.get_owners(partition);
        if !owners.is_primary(self.local_id()) {
            return CommandResponse::OwnershipStale {
                view_version: self.partitioner.view_version(),
            };
        }

        let me = self.local_id().clone();
        let now = Instant::now();

        match command {
            SessionCommand::Create {
                id,
                time_to_live_ms,
                idle_timeout_ms,
            } => {
                let entry = self.data.insert_new(
                    partition,
                    id.clone(),
                    &me,
                    Duration::from_millis(time_to_live_ms),
                    Duration::from_millis(idle_timeout_ms),
                );
                StoreStats::incr(&self.stats.creates);
                let victims = self.eviction.lock().admit(&id, partition);

                self.replicate_put(partition, &owners, &entry).await;
                self.evict(victims).await;
                self.listener.on_session_created(&id);
                CommandResponse::Created { id }
            }

            SessionCommand::Get { id } => match self.read(partition, &owners, &id, now).await {
                Some(entry) => CommandResponse::Session {
                    session: SessionSnapshot::from(&entry),
                },
                None => CommandResponse::SessionNotFound { id },
            },

            SessionCommand::GetAttribute { id, name } => {
                match self.read(partition, &owners, &id, now).await {
                    Some(entry) => match entry.attributes.get(&name) {
                        Some(value) => CommandResponse::Value {
                            value: value.clone(),
                        },
                        None => CommandResponse::AttributeNotFound { id, name },
                    },
                    None => CommandResponse::SessionNotFound { id },
                }
            }

            SessionCommand::SetAttribute { id, name, value } => {
                let written = self.data.mutate(partition, &id, &me, now, |entry| {
                    entry.attributes.insert(name, value);
                });
                self.after_write(partition, &owners, id, written.map(|(_, entry)| entry))
                    .await
            }

            SessionCommand::RemoveAttribute { id, name } => {
                let written = self.data.mutate(partition, &id, &me, now, |entry| {
                    entry.attributes.remove(&name);
                });
                self.after_write(partition, &owners, id, written.map(|(_, entry)| entry))
                    .await
            }

            SessionCommand::Delete { id } => {
                if let Some(version) = self.data.remove(partition, &id, &me, RemovalCause::Deleted)
                {
                    StoreStats::incr(&self.stats.deletes);
                    self.eviction.lock().remove(&id);
                    self.replicate_delete(partition, &owners, &id, version, RemovalCause::Deleted)
                        .await;
                    self.listener.on_session_deleted(&id);
                }
                CommandResponse::Done
            }
        }
    }

    /// Reads and touches a live entry; expired entries are removed on the spot.
    async fn read(
        &self,
        partition: u32,
        owners: &PartitionAssignment,
        id: &SessionId,
        now: Instant,
    ) -> Option<SessionEntry> {
        match self.data.read(partition, id, now, true) {
            Lookup::Found(entry) => {
                StoreStats::incr(&self.stats.reads);
                self.eviction.lock().touch(id, partition);
                self.replicate_touch(partition, owners, &entry);
                self.listener.on_session_accessed(id);
                Some(entry)
            }
            Lookup::Expired => {
                self.expire(partition, id).await;
                None
            }
            Lookup::Missing => None,
        }
    }

    async fn after_write(
        &self,
        partition: u32,
        owners: &PartitionAssignment,
        id: SessionId,
        written: Option<SessionEntry>,
    ) -> CommandResponse {
        match written {
            Some(entry) => {
                StoreStats::incr(&self.stats.writes);
                self.eviction.lock().touch(&id, partition);
                self.replicate_put(partition, owners, &entry).await;
                self.listener.on_session_accessed(&id);
                CommandResponse::Done
            }
            None => {
                // Absent, or present but past its deadline.
                self.expire(partition, &id).await;
                CommandResponse::SessionNotFound { id }
            }
        }
    }

    /// Removes `id` if it is still expired, as a replicated delete.
    pub(super) async fn expire(&self, partition: u32, id: &SessionId) -> bool {
        let Some(version) =
            self.data
                .remove_if_expired(partition, id, self.local_id(), Instant::now())
        else {
            return false;
        };

        StoreStats::incr(&self.stats.expirations);
        self.eviction.lock().remove(id);
        let owners = self.partitioner.get_owners(partition);
        self.replicate_delete(partition, &owners, id, version, RemovalCause::Expired)
            .await;
        self.listener.on_session_expired(id);
        true
    }

    /// Removes LRU victims as replicated deletes.
    pub(super) async fn evict(&self, victims: Vec<(SessionId, u32)>) {
        for (id, partition) in victims {
            let Some(version) =
                self.data
                    .remove(partition, &id, self.local_id(), RemovalCause::Evicted)
            else {
                continue;
            };

            StoreStats::incr(&self.stats.evictions);
            tracing::debug!("Evicted session {} from partition {}", id, partition);
            let owners = self.partitioner.get_owners(partition);
            self.replicate_delete(partition, &owners, &id, version, RemovalCause::Evicted)
                .await;
            self.listener.on_session_evicted(&id);
        }
    }

    // --- Replication glue ---

    async fn replicate_put(
        &self,
        partition: u32,
        owners: &PartitionAssignment,
        entry: &SessionEntry,
    ) {
        let request = ReplicateRequest {
            partition,
            key: entry.id.clone(),
            version: entry.version.clone(),
            op: ReplicaOp::Put {
                entry: entry.to_record(),
            },
        };
        self.replicator.replicate(&owners.backups, request).await;
    }

    async fn replicate_delete(
        &self,
        partition: u32,
        owners: &PartitionAssignment,
        id: &SessionId,
        version: EntryVersion,
        cause: RemovalCause,
    ) {
        let request = ReplicateRequest {
            partition,
            key: id.clone(),
            version,
            op: ReplicaOp::Delete { cause },
        };
        self.replicator.replicate(&owners.backups, request).await;
    }

    /// Access-time refresh for the backups, sent in the background.
    fn replicate_touch(&self, partition: u32, owners: &PartitionAssignment, entry: &SessionEntry) {
        if owners.backups.is_empty() {
            return;
        }
        let request = ReplicateRequest {
            partition,
            key: entry.id.clone(),
            version: entry.version.clone(),
            op: ReplicaOp::Touch {
                idle_ms: 0,
                accessed_at_ms: now_ms(),
            },
        };
        let replicator = self.replicator.clone();
        let backups = owners.backups.clone();
        tokio::spawn(async move {
            replicator.replicate(&backups, request).await;
        });
    }

    /// Applies a change received from a partition primary.
    pub fn apply_replica(&self, request: ReplicateRequest) -> bool {
        let ReplicateRequest {
            partition,
            key,
            version,
            op,
        } = request;

        match op {
            ReplicaOp::Put { entry } => {
                if entry.id != key || entry.version != version {
                    tracing::warn!("Rejecting malformed replica of {}", key);
                    return false;
                }
                self.data.apply_put(partition, entry)
            }
            ReplicaOp::Delete { cause } => {
                let applied = self.data.apply_delete(partition, &key, version, cause);
                if applied {
                    // Only meaningful if this node was primary under an older table.
                    self.eviction.lock().remove(&key);
                }
                applied
            }
            ReplicaOp::Touch {
                idle_ms,
                accessed_at_ms,
            } => self.data.apply_touch(
                partition,
                &key,
                &version,
                Duration::from_millis(idle_ms),
                accessed_at_ms,
            ),
        }
    }

    // --- Introspection ---

    pub fn local_id(&self) -> &NodeId {
        self.membership.local_id()
    }

    pub fn membership(&self) -> &Arc<MembershipService> {
        &self.membership
    }

    /// Time-to-live and idle timeout applied by [`create`](Self::create).
    pub fn default_lifetimes(&self) -> (Duration, Duration) {
        (self.time_to_live, self.idle_timeout)
    }

    pub fn partitioner(&self) -> &Arc<PartitionManager> {
        &self.partitioner
    }

    /// Entry held locally, as primary or backup, without touching it.
    pub fn local_entry(&self, id: &SessionId) -> Option<SessionEntry> {
        let partition = self.partitioner.get_partition(id.as_str());
        self.data.get_local(partition, id)
    }

    pub fn stats(&self) -> StatsResponse {
        let table = self.partitioner.table();
        let me = self.local_id();
        let mut primary_partitions = 0;
        let mut backup_partitions = 0;
        let mut primary_entries = 0;
        for partition in 0..self.partitioner.num_partitions {
            let assignment = table.assignment(partition);
            if assignment.is_primary(me) {
                primary_partitions += 1;
                primary_entries += self.data.partition_len(partition);
            } else if assignment.is_backup(me) {
                backup_partitions += 1;
            }
        }

        let stats = &self.stats;
        StatsResponse {
            node_id: me.to_string(),
            view_version: table.view_version,
            members: self.membership.view().len(),
            entries: self.data.entry_count(),
            primary_entries,
            primary_partitions,
            backup_partitions,
            creates: StoreStats::get(&stats.creates),
            reads: StoreStats::get(&stats.reads),
            writes: StoreStats::get(&stats.writes),
            deletes: StoreStats::get(&stats.deletes),
            expirations: StoreStats::get(&stats.expirations),
            evictions: StoreStats::get(&stats.evictions),
            forwards: StoreStats::get(&stats.forwards),
            degraded_replications: StoreStats::get(&stats.degraded_replications),
            promotions: StoreStats::get(&stats.promotions),
            migrations: StoreStats::get(&stats.migrations),
        }
    }

    fn unexpected(&self, response: CommandResponse) -> StoreError {
        tracing::error!("Unexpected response from primary: {:?}", response);
        StoreError::Timeout(self.operation_timeout)
    }
}

impl From<&SessionEntry> for SessionSnapshot {
    fn from(entry: &SessionEntry) -> Self {
        Self {
            id: entry.id.clone(),
            attributes: entry.attributes.clone(),
            state: entry.state,
            created_at_ms: entry.created_at_ms,
            last_accessed_at_ms: entry.last_accessed_at_ms,
            version: entry.version.counter,
        }
    }
}
