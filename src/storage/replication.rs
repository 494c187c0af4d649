//! Replication Engine
//!
//! ## Core Mechanisms
//! - **Synchronous fan-out**: every change on a primary is pushed to all
//!   backups of its partition before the client call returns. Each backup
//!   is written by its own task bounded by the backup timeout; a backup that
//!   fails or times out is logged as degraded and counted, but never fails
//!   the write.
//! - **Rebalancing**: every new cluster view recomputes the partition table.
//!   For each partition whose owners moved, this node pulls, pushes,
//!   promotes or drops data depending on its old and new role.
//!
//! ## Responsibilities
//! - A backup promoted to primary already holds the shadow copies, so it
//!   only starts tracking them for eviction.
//! - A node that becomes primary without having been an owner pulls the
//!   partition from the previous owners that are still alive. With none
//!   left, it starts empty and says so in the log.
//! - A primary pushes its partition to newly assigned backups; a demoted
//!   primary pushes to its successor so late writes are not lost.
//! - A node that owns a partition in no role any more drops it after a
//!   short grace period.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::partitioner::{OwnershipChange, assign};
use super::protocol::{
    AckResponse, ENDPOINT_PARTITION, ENDPOINT_REPLICATE, PartitionSnapshot, ReplicateRequest,
};
use super::stats::StoreStats;
use super::store::SessionStore;
use super::transport::PeerClient;
use crate::error::ClusterError;
use crate::membership::service::MembershipService;
use crate::membership::types::{ClusterView, NodeId};

/// How long a former owner keeps a partition before dropping it.
const HANDOFF_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct Replicator {
    membership: Arc<MembershipService>,
    client: PeerClient,
    backup_timeout: Duration,
    stats: Arc<StoreStats>,
}

impl Replicator {
    pub fn new(
        membership: Arc<MembershipService>,
        client: PeerClient,
        backup_timeout: Duration,
        stats: Arc<StoreStats>,
    ) -> Self {
        Self {
            membership,
            client,
            backup_timeout,
            stats,
        }
    }

    /// Sends `request` to every backup and waits for all answers. Returns
    /// how many backups acknowledged.
    pub async fn replicate(&self, backups: &[NodeId], request: ReplicateRequest) -> usize {
        if backups.is_empty() {
            return 0;
        }

        let request = Arc::new(request);
        let mut handles = Vec::with_capacity(backups.len());

        for backup in backups {
            let replicator = self.clone();
            let backup = backup.clone();
            let request = request.clone();
            // Spawned so the write completes even if the caller is dropped.
            handles.push(tokio::spawn(async move {
                match replicator.send(&backup, &request).await {
                    Ok(()) => true,
                    Err(e) => {
                        StoreStats::incr(&replicator.stats.degraded_replications);
                        tracing::warn!(
                            "Degraded replication of {} (partition {}, v{}): {}",
                            request.key,
                            request.partition,
                            request.version,
                            e
                        );
                        false
                    }
                }
            }));
        }

        let mut acked = 0;
        for handle in handles {
            if let Ok(true) = handle.await {
                acked += 1;
            }
        }
        acked
    }

    async fn send(&self, backup: &NodeId, request: &ReplicateRequest) -> Result<(), ClusterError> {
        let degraded = |reason: String| ClusterError::ReplicationDegraded {
            node: backup.clone(),
            reason,
        };

        let node = self
            .membership
            .get_member(backup)
            .ok_or_else(|| degraded("unknown backup".to_string()))?;

        let url = PeerClient::url(node.http_addr, ENDPOINT_REPLICATE);
        let ack: AckResponse = self
            .client
            .post_json(url, request, self.backup_timeout, 1)
            .await
            .map_err(|e| degraded(e.to_string()))?;

        if !ack.success {
            return Err(degraded("backup refused the change".to_string()));
        }
        Ok(())
    }
}

impl SessionStore {
    /// Follows membership views until shutdown, rebalancing on each one.
    pub async fn run_rebalance_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut views = self.membership.subscribe();
        // Catch up with whatever view is installed right now.
        let current = self.membership.view();
        self.rebalance(&current).await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = views.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let view = views.borrow_and_update().clone();
            self.rebalance(&view).await;
        }
    }

    /// Installs the partition table for `view` and moves data accordingly.
    pub async fn rebalance(self: &Arc<Self>, view: &ClusterView) {
        let me = self.local_id().clone();

        // Partitions this node takes over are blocked before the new table
        // becomes visible, so no command runs against them half-filled.
        let changes = self.partitioner.refresh_with(view, |changes| {
            for change in changes {
                if change.current.is_primary(&me) && !change.previous.is_primary(&me) {
                    self.migrating.insert(change.partition, ());
                }
            }
        });
        if changes.is_empty() {
            return;
        }

        let pulls: Vec<&OwnershipChange> = changes
            .iter()
            .filter(|change| self.migrating.contains_key(&change.partition))
            .collect();

        for change in &pulls {
            self.take_over(change, view).await;
            self.migrating.remove(&change.partition);
        }

        for change in &changes {
            let was_primary = change.previous.is_primary(&me);
            let is_primary = change.current.is_primary(&me);

            if is_primary {
                for backup in &change.current.backups {
                    if !change.previous.is_owner(backup) {
                        self.spawn_push(change.partition, backup.clone());
                    }
                }
            } else if was_primary {
                self.eviction.lock().forget_partition(change.partition);
                if let Some(successor) = &change.current.primary {
                    self.spawn_push(change.partition, successor.clone());
                }
            }

            if change.previous.is_owner(&me) && !change.current.is_owner(&me) {
                self.spawn_handoff(change.partition);
            }
        }
    }

    /// Makes this node a working primary for `change.partition`.
    async fn take_over(self: &Arc<Self>, change: &OwnershipChange, view: &ClusterView) {
        let me = self.local_id();
        let partition = change.partition;
        let was_backup = change.previous.is_backup(me);

        // A node that just joined has no table of its own to compare with.
        // Rendezvous ranking without this node is what the others used.
        let previous = if change.previous.primary.is_none() {
            assign(
                &view.without_member(me),
                partition,
                self.partitioner.backup_count(),
            )
        } else {
            change.previous.clone()
        };

        let sources: Vec<NodeId> = previous
            .owners()
            .filter(|owner| *owner != me && view.contains(owner))
            .cloned()
            .collect();

        let mut pulled = false;
        for source in &sources {
            match self.pull_partition(source, partition).await {
                Ok(snapshot) => {
                    let applied = self.data.apply_snapshot(snapshot);
                    StoreStats::incr(&self.stats.migrations);
                    tracing::debug!(
                        "Pulled partition {} from {} ({} item(s) applied)",
                        partition,
                        source,
                        applied
                    );
                    pulled = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!("Pulling partition {} from {} failed: {}", partition, source, e);
                }
            }
        }

        if was_backup {
            StoreStats::incr(&self.stats.promotions);
            tracing::info!("Promoted to primary for partition {}", partition);
        } else if !pulled && previous.primary.is_some() {
            tracing::warn!(
                "No surviving owner for partition {}; starting empty, sessions may be lost",
                partition
            );
        }

        let ids = self.data.ids_in(partition);
        let victims = {
            let mut eviction = self.eviction.lock();
            for id in &ids {
                eviction.touch(id, partition);
            }
            eviction.overflow()
        };
        self.evict(victims).await;
    }

    async fn pull_partition(
        &self,
        source: &NodeId,
        partition: u32,
    ) -> Result<PartitionSnapshot, ClusterError> {
        let node = self
            .membership
            .get_member(source)
            .ok_or_else(|| ClusterError::UnknownNode(source.clone()))?;
        let url = PeerClient::url(
            node.http_addr,
            &format!("{}/{}", ENDPOINT_PARTITION, partition),
        );
        self.client
            .get_json(url, self.backup_timeout, 3)
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))
    }

    fn spawn_push(self: &Arc<Self>, partition: u32, target: NodeId) {
        let store = self.clone();
        tokio::spawn(async move {
            if let Err(e) = store.push_partition(&target, partition).await {
                tracing::warn!("Pushing partition {} to {} failed: {}", partition, target, e);
            }
        });
    }

    async fn push_partition(&self, target: &NodeId, partition: u32) -> Result<(), ClusterError> {
        let snapshot = self.data.dump_partition(partition);
        if snapshot.entries.is_empty() && snapshot.tombstones.is_empty() {
            return Ok(());
        }

        let node = self
            .membership
            .get_member(target)
            .ok_or_else(|| ClusterError::UnknownNode(target.clone()))?;
        let url = PeerClient::url(
            node.http_addr,
            &format!("{}/{}", ENDPOINT_PARTITION, partition),
        );
        let ack: AckResponse = self
            .client
            .post_json(url, &snapshot, self.backup_timeout, 3)
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;

        StoreStats::incr(&self.stats.migrations);
        tracing::debug!(
            "Pushed partition {} to {} ({} item(s) applied)",
            partition,
            target,
            ack.applied
        );
        Ok(())
    }

    /// Drops `partition` after a grace period unless ownership came back.
    fn spawn_handoff(self: &Arc<Self>, partition: u32) {
        let store = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(HANDOFF_GRACE).await;
            if store.partitioner.get_owners(partition).is_owner(store.local_id()) {
                return;
            }
            let dropped = store.data.drop_partition(partition);
            if dropped > 0 {
                tracing::debug!("Dropped {} entries of partition {}", dropped, partition);
            }
        });
    }

    /// Accepts a partition pushed by another owner.
    pub fn accept_snapshot(&self, snapshot: PartitionSnapshot) -> usize {
        let partition = snapshot.partition;
        let applied = self.data.apply_snapshot(snapshot);
        if self.partitioner.get_owners(partition).is_primary(self.local_id()) {
            let mut eviction = self.eviction.lock();
            for id in self.data.ids_in(partition) {
                eviction.touch(&id, partition);
            }
        }
        applied
    }

    pub fn partition_snapshot(&self, partition: u32) -> PartitionSnapshot {
        self.data.dump_partition(partition)
    }
}
