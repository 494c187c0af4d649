//! Partition Map
//!
//! Keys hash into one of `P` partitions. For each partition the members of the
//! current view are ranked by a stable hash of `(node id, partition)`
//! (rendezvous hashing): the first node is the primary, the next `B` are the
//! backups. Adding or removing a node only moves the partitions where that node
//! enters or leaves the top `B + 1`, so unaffected partitions keep their owners.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::membership::service::MembershipService;
use crate::membership::types::{ClusterView, NodeId};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionAssignment {
    pub primary: Option<NodeId>,
    pub backups: Vec<NodeId>,
}

impl PartitionAssignment {
    pub fn is_primary(&self, node: &NodeId) -> bool {
        self.primary.as_ref() == Some(node)
    }

    pub fn is_backup(&self, node: &NodeId) -> bool {
        self.backups.contains(node)
    }

    pub fn is_owner(&self, node: &NodeId) -> bool {
        self.is_primary(node) || self.is_backup(node)
    }

    /// Primary followed by backups, in priority order.
    pub fn owners(&self) -> impl Iterator<Item = &NodeId> {
        self.primary.iter().chain(self.backups.iter())
    }
}

/// Assignments for every partition, derived from one view version.
#[derive(Debug, Clone, Default)]
pub struct PartitionTable {
    pub view_version: u64,
    assignments: Vec<PartitionAssignment>,
}

impl PartitionTable {
    pub fn compute(view: &ClusterView, partitions: u32, backups: usize) -> Self {
        Self {
            view_version: view.version,
            assignments: (0..partitions)
                .map(|partition| assign(view, partition, backups))
                .collect(),
        }
    }

    pub fn assignment(&self, partition: u32) -> PartitionAssignment {
        self.assignments
            .get(partition as usize)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Partitions whose owner set differs between `self` and `next`.
    pub fn diff(&self, next: &PartitionTable) -> Vec<OwnershipChange> {
        next.assignments
            .iter()
            .enumerate()
            .filter_map(|(index, current)| {
                let previous = self.assignments.get(index).cloned().unwrap_or_default();
                (previous != *current).then(|| OwnershipChange {
                    partition: index as u32,
                    previous,
                    current: current.clone(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct OwnershipChange {
    pub partition: u32,
    pub previous: PartitionAssignment,
    pub current: PartitionAssignment,
}

pub struct PartitionManager {
    pub num_partitions: u32,
    backup_count: usize,
    membership: Arc<MembershipService>,
    table: RwLock<Arc<PartitionTable>>,
}

impl PartitionManager {
    pub fn new(
        membership: Arc<MembershipService>,
        num_partitions: u32,
        backup_count: usize,
    ) -> Arc<Self> {
        let table = PartitionTable::compute(&membership.view(), num_partitions, backup_count);
        Arc::new(Self {
            num_partitions,
            backup_count,
            membership,
            table: RwLock::new(Arc::new(table)),
        })
    }

    pub fn get_partition(&self, key: &str) -> u32 {
        partition_for(key, self.num_partitions)
    }

    pub fn get_owners(&self, partition: u32) -> PartitionAssignment {
        self.table.read().assignment(partition)
    }

    pub fn table(&self) -> Arc<PartitionTable> {
        self.table.read().clone()
    }

    pub fn view_version(&self) -> u64 {
        self.table.read().view_version
    }

    pub fn backup_count(&self) -> usize {
        self.backup_count
    }

    /// Recomputes the table for `view` and returns what moved. Views that
    /// are not newer than the current table are ignored.
    pub fn refresh(&self, view: &ClusterView) -> Vec<OwnershipChange> {
        self.refresh_with(view, |_| {})
    }

    /// Like [`refresh`](Self::refresh), but runs `before_install` on the
    /// changes while readers still see the previous table.
    pub fn refresh_with<F>(&self, view: &ClusterView, before_install: F) -> Vec<OwnershipChange>
    where
        F: FnOnce(&[OwnershipChange]),
    {
        let mut table = self.table.write();
        if view.version <= table.view_version {
            return Vec::new();
        }

        let next = PartitionTable::compute(view, self.num_partitions, self.backup_count);
        let changes = table.diff(&next);
        before_install(&changes);
        tracing::info!(
            "Partition table v{} -> v{}: {} partition(s) changed owners",
            table.view_version,
            next.view_version,
            changes.len()
        );
        *table = Arc::new(next);
        changes
    }

    pub fn my_primary_partitions(&self) -> Vec<u32> {
        let my_id = self.membership.local_id();
        let table = self.table();

        (0..self.num_partitions)
            .filter(|&partition| table.assignment(partition).is_primary(my_id))
            .collect()
    }
}

pub fn partition_for(key: &str, partitions: u32) -> u32 {
    (fnv1a(key.as_bytes(), FNV_OFFSET) % u64::from(partitions.max(1))) as u32
}

/// Owner ranking for one partition of `view`.
pub fn assign(view: &ClusterView, partition: u32, backups: usize) -> PartitionAssignment {
    let mut ranked: Vec<(u64, &NodeId)> = view
        .members
        .iter()
        .map(|node| (rendezvous_score(&node.id, partition), &node.id))
        .collect();
    ranked.sort_by(|(score_a, id_a), (score_b, id_b)| {
        score_b.cmp(score_a).then_with(|| id_a.cmp(id_b))
    });

    let mut owners = ranked.into_iter().map(|(_, id)| id.clone());
    let primary = owners.next();
    PartitionAssignment {
        primary,
        backups: owners.take(backups).collect(),
    }
}

fn rendezvous_score(node: &NodeId, partition: u32) -> u64 {
    let seeded = fnv1a(&partition.to_le_bytes(), FNV_OFFSET);
    let hash = fnv1a(node.as_str().as_bytes(), seeded);
    // Final avalanche so ids sharing a prefix still spread.
    let mut x = hash;
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^ (x >> 33)
}

fn fnv1a(bytes: &[u8], seed: u64) -> u64 {
    bytes.iter().fold(seed, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}
