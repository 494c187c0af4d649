//! Local partition table.
//!
//! Holds every entry this node stores, whether as primary or as a backup
//! shadow; which role applies is decided by the partition table, not here.
//! Each partition sits behind its own lock, so writes to different
//! partitions never contend and writes to the same key are serialized.
//!
//! Replicated changes are applied last-writer-wins on [`EntryVersion`]:
//! removed entries leave a tombstone carrying the removal version, so a
//! delayed older write can never bring them back.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::entry::{
    EntryRecord, EntryVersion, RemovalCause, SessionEntry, SessionId, Tombstone,
};
use super::protocol::{PartitionSnapshot, TombstoneRecord};
use crate::membership::types::NodeId;

#[derive(Default)]
struct PartitionData {
    entries: HashMap<SessionId, SessionEntry>,
    tombstones: HashMap<SessionId, Tombstone>,
}

impl PartitionData {
    fn latest_version(&self, id: &SessionId) -> Option<EntryVersion> {
        let live = self.entries.get(id).map(|entry| &entry.version);
        let dead = self.tombstones.get(id).map(|tombstone| &tombstone.version);
        live.max(dead).cloned()
    }

    fn bury(&mut self, id: &SessionId, version: EntryVersion, cause: RemovalCause) {
        let newer = self
            .tombstones
            .get(id)
            .is_none_or(|existing| version > existing.version);
        if newer {
            self.tombstones.insert(
                id.clone(),
                Tombstone {
                    version,
                    cause,
                    removed_at: Instant::now(),
                },
            );
        }
    }
}

/// Result of looking an entry up on its primary.
#[derive(Debug)]
pub enum Lookup {
    Found(SessionEntry),
    /// Present but past its deadline; the caller removes it.
    Expired,
    Missing,
}

pub struct PartitionStore {
    partitions: Vec<Mutex<PartitionData>>,
}

impl PartitionStore {
    pub fn new(partition_count: u32) -> Self {
        Self {
            partitions: (0..partition_count.max(1))
                .map(|_| Mutex::new(PartitionData::default()))
                .collect(),
        }
    }

    fn slot(&self, partition: u32) -> &Mutex<PartitionData> {
        &self.partitions[partition as usize % self.partitions.len()]
    }

    // --- Primary-side operations ---

    /// Creates a fresh entry. Its version dominates any tombstone left by a
    /// previous session with the same id.
    pub fn insert_new(
        &self,
        partition: u32,
        id: SessionId,
        origin: &NodeId,
        time_to_live: Duration,
        idle_timeout: Duration,
    ) -> SessionEntry {
        let mut data = self.slot(partition).lock();
        let version = match data.latest_version(&id) {
            Some(previous) => previous.next(origin),
            None => EntryVersion::initial(origin),
        };
        let entry = SessionEntry::new(id.clone(), version, time_to_live, idle_timeout);
        data.tombstones.remove(&id);
        data.entries.insert(id, entry.clone());
        entry
    }

    /// Reads an entry and, when `touch` is set, records the access.
    pub fn read(&self, partition: u32, id: &SessionId, now: Instant, touch: bool) -> Lookup {
        let mut data = self.slot(partition).lock();
        match data.entries.get_mut(id) {
            Some(entry) if entry.is_expired(now) => Lookup::Expired,
            Some(entry) => {
                if touch {
                    entry.touch(now);
                }
                Lookup::Found(entry.clone())
            }
            None => Lookup::Missing,
        }
    }

    /// Applies `change` to a live entry, touching it and issuing a new version.
    /// Returns `None` when the entry is absent or already expired.
    pub fn mutate<R>(
        &self,
        partition: u32,
        id: &SessionId,
        origin: &NodeId,
        now: Instant,
        change: impl FnOnce(&mut SessionEntry) -> R,
    ) -> Option<(R, SessionEntry)> {
        let mut data = self.slot(partition).lock();
        let entry = data.entries.get_mut(id)?;
        if entry.is_expired(now) {
            return None;
        }
        let result = change(entry);
        entry.touch(now);
        entry.version = entry.version.next(origin);
        Some((result, entry.clone()))
    }

    /// Removes an entry and returns the version of its tombstone.
    pub fn remove(
        &self,
        partition: u32,
        id: &SessionId,
        origin: &NodeId,
        cause: RemovalCause,
    ) -> Option<EntryVersion> {
        let mut data = self.slot(partition).lock();
        let entry = data.entries.remove(id)?;
        let version = entry.version.next(origin);
        data.bury(id, version.clone(), cause);
        Some(version)
    }

    /// Like [`remove`](Self::remove), but only if the entry is still expired
    /// under the lock; a concurrent access may have revived it.
    pub fn remove_if_expired(
        &self,
        partition: u32,
        id: &SessionId,
        origin: &NodeId,
        now: Instant,
    ) -> Option<EntryVersion> {
        let mut data = self.slot(partition).lock();
        if !data.entries.get(id).is_some_and(|entry| entry.is_expired(now)) {
            return None;
        }
        let entry = data.entries.remove(id)?;
        let version = entry.version.next(origin);
        data.bury(id, version.clone(), RemovalCause::Expired);
        Some(version)
    }

    // --- Replica-side operations ---

    /// Stores `record` unless a newer version (live or removed) is known.
    pub fn apply_put(&self, partition: u32, record: EntryRecord) -> bool {
        let mut data = self.slot(partition).lock();
        let newer = data
            .latest_version(&record.id)
            .is_none_or(|current| record.version > current);
        if !newer {
            return false;
        }
        let entry = SessionEntry::from_record(record);
        data.tombstones.remove(&entry.id);
        data.entries.insert(entry.id.clone(), entry);
        true
    }

    /// Removes the entry if `version` dominates it, and remembers the removal
    /// either way so older puts arriving later are rejected.
    pub fn apply_delete(
        &self,
        partition: u32,
        id: &SessionId,
        version: EntryVersion,
        cause: RemovalCause,
    ) -> bool {
        let mut data = self.slot(partition).lock();
        if let Some(entry) = data.entries.get(id)
            && entry.version >= version
        {
            return false;
        }
        data.entries.remove(id);
        data.bury(id, version, cause);
        true
    }

    /// Refreshes the last access of a shadow copy at exactly `version`.
    pub fn apply_touch(
        &self,
        partition: u32,
        id: &SessionId,
        version: &EntryVersion,
        idle: Duration,
        accessed_at_ms: u64,
    ) -> bool {
        let mut data = self.slot(partition).lock();
        match data.entries.get_mut(id) {
            Some(entry) if &entry.version == version => {
                entry.apply_idle(idle, accessed_at_ms);
                true
            }
            _ => false,
        }
    }

    // --- Bulk operations ---

    pub fn get_local(&self, partition: u32, id: &SessionId) -> Option<SessionEntry> {
        self.slot(partition).lock().entries.get(id).cloned()
    }

    pub fn tombstone(&self, partition: u32, id: &SessionId) -> Option<Tombstone> {
        self.slot(partition).lock().tombstones.get(id).cloned()
    }

    pub fn dump_partition(&self, partition: u32) -> PartitionSnapshot {
        let data = self.slot(partition).lock();
        PartitionSnapshot {
            partition,
            entries: data.entries.values().map(SessionEntry::to_record).collect(),
            tombstones: data
                .tombstones
                .iter()
                .map(|(id, tombstone)| TombstoneRecord {
                    id: id.clone(),
                    version: tombstone.version.clone(),
                    cause: tombstone.cause,
                })
                .collect(),
        }
    }

    /// Merges a snapshot received from another owner; returns how many
    /// items won over the local state.
    pub fn apply_snapshot(&self, snapshot: PartitionSnapshot) -> usize {
        let partition = snapshot.partition;
        let mut applied = 0;
        for tombstone in snapshot.tombstones {
            if self.apply_delete(partition, &tombstone.id, tombstone.version, tombstone.cause) {
                applied += 1;
            }
        }
        for record in snapshot.entries {
            if self.apply_put(partition, record) {
                applied += 1;
            }
        }
        applied
    }

    /// Discards every entry and tombstone of `partition`.
    pub fn drop_partition(&self, partition: u32) -> usize {
        let mut data = self.slot(partition).lock();
        let dropped = data.entries.len();
        *data = PartitionData::default();
        dropped
    }

    pub fn ids_in(&self, partition: u32) -> Vec<SessionId> {
        self.slot(partition).lock().entries.keys().cloned().collect()
    }

    pub fn expired_in(&self, partition: u32, now: Instant) -> Vec<SessionId> {
        self.slot(partition)
            .lock()
            .entries
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.id.clone())
            .collect()
    }

    /// Forgets tombstones older than `retention`.
    pub fn prune_tombstones(&self, retention: Duration) -> usize {
        let mut pruned = 0;
        for slot in &self.partitions {
            let mut data = slot.lock();
            let before = data.tombstones.len();
            data.tombstones
                .retain(|_, tombstone| tombstone.removed_at.elapsed() < retention);
            pruned += before - data.tombstones.len();
        }
        pruned
    }

    pub fn partition_len(&self, partition: u32) -> usize {
        self.slot(partition).lock().entries.len()
    }

    pub fn has_partition(&self, partition: u32) -> bool {
        self.partition_len(partition) > 0
    }

    pub fn entry_count(&self) -> usize {
        self.partitions.iter().map(|slot| slot.lock().entries.len()).sum()
    }
}
