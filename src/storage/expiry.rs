//! Background expiry sweep.
//!
//! Reads already treat an expired entry as absent. The sweeper makes sure
//! entries nobody reads again are also removed, replicated to the backups
//! and reported to the listener. Only partitions this node is primary for
//! are swept; backups learn about expirations from their primary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::store::SessionStore;

impl SessionStore {
    pub async fn run_expiry_sweeper(
        self: Arc<Self>,
        interval: Duration,
        tombstone_retention: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let expired = self.sweep_expired().await;
            let pruned = self.data.prune_tombstones(tombstone_retention);
            if expired > 0 || pruned > 0 {
                tracing::debug!(
                    "Expiry sweep removed {} session(s), pruned {} tombstone(s)",
                    expired,
                    pruned
                );
            }
        }
    }

    /// Removes every expired entry of the local primary partitions.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        for partition in self.partitioner.my_primary_partitions() {
            for id in self.data.expired_in(partition, now) {
                if self.expire(partition, &id).await {
                    removed += 1;
                }
            }
        }

        removed
    }
}
