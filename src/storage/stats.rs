use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters of what this node did as a primary or backup.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub creates: AtomicU64,
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub deletes: AtomicU64,
    pub expirations: AtomicU64,
    pub evictions: AtomicU64,
    pub forwards: AtomicU64,
    pub degraded_replications: AtomicU64,
    pub promotions: AtomicU64,
    pub migrations: AtomicU64,
}

impl StoreStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
