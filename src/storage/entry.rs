//! Session entries and their bookkeeping.
//!
//! An entry expires at `min(last_access + idle_timeout, created + time_to_live)`.
//! Both instants are monotonic and local to the node holding the entry; when an
//! entry crosses the wire it travels as an [`EntryRecord`] carrying ages instead
//! of instants, and the receiver rebuilds its own instants from them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::clock::{instant_ago, millis, now_ms};
use crate::membership::types::NodeId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Logical version of an entry. Ordered by counter first; the origin node
/// only breaks ties between writers that raced with the same counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryVersion {
    pub counter: u64,
    pub origin: NodeId,
}

impl EntryVersion {
    pub fn initial(origin: &NodeId) -> Self {
        Self {
            counter: 1,
            origin: origin.clone(),
        }
    }

    /// The version that dominates `self`, issued by `origin`.
    pub fn next(&self, origin: &NodeId) -> Self {
        Self {
            counter: self.counter + 1,
            origin: origin.clone(),
        }
    }
}

impl fmt::Display for EntryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.origin)
    }
}

/// Non-terminal lifecycle states. Terminal states are recorded on the
/// [`Tombstone`] left behind when the entry is removed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemovalCause {
    Deleted,
    Expired,
    Evicted,
}

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: SessionId,
    pub attributes: HashMap<String, serde_json::Value>,
    pub state: SessionState,
    pub version: EntryVersion,
    /// Wall-clock creation time, for reporting only.
    pub created_at_ms: u64,
    /// Wall-clock time of the last access, for reporting only.
    pub last_accessed_at_ms: u64,
    pub time_to_live: Duration,
    pub idle_timeout: Duration,
    created: Instant,
    last_access: Instant,
}

impl SessionEntry {
    pub fn new(
        id: SessionId,
        version: EntryVersion,
        time_to_live: Duration,
        idle_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        let wall = now_ms();
        Self {
            id,
            attributes: HashMap::new(),
            state: SessionState::Created,
            version,
            created_at_ms: wall,
            last_accessed_at_ms: wall,
            time_to_live,
            idle_timeout,
            created: now,
            last_access: now,
        }
    }

    pub fn expires_at(&self) -> Instant {
        let idle_deadline = self.last_access + self.idle_timeout;
        let ttl_deadline = self.created + self.time_to_live;
        idle_deadline.min(ttl_deadline)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at() <= now
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    /// Records an access: refreshes the idle deadline and leaves `Created`.
    pub fn touch(&mut self, now: Instant) {
        self.last_access = now;
        self.last_accessed_at_ms = now_ms();
        self.state = SessionState::Active;
    }

    pub fn to_record(&self) -> EntryRecord {
        let now = Instant::now();
        EntryRecord {
            id: self.id.clone(),
            attributes: self.attributes.clone(),
            state: self.state,
            version: self.version.clone(),
            created_at_ms: self.created_at_ms,
            last_accessed_at_ms: self.last_accessed_at_ms,
            age_ms: millis(now.saturating_duration_since(self.created)),
            idle_ms: millis(now.saturating_duration_since(self.last_access)),
            time_to_live_ms: millis(self.time_to_live),
            idle_timeout_ms: millis(self.idle_timeout),
        }
    }

    pub fn from_record(record: EntryRecord) -> Self {
        let now = Instant::now();
        Self {
            id: record.id,
            attributes: record.attributes,
            state: record.state,
            version: record.version,
            created_at_ms: record.created_at_ms,
            last_accessed_at_ms: record.last_accessed_at_ms,
            time_to_live: Duration::from_millis(record.time_to_live_ms),
            idle_timeout: Duration::from_millis(record.idle_timeout_ms),
            created: instant_ago(now, Duration::from_millis(record.age_ms)),
            last_access: instant_ago(now, Duration::from_millis(record.idle_ms)),
        }
    }

    /// Applies an idle duration reported by the primary, never moving the
    /// last access backwards.
    pub fn apply_idle(&mut self, idle: Duration, accessed_at_ms: u64) {
        let reported = instant_ago(Instant::now(), idle);
        if reported >= self.last_access {
            self.last_access = reported;
            self.last_accessed_at_ms = accessed_at_ms;
            self.state = SessionState::Active;
        }
    }
}

/// Wire form of a [`SessionEntry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    pub id: SessionId,
    pub attributes: HashMap<String, serde_json::Value>,
    pub state: SessionState,
    pub version: EntryVersion,
    pub created_at_ms: u64,
    pub last_accessed_at_ms: u64,
    /// Time since creation, measured by the sender.
    pub age_ms: u64,
    /// Time since last access, measured by the sender.
    pub idle_ms: u64,
    pub time_to_live_ms: u64,
    pub idle_timeout_ms: u64,
}

/// What remains of a removed entry: enough to reject writes it supersedes.
#[derive(Debug, Clone)]
pub struct Tombstone {
    pub version: EntryVersion,
    pub cause: RemovalCause,
    pub removed_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ttl: Duration, idle: Duration) -> SessionEntry {
        SessionEntry::new(
            SessionId::new(),
            EntryVersion::initial(&NodeId("n1".into())),
            ttl,
            idle,
        )
    }

    #[test]
    fn test_expiry_is_idle_deadline_when_sooner() {
        let e = entry(Duration::from_secs(1800), Duration::from_secs(900));
        assert_eq!(e.expires_at(), e.last_access() + Duration::from_secs(900));
        assert!(!e.is_expired(Instant::now()));
        assert!(e.is_expired(Instant::now() + Duration::from_secs(901)));
    }

    #[test]
    fn test_ttl_caps_idle_refresh() {
        let mut e = entry(Duration::from_secs(10), Duration::from_secs(60));
        let later = Instant::now() + Duration::from_secs(5);
        e.touch(later);
        // Idle deadline would be later+60s; TTL still wins.
        assert!(e.is_expired(Instant::now() + Duration::from_secs(11)));
    }

    #[test]
    fn test_touch_activates_and_extends() {
        let mut e = entry(Duration::from_secs(1800), Duration::from_secs(1));
        assert_eq!(e.state, SessionState::Created);
        let before = e.expires_at();
        e.touch(Instant::now() + Duration::from_millis(500));
        assert_eq!(e.state, SessionState::Active);
        assert!(e.expires_at() > before);
    }

    #[test]
    fn test_versions_order_by_counter_then_origin() {
        let a = NodeId("a".into());
        let b = NodeId("b".into());
        let v1 = EntryVersion::initial(&b);
        let v2 = v1.next(&a);
        assert!(v2 > v1);
        assert!(v1.next(&b) > v1.next(&a));
    }

    #[test]
    fn test_record_preserves_remaining_lifetime() {
        let mut e = entry(Duration::from_secs(1800), Duration::from_secs(900));
        e.attributes.insert("user".into(), serde_json::json!("alice"));

        let record = e.to_record();
        let json = serde_json::to_string(&record).unwrap();
        let restored = SessionEntry::from_record(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.attributes["user"], "alice");
        assert_eq!(restored.version, e.version);
        assert_eq!(restored.idle_timeout, Duration::from_secs(900));
        let drift = restored
            .expires_at()
            .saturating_duration_since(e.expires_at())
            .max(e.expires_at().saturating_duration_since(restored.expires_at()));
        assert!(drift < Duration::from_millis(100));
    }
}
