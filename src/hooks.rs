//! Session lifecycle callbacks.
//!
//! The embedding application registers a [`SessionListener`] when it builds
//! the node. Callbacks fire on the node that owns the session as primary,
//! after the change has been replicated. They run on the request path, so
//! implementations should return quickly.

use crate::storage::entry::SessionId;

pub trait SessionListener: Send + Sync {
    fn on_session_created(&self, _id: &SessionId) {}

    /// Any successful read or write of the session.
    fn on_session_accessed(&self, _id: &SessionId) {}

    /// Idle timeout or time-to-live elapsed.
    fn on_session_expired(&self, _id: &SessionId) {}

    fn on_session_deleted(&self, _id: &SessionId) {}

    /// Dropped to stay under the node capacity.
    fn on_session_evicted(&self, _id: &SessionId) {}
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl SessionListener for NoopListener {}

/// Logs every event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl SessionListener for TracingListener {
    fn on_session_created(&self, id: &SessionId) {
        tracing::debug!("Session {} created", id);
    }

    fn on_session_accessed(&self, id: &SessionId) {
        tracing::trace!("Session {} accessed", id);
    }

    fn on_session_expired(&self, id: &SessionId) {
        tracing::debug!("Session {} expired", id);
    }

    fn on_session_deleted(&self, id: &SessionId) {
        tracing::debug!("Session {} deleted", id);
    }

    fn on_session_evicted(&self, id: &SessionId) {
        tracing::debug!("Session {} evicted", id);
    }
}
