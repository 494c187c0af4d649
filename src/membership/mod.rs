//! Membership & Discovery Module
//!
//! Tracks which nodes form the cluster and publishes that set as a versioned
//! [`ClusterView`](types::ClusterView).
//!
//! ## Core Mechanisms
//! - **Static discovery**: a joining node handshakes with a fixed list of candidate
//!   addresses and adopts the view returned by the first one that answers.
//! - **Heartbeats**: every active node sends a heartbeat to every other member at a
//!   fixed interval over UDP.
//! - **Failure detection**: `K` missed heartbeats turn a member SUSPECT; without a
//!   contradicting heartbeat during the grace period it becomes LEFT and is removed
//!   from the view, bumping its version.
//! - **Copy-on-write views**: views are immutable and swapped atomically through a
//!   `watch` channel, so readers never see a partial update and can await changes.
//!
//! - **Re-merge**: nodes periodically offer their view to known addresses outside
//!   it. Once a split heals, the first offer that lands unions both segments'
//!   views, so the cluster converges again without a restart.
//! - **Forgetting**: LEFT members are pruned after the departed retention window.
//!
//! There is no quorum: while a split lasts, each reachable network segment has
//! its own authoritative view.

pub mod service;
pub mod types;

#[cfg(test)]
mod tests;
