//! Distributed Session Storage
//!
//! Implements a partitioned, replicated in-memory session map.
//!
//! ## Core Concepts
//! - **Partitioning**: session ids hash into a fixed number of partitions.
//! - **Placement**: `PartitionManager` ranks the members of the current view per
//!   partition (rendezvous hashing) into one primary and up to `B` backups.
//! - **Replication**: the primary applies every change and pushes it to all
//!   backups before answering. Backups apply changes last-writer-wins on a
//!   per-entry version, so races and redeliveries converge.
//! - **Lifecycle**: entries expire on idle timeout or time-to-live, and the
//!   least recently used primary entries are evicted above node capacity.
//! - **Access**: `SessionStore` routes each call to the primary, locally or
//!   over HTTP, and is the only surface the application layer sees.

pub mod entry;
pub mod eviction;
pub mod expiry;
pub mod handlers;
pub mod memory;
pub mod partitioner;
pub mod protocol;
pub mod replication;
pub mod stats;
pub mod store;
pub mod transport;
