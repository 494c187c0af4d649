//! Cluster-Aware Session Store Library
//!
//! This library crate defines the modules that make up a session store node.
//! It serves as the foundation for the binary executable (`main.rs`) and for
//! applications that embed a node directly.
//!
//! ## Architecture Modules
//! - **`config`**: Every tunable of a node in one validated structure.
//! - **`error`**: `StoreError` for the CRUD surface, `ClusterError` for node internals.
//! - **`membership`**: The cluster coordination layer. A UDP gossip protocol handles
//!   discovery through a static candidate list, heartbeats, failure detection and
//!   the versioned cluster view.
//! - **`storage`**: The distributed state layer. Partitions sessions over the view,
//!   replicates every change to backups, expires and evicts entries, and exposes
//!   the `SessionStore` CRUD API.
//! - **`hooks`**: Lifecycle callbacks for the embedding application.
//! - **`node`**: `SessionNode`, which wires everything together and owns the
//!   background tasks.

pub mod clock;
pub mod config;
pub mod error;
pub mod hooks;
pub mod membership;
pub mod node;
pub mod storage;

pub use config::ClusterConfig;
pub use error::{ClusterError, StoreError};
pub use hooks::SessionListener;
pub use node::SessionNode;
pub use storage::entry::SessionId;
pub use storage::store::SessionStore;
