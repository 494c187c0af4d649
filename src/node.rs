//! Cluster node lifecycle.
//!
//! [`SessionNode`] is the explicit context object holding one node's
//! membership service, partition table and session store. [`SessionNode::start`]
//! binds the sockets, joins the cluster and spawns every background task;
//! [`SessionNode::shutdown`] announces the departure, signals the tasks and
//! waits for them to finish.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::hooks::{NoopListener, SessionListener};
use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;
use crate::storage::handlers;
use crate::storage::partitioner::PartitionManager;
use crate::storage::store::SessionStore;

/// Upper bound on waiting for one background task to stop.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SessionNode {
    membership: Arc<MembershipService>,
    store: Arc<SessionStore>,
    http_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl SessionNode {
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        Self::start_with_listener(config, Arc::new(NoopListener)).await
    }

    pub async fn start_with_listener(
        config: ClusterConfig,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Self, ClusterError> {
        config.validate()?;

        let (socket, http_listener) = bind_ports(&config).await?;
        let http_addr = http_listener.local_addr()?;

        // 1. Membership (UDP gossip):
        let membership = MembershipService::new(&config, socket, http_addr)?;
        tracing::info!(
            "Node {} gossip={} http={}",
            membership.local_id(),
            membership.local_node.gossip_addr,
            http_addr
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = membership.start(shutdown_rx.clone());

        // 2. Storage layer:
        let partitioner = PartitionManager::new(
            membership.clone(),
            config.partition_count,
            config.backup_count,
        );
        let store = SessionStore::new(&config, membership.clone(), partitioner, listener);

        // 3. HTTP server:
        let app = handlers::router(store.clone());
        let mut server_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let server = axum::serve(http_listener, app).with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            });
            if let Err(e) = server.await {
                tracing::error!("HTTP server failed: {}", e);
            }
        }));

        // 4. Join, then take ownership of partitions before serving calls:
        if let Err(e) = membership.join().await {
            tracing::error!("Failed to join cluster '{}': {}", config.cluster_name, e);
            stop_tasks(&shutdown, handles).await;
            return Err(e);
        }
        store.rebalance(&membership.view()).await;

        // 5. Background tasks:
        handles.push(tokio::spawn(
            store.clone().run_rebalance_loop(shutdown_rx.clone()),
        ));
        handles.push(tokio::spawn(store.clone().run_expiry_sweeper(
            config.sweep_interval,
            config.tombstone_retention,
            shutdown_rx,
        )));

        Ok(Self {
            membership,
            store,
            http_addr,
            shutdown,
            handles,
        })
    }

    pub fn store(&self) -> Arc<SessionStore> {
        self.store.clone()
    }

    pub fn membership(&self) -> &Arc<MembershipService> {
        &self.membership
    }

    pub fn id(&self) -> &NodeId {
        self.membership.local_id()
    }

    pub fn gossip_addr(&self) -> SocketAddr {
        self.membership.local_node.gossip_addr
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Leaves the cluster gracefully: peers drop this node right away.
    pub async fn shutdown(self) {
        self.membership.leave().await;
        stop_tasks(&self.shutdown, self.handles).await;
        tracing::info!("Node {} stopped", self.membership.local_id());
    }

    /// Stops without telling anyone, as a crash would. Peers notice through
    /// missed heartbeats.
    pub async fn halt(self) {
        stop_tasks(&self.shutdown, self.handles).await;
        tracing::info!("Node {} halted", self.membership.local_id());
    }
}

async fn stop_tasks(shutdown: &watch::Sender<bool>, handles: Vec<JoinHandle<()>>) {
    let _ = shutdown.send(true);
    for handle in handles {
        let abort = handle.abort_handle();
        if tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await.is_err() {
            tracing::warn!("Background task did not stop in time, aborting it");
            abort.abort();
        }
    }
}

/// Binds the gossip socket and the HTTP listener together, moving to the
/// next port pair while the preferred one is taken.
async fn bind_ports(config: &ClusterConfig) -> Result<(UdpSocket, TcpListener), ClusterError> {
    if config.port == 0 {
        let socket = UdpSocket::bind((config.bind_host, 0)).await?;
        let listener = TcpListener::bind((config.bind_host, 0)).await?;
        return Ok((socket, listener));
    }

    let tries = if config.port_auto_increment {
        config.port_count.max(1)
    } else {
        1
    };

    let mut last_error = None;
    for step in 0..tries {
        let port = config.port + step;
        let http_port = port + config.http_port_offset;
        let socket = UdpSocket::bind((config.bind_host, port)).await;
        let listener = TcpListener::bind((config.bind_host, http_port)).await;

        match (socket, listener) {
            (Ok(socket), Ok(listener)) => {
                if step > 0 {
                    tracing::info!("Port {} taken, bound {} instead", config.port, port);
                }
                return Ok((socket, listener));
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::debug!("Ports {}/{} unavailable: {}", port, http_port, e);
                last_error = Some(e);
            }
        }
    }

    Err(ClusterError::Io(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrInUse, "no free port")
    })))
}
