use clap::Parser;
use session_cluster::config::{self, ClusterConfig};
use session_cluster::hooks::TracingListener;
use session_cluster::node::SessionNode;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Cluster-aware in-memory session store node.
#[derive(Debug, Parser)]
#[command(name = "session-node", version)]
struct Args {
    /// Cluster name; nodes only join peers announcing the same one.
    #[arg(long, env = "SESSION_CLUSTER_NAME", default_value = config::DEFAULT_CLUSTER_NAME)]
    cluster_name: String,

    /// Interface to bind gossip and HTTP to.
    #[arg(long, env = "SESSION_BIND_HOST", default_value = "127.0.0.1")]
    bind_host: IpAddr,

    /// Gossip (UDP) port. The HTTP port is this plus --http-port-offset.
    #[arg(long, env = "SESSION_PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Fail instead of trying the next ports when --port is taken.
    #[arg(long, env = "SESSION_NO_PORT_AUTO_INCREMENT")]
    no_port_auto_increment: bool,

    #[arg(long, env = "SESSION_HTTP_PORT_OFFSET", default_value_t = config::DEFAULT_HTTP_PORT_OFFSET)]
    http_port_offset: u16,

    /// Candidate member gossip addresses (repeat or comma-separate).
    #[arg(
        long = "member",
        env = "SESSION_MEMBERS",
        value_delimiter = ',',
        default_values = ["127.0.0.1:5701", "127.0.0.1:5702"]
    )]
    members: Vec<SocketAddr>,

    /// Found a one-node cluster if no candidate answers.
    #[arg(long, env = "SESSION_ALLOW_STANDALONE")]
    allow_standalone: bool,

    #[arg(long, env = "SESSION_PARTITIONS", default_value_t = config::DEFAULT_PARTITION_COUNT)]
    partitions: u32,

    #[arg(long, env = "SESSION_BACKUPS", default_value_t = config::DEFAULT_BACKUP_COUNT)]
    backups: usize,

    /// Maximum number of primary sessions held by this node.
    #[arg(long, env = "SESSION_CAPACITY", default_value_t = config::DEFAULT_CAPACITY_PER_NODE)]
    capacity: usize,

    /// Default session time-to-live, in seconds.
    #[arg(long, env = "SESSION_TTL_SECS", default_value_t = config::DEFAULT_TIME_TO_LIVE.as_secs())]
    ttl_secs: u64,

    /// Default session idle timeout, in seconds.
    #[arg(long, env = "SESSION_IDLE_SECS", default_value_t = config::DEFAULT_IDLE_TIMEOUT.as_secs())]
    idle_secs: u64,

    #[arg(long, env = "SESSION_HEARTBEAT_MS", default_value_t = 1000)]
    heartbeat_ms: u64,

    /// Missed heartbeats before a peer is suspected.
    #[arg(long, env = "SESSION_FAILURE_THRESHOLD", default_value_t = config::DEFAULT_FAILURE_THRESHOLD)]
    failure_threshold: u32,

    /// Seconds between cluster stats log lines; 0 disables them.
    #[arg(long, env = "SESSION_STATS_SECS", default_value_t = 5)]
    stats_secs: u64,
}

impl Args {
    fn into_config(self) -> ClusterConfig {
        ClusterConfig {
            cluster_name: self.cluster_name,
            bind_host: self.bind_host,
            port: self.port,
            port_auto_increment: !self.no_port_auto_increment,
            http_port_offset: self.http_port_offset,
            members: self.members,
            allow_standalone: self.allow_standalone,
            partition_count: self.partitions,
            backup_count: self.backups,
            capacity_per_node: self.capacity,
            time_to_live: Duration::from_secs(self.ttl_secs),
            idle_timeout: Duration::from_secs(self.idle_secs),
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            failure_threshold: self.failure_threshold,
            ..ClusterConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let stats_every = Duration::from_secs(args.stats_secs);
    let config = args.into_config();

    tracing::info!("Starting node of cluster '{}'", config.cluster_name);
    tracing::info!("Candidate members: {:?}", config.members);

    let node = SessionNode::start_with_listener(config, Arc::new(TracingListener)).await?;
    tracing::info!("HTTP server listening on {}", node.http_addr());
    tracing::info!("Press Ctrl+C to shutdown");

    // Stats reporter:
    if !stats_every.is_zero() {
        let store = node.store();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(stats_every);
            loop {
                interval.tick().await;
                let stats = store.stats();
                tracing::info!(
                    "Cluster stats: view v{} with {} member(s); {} primary of {} local entries, {} forwarded, {} degraded",
                    stats.view_version,
                    stats.members,
                    stats.primary_entries,
                    stats.entries,
                    stats.forwards,
                    stats.degraded_replications
                );
                for node in store.membership().get_active_members() {
                    tracing::info!("  - {} gossip={} http={}", node.id, node.gossip_addr, node.http_addr);
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    node.shutdown().await;
    Ok(())
}
