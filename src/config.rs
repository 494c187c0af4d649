//! Node Configuration
//!
//! A single explicit structure holding every tunable of a cluster node. The
//! defaults mirror a small two-node deployment with one synchronous backup,
//! a 30 minute session lifetime and a 15 minute idle window.
//!
//! The configuration is validated once, before any socket is bound, by
//! [`ClusterConfig::validate`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_CLUSTER_NAME: &str = "session-cluster";
pub const DEFAULT_PORT: u16 = 5701;
pub const DEFAULT_PORT_COUNT: u16 = 100;
pub const DEFAULT_HTTP_PORT_OFFSET: u16 = 1000;
pub const DEFAULT_PARTITION_COUNT: u32 = 271;
pub const DEFAULT_BACKUP_COUNT: usize = 1;
pub const DEFAULT_CAPACITY_PER_NODE: usize = 10_000;
pub const DEFAULT_TIME_TO_LIVE: Duration = Duration::from_secs(1800);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(900);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_SUSPECT_GRACE: Duration = Duration::from_secs(3);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKUP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_TOMBSTONE_RETENTION: Duration = Duration::from_secs(60);
pub const DEFAULT_DEPARTED_RETENTION: Duration = Duration::from_secs(300);

/// Every option a node reads at startup.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Nodes only talk to peers announcing the same name.
    pub cluster_name: String,
    /// Interface both the gossip socket and the HTTP listener bind to.
    pub bind_host: IpAddr,
    /// Gossip (UDP) port. `0` picks an ephemeral port for gossip and HTTP.
    pub port: u16,
    /// Try the following ports when `port` is already taken.
    pub port_auto_increment: bool,
    /// How many ports (starting at `port`) auto-increment may try.
    pub port_count: u16,
    /// HTTP port is the gossip port plus this offset.
    pub http_port_offset: u16,
    /// Static list of candidate gossip addresses used for discovery.
    pub members: Vec<SocketAddr>,
    /// Form a single-node cluster when no candidate answers the handshake.
    pub allow_standalone: bool,
    /// How long to keep trying the candidates before giving up.
    pub join_timeout: Duration,

    pub partition_count: u32,
    pub backup_count: usize,
    /// Maximum number of primary entries resident on this node.
    pub capacity_per_node: usize,

    pub time_to_live: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long delete/expiry versions are remembered to reject stale writes.
    pub tombstone_retention: Duration,

    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before a node becomes suspect.
    pub failure_threshold: u32,
    /// Time a suspect has to refute before it is declared left.
    pub suspect_grace: Duration,
    /// How long a LEFT node is remembered. Departed addresses keep receiving
    /// merge offers during this window, then the record is dropped.
    pub departed_retention: Duration,

    pub operation_timeout: Duration,
    pub backup_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self {
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            bind_host: localhost,
            port: DEFAULT_PORT,
            port_auto_increment: true,
            port_count: DEFAULT_PORT_COUNT,
            http_port_offset: DEFAULT_HTTP_PORT_OFFSET,
            members: vec![
                SocketAddr::new(localhost, DEFAULT_PORT),
                SocketAddr::new(localhost, DEFAULT_PORT + 1),
            ],
            allow_standalone: false,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            partition_count: DEFAULT_PARTITION_COUNT,
            backup_count: DEFAULT_BACKUP_COUNT,
            capacity_per_node: DEFAULT_CAPACITY_PER_NODE,
            time_to_live: DEFAULT_TIME_TO_LIVE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            tombstone_retention: DEFAULT_TOMBSTONE_RETENTION,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            suspect_grace: DEFAULT_SUSPECT_GRACE,
            departed_retention: DEFAULT_DEPARTED_RETENTION,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            backup_timeout: DEFAULT_BACKUP_TIMEOUT,
        }
    }
}

impl ClusterConfig {
    /// Configuration for a node that binds ephemeral ports and is allowed to
    /// found its own cluster. Handy for tests and local experiments.
    pub fn ephemeral() -> Self {
        Self {
            port: 0,
            members: Vec::new(),
            allow_standalone: true,
            ..Self::default()
        }
    }

    /// Adds a candidate member address.
    pub fn with_member(mut self, addr: SocketAddr) -> Self {
        self.members.push(addr);
        self
    }

    /// Time without a heartbeat after which a peer becomes suspect.
    pub fn failure_window(&self) -> Duration {
        self.heartbeat_interval * self.failure_threshold
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_name.trim().is_empty() {
            return Err(ConfigError::EmptyClusterName);
        }
        if self.partition_count == 0 {
            return Err(ConfigError::Invalid("partition_count must be > 0".into()));
        }
        if self.capacity_per_node == 0 {
            return Err(ConfigError::Invalid("capacity_per_node must be > 0".into()));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid("failure_threshold must be >= 1".into()));
        }

        let durations = [
            ("time_to_live", self.time_to_live),
            ("idle_timeout", self.idle_timeout),
            ("sweep_interval", self.sweep_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("departed_retention", self.departed_retention),
            ("join_timeout", self.join_timeout),
            ("operation_timeout", self.operation_timeout),
            ("backup_timeout", self.backup_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        if self.backup_timeout >= self.operation_timeout {
            return Err(ConfigError::BackupTimeoutTooLong {
                backup: self.backup_timeout,
                operation: self.operation_timeout,
            });
        }

        if self.port != 0 {
            let tries = if self.port_auto_increment {
                self.port_count.max(1)
            } else {
                1
            };
            let highest = u32::from(self.port) + u32::from(tries) - 1 + u32::from(self.http_port_offset);
            if highest > u32::from(u16::MAX) {
                return Err(ConfigError::PortRange {
                    port: self.port,
                    count: tries,
                    offset: self.http_port_offset,
                });
            }
        }

        Ok(())
    }
}
