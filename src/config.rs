//! Hostbook Configuration
//!
//! This module provides configuration structures for a hostbook node:
//! ports, timing of the membership/election protocols, the per-peer
//! priority table, replication and snapshot settings.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::registry::PeerId;

/// Main Hostbook configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostbookConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Membership and election configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Replication channel configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Registry snapshot configuration
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Registry refresh (remote polling) configuration
    #[serde(default)]
    pub poller: PollerConfig,

    /// Admin API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// IPv4 address identifying this node (detected when unset)
    #[serde(default)]
    pub address: Option<PeerId>,

    /// Data directory for snapshots
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// A configured peer and its election priority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerPriority {
    /// Peer address
    pub address: PeerId,
    /// Election priority (lower is preferred)
    pub priority: u32,
}

/// Membership and election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// UDP port for heartbeat, join, leave and force-master messages
    #[serde(default = "default_membership_port")]
    pub membership_port: u16,

    /// UDP port for election announcements (defaults to membership_port + 1)
    #[serde(default)]
    pub election_port: Option<u16>,

    /// TCP port for the replication channel
    #[serde(default = "default_replication_port")]
    pub replication_port: u16,

    /// Broadcast destination address
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Missed heartbeats before a peer is considered gone
    #[serde(default = "default_heartbeat_retries")]
    pub heartbeat_retries: u32,

    /// Join request broadcasts before self-promotion
    #[serde(default = "default_join_attempts")]
    pub join_attempts: u32,

    /// Delay between join attempts in milliseconds
    #[serde(default = "default_join_interval_ms")]
    pub join_interval_ms: u64,

    /// Minimum time between election rounds in milliseconds
    #[serde(default = "default_election_cooldown_ms")]
    pub election_cooldown_ms: u64,

    /// Always elect this node (manual master)
    #[serde(default)]
    pub manual_master: bool,

    /// Per-peer priority table
    #[serde(default)]
    pub peers: Vec<PeerPriority>,
}

/// Replication channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Interval between state pulls in milliseconds
    #[serde(default = "default_fetch_interval_ms")]
    pub fetch_interval_ms: u64,

    /// Read timeout for a state reply, and idle limit for a served connection
    #[serde(default = "default_client_read_timeout_ms")]
    pub client_read_timeout_ms: u64,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Registry snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Snapshot directory (defaults to node.data_dir)
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Snapshot interval in milliseconds
    #[serde(default = "default_snapshot_interval_ms")]
    pub interval_ms: u64,
}

/// Registry refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Refresh interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/hostbook")
}

fn default_membership_port() -> u16 {
    5005
}

fn default_replication_port() -> u16 {
    5007
}

fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    2000
}

fn default_heartbeat_retries() -> u32 {
    3
}

fn default_join_attempts() -> u32 {
    3
}

fn default_join_interval_ms() -> u64 {
    1000
}

fn default_election_cooldown_ms() -> u64 {
    10_000
}

fn default_fetch_interval_ms() -> u64 {
    1000
}

fn default_client_read_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_snapshot_interval_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: None,
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            membership_port: default_membership_port(),
            election_port: None,
            replication_port: default_replication_port(),
            broadcast_address: default_broadcast_address(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_retries: default_heartbeat_retries(),
            join_attempts: default_join_attempts(),
            join_interval_ms: default_join_interval_ms(),
            election_cooldown_ms: default_election_cooldown_ms(),
            manual_master: false,
            peers: Vec::new(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            fetch_interval_ms: default_fetch_interval_ms(),
            client_read_timeout_ms: default_client_read_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            directory: None,
            interval_ms: default_snapshot_interval_ms(),
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl HostbookConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: HostbookConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &std::path::Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        let cluster = &self.cluster;

        if cluster.heartbeat_interval_ms == 0 {
            return Err(crate::Error::Config("cluster.heartbeat_interval_ms must be > 0".into()));
        }
        if cluster.heartbeat_retries == 0 {
            return Err(crate::Error::Config("cluster.heartbeat_retries must be > 0".into()));
        }
        if cluster.join_attempts == 0 {
            return Err(crate::Error::Config("cluster.join_attempts must be > 0".into()));
        }
        if self.replication.fetch_interval_ms == 0 {
            return Err(crate::Error::Config("replication.fetch_interval_ms must be > 0".into()));
        }
        if self.replication.client_read_timeout_ms == 0 {
            return Err(crate::Error::Config("replication.client_read_timeout_ms must be > 0".into()));
        }
        // Slaves are silent between fetches; the master drops idle connections
        if self.replication.client_read_timeout_ms <= self.replication.fetch_interval_ms {
            return Err(crate::Error::Config(
                "replication.client_read_timeout_ms must exceed replication.fetch_interval_ms".into(),
            ));
        }
        if self.snapshot.interval_ms == 0 || self.poller.interval_ms == 0 {
            return Err(crate::Error::Config("snapshot and poller intervals must be > 0".into()));
        }

        let election_port = self.election_port();
        if cluster.membership_port == election_port {
            return Err(crate::Error::Config(
                "cluster.membership_port and cluster.election_port must differ".into(),
            ));
        }

        if let Some(address) = &self.node.address {
            if address.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(crate::Error::Config(format!(
                    "node.address '{}' is not an IPv4 address",
                    address
                )));
            }
        }

        let mut seen = HashSet::new();
        for peer in &cluster.peers {
            if !seen.insert(peer.address.as_str()) {
                return Err(crate::Error::Config(format!(
                    "peer '{}' listed more than once in cluster.peers",
                    peer.address
                )));
            }
        }

        Ok(())
    }

    /// Get the election announcement port
    pub fn election_port(&self) -> u16 {
        self.cluster
            .election_port
            .unwrap_or_else(|| self.cluster.membership_port.wrapping_add(1))
    }

    /// Get the snapshot directory path
    pub fn snapshot_dir(&self) -> PathBuf {
        self.snapshot
            .directory
            .clone()
            .unwrap_or_else(|| self.node.data_dir.clone())
    }

    /// Get the priority table as a map
    pub fn priorities(&self) -> HashMap<PeerId, u32> {
        self.cluster
            .peers
            .iter()
            .map(|p| (p.address.clone(), p.priority))
            .collect()
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Time without a heartbeat after which a peer is considered gone
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.cluster.heartbeat_retries
    }

    /// Get join interval as Duration
    pub fn join_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.join_interval_ms)
    }

    /// Get election cooldown as Duration
    pub fn election_cooldown(&self) -> Duration {
        Duration::from_millis(self.cluster.election_cooldown_ms)
    }

    /// Get fetch interval as Duration
    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.replication.fetch_interval_ms)
    }

    /// Get client read timeout as Duration
    pub fn client_read_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.client_read_timeout_ms)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.connect_timeout_ms)
    }

    /// Get snapshot interval as Duration
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot.interval_ms)
    }

    /// Get poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poller.interval_ms)
    }
}
