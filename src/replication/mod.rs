//! Replication Module
//!
//! Master/slave state transfer over TCP: the master serves snapshots and
//! applies forwarded write-requests, slaves pull and mirror.

mod server;
mod client;

pub use server::ReplicationServer;
pub use client::{ClientSettings, Outbox, ReplicationClient};

use crate::config::HostbookConfig;

impl ClientSettings {
    /// Client settings taken from the node configuration
    pub fn from_config(config: &HostbookConfig) -> Self {
        Self {
            port: config.cluster.replication_port,
            fetch_interval: config.fetch_interval(),
            read_timeout: config.client_read_timeout(),
            connect_timeout: config.connect_timeout(),
        }
    }
}
