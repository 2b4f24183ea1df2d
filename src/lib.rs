//! Hostbook - Self-organizing Cluster for a Replicated Server Registry
//!
//! A small cluster of peers on one LAN keeps a shared registry of servers
//! and who has them reserved. The peers discover each other by UDP
//! broadcast, elect a single master deterministically, and replicate the
//! master's state to every slave over TCP.
//!
//! # Architecture
//!
//! Every node runs the same binary. The master owns all writes: reserve and
//! release requests are validated and applied under one lock, then mirrored
//! to the slaves which pull the full state at a fixed interval. When the
//! master disappears the slaves elect a new one from the peers they still
//! hear, preferring configured priorities and otherwise a seeded random
//! draw that every node computes identically.
//!
//! # Features
//!
//! - Broadcast discovery with heartbeat-based failure detection
//! - Priority-first deterministic election with cooldown and manual override
//! - Length-prefixed, checksummed JSON frames for state replication
//! - Atomic JSON snapshots of the registry
//! - Admin HTTP API for reservations and promotion

pub mod config;
pub mod error;
pub mod registry;
pub mod network;
pub mod state;
pub mod replication;
pub mod node;
pub mod api;

pub use config::HostbookConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::HostbookConfig;
    pub use crate::error::{Error, Result};
    pub use crate::node::{Node, NodeStatus, Submitted};
    pub use crate::registry::{PeerId, Role, ServerElement, ServersData, StateSnapshot, UserRequest};
    pub use crate::network::{Announcement, Message};
}
