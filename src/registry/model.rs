//! Replicated data model
//!
//! The three replicated aggregates (server registry, cluster view and
//! pending write-requests) plus the registry write-validation rules.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Peer identity: the node's IPv4 address as a string
pub type PeerId = String;

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    /// Authoritative for the registry
    Master,
    /// Mirrors the master's state
    Slave,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "MASTER"),
            Role::Slave => write!(f, "SLAVE"),
        }
    }
}

/// A node as seen by the current master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    pub peer_id: PeerId,
    pub role: Role,
}

/// Insertion-ordered membership table, unique by peer id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterView {
    nodes: Vec<ClusterNode>,
}

impl ClusterView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, or update its role if already present
    pub fn add_or_update(&mut self, peer_id: &str, role: Role) {
        match self.nodes.iter_mut().find(|n| n.peer_id == peer_id) {
            Some(node) => node.role = role,
            None => self.nodes.push(ClusterNode {
                peer_id: peer_id.to_string(),
                role,
            }),
        }
    }

    /// Remove a node; returns whether it was present
    pub fn remove(&mut self, peer_id: &str) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.peer_id != peer_id);
        self.nodes.len() != before
    }

    pub fn get(&self, peer_id: &str) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.peer_id == peer_id)
    }

    /// First node recorded as MASTER
    pub fn master(&self) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.role == Role::Master)
    }

    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A reservable server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerElement {
    pub host: String,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub env: String,
    pub available: bool,
    /// Who holds the reservation; empty when unreserved
    #[serde(default)]
    pub reservation: String,
    /// When the reservation was taken; `None` when not reserved
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comment: String,
}

impl ServerElement {
    /// Create an available, unreserved element
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            app: String::new(),
            ip: String::new(),
            env: String::new(),
            available: true,
            reservation: String::new(),
            since: None,
            comment: String::new(),
        }
    }

    /// `available == false` exactly when a reservation is held
    pub fn is_consistent(&self) -> bool {
        self.available == self.reservation.is_empty()
    }
}

/// Why a write-request was refused by the master
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("unknown host '{0}'")]
    UnknownHost(String),

    #[error("host '{host}' already has available={available}")]
    AlreadyInState { host: String, available: bool },

    #[error("host '{0}' cannot be released: not reserved")]
    NotReserved(String),

    #[error("host '{host}' is already reserved by '{holder}'")]
    AlreadyReserved { host: String, holder: String },

    #[error("host '{0}' appears more than once in the request")]
    DuplicateHost(String),

    #[error("host '{host}' has available={available} but reservation '{holder}'")]
    InconsistentReservation {
        host: String,
        available: bool,
        holder: String,
    },
}

/// The server registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServersData {
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default, rename = "serversList")]
    pub servers: Vec<ServerElement>,
}

impl ServersData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an element, keyed by host
    pub fn upsert(&mut self, element: ServerElement) {
        match self.servers.iter_mut().find(|s| s.host == element.host) {
            Some(existing) => *existing = element,
            None => self.servers.push(element),
        }
    }

    pub fn get(&self, host: &str) -> Option<&ServerElement> {
        self.servers.iter().find(|s| s.host == host)
    }

    /// Mark the registry as refreshed
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_update = Some(now);
    }

    /// Check a write-request against the current registry state
    pub fn validate(&self, request: &UserRequest) -> Result<(), Rejection> {
        let server = self
            .get(&request.host)
            .ok_or_else(|| Rejection::UnknownHost(request.host.clone()))?;

        if server.available == request.desired_available {
            return Err(Rejection::AlreadyInState {
                host: server.host.clone(),
                available: server.available,
            });
        }

        if request.desired_available && server.reservation.is_empty() {
            return Err(Rejection::NotReserved(server.host.clone()));
        }

        if !request.desired_available && !server.reservation.is_empty() {
            return Err(Rejection::AlreadyReserved {
                host: server.host.clone(),
                holder: server.reservation.clone(),
            });
        }

        Ok(())
    }

    /// Validate and apply a write-request
    pub fn apply(&mut self, request: &UserRequest, now: DateTime<Utc>) -> Result<(), Rejection> {
        self.validate(request)?;

        let server = self
            .servers
            .iter_mut()
            .find(|s| s.host == request.host)
            .ok_or_else(|| Rejection::UnknownHost(request.host.clone()))?;

        if request.desired_available {
            server.available = true;
            server.reservation.clear();
            server.since = None;
            server.comment.clear();
        } else {
            server.available = false;
            server.reservation = request.user.clone();
            server.since = Some(now);
            server.comment = request.comment.clone();
        }

        self.last_update = Some(now);
        Ok(())
    }

    /// Registry-level invariants: unique hosts and consistent reservations
    pub fn check_invariants(&self) -> Result<(), Rejection> {
        let mut hosts = std::collections::HashSet::new();
        for server in &self.servers {
            if !hosts.insert(server.host.as_str()) {
                return Err(Rejection::DuplicateHost(server.host.clone()));
            }
            if !server.is_consistent() {
                return Err(Rejection::InconsistentReservation {
                    host: server.host.clone(),
                    available: server.available,
                    holder: server.reservation.clone(),
                });
            }
        }
        Ok(())
    }
}

/// A write-intent forwarded to the master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRequest {
    /// Node the request originated from
    #[serde(default)]
    pub node_ip: PeerId,
    pub timestamp: DateTime<Utc>,
    /// `false` reserves the host, `true` releases it
    pub desired_available: bool,
    pub host: String,
    pub user: String,
    #[serde(default)]
    pub comment: String,
}

impl UserRequest {
    /// Request to reserve `host` for `user`
    pub fn reserve(host: impl Into<String>, user: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            node_ip: PeerId::new(),
            timestamp: Utc::now(),
            desired_available: false,
            host: host.into(),
            user: user.into(),
            comment: comment.into(),
        }
    }

    /// Request to release `host`
    pub fn release(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            node_ip: PeerId::new(),
            timestamp: Utc::now(),
            desired_available: true,
            host: host.into(),
            user: user.into(),
            comment: String::new(),
        }
    }
}

/// FIFO queue of accepted write-requests awaiting admin review
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingRequests {
    requests: VecDeque<UserRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: UserRequest) {
        self.requests.push_back(request);
    }

    /// Remove and return every queued request, oldest first
    pub fn drain(&mut self) -> Vec<UserRequest> {
        self.requests.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserRequest> {
        self.requests.iter()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Full replicated state, the unit of transfer between master and slaves
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub registry: ServersData,
    pub cluster_view: ClusterView,
    pub pending_requests: PendingRequests,
}
