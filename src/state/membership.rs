//! Membership Directory
//!
//! Tracks when each peer was last heard from. A peer is active while its
//! last-seen timestamp is within the heartbeat timeout; stale entries are
//! filtered out on read and never swept.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::registry::PeerId;

/// Last-seen table of cluster peers
pub struct MembershipDirectory {
    /// This node's ID, always considered active
    self_id: PeerId,
    /// `heartbeat_retries × heartbeat_interval`
    timeout: Duration,
    last_seen: RwLock<HashMap<PeerId, Instant>>,
}

impl MembershipDirectory {
    pub fn new(self_id: impl Into<PeerId>, timeout: Duration) -> Self {
        Self {
            self_id: self_id.into(),
            timeout,
            last_seen: RwLock::new(HashMap::new()),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record that `peer` was heard from just now
    pub fn record(&self, peer: &str) {
        self.record_at(peer, Instant::now());
    }

    /// Record that `peer` was heard from at `at`
    pub fn record_at(&self, peer: &str, at: Instant) {
        if peer == self.self_id {
            return;
        }
        let mut last_seen = self.last_seen.write().unwrap_or_else(PoisonError::into_inner);
        let is_new = last_seen.insert(peer.to_string(), at).is_none();
        if is_new {
            tracing::info!("Discovered peer {}", peer);
        }
    }

    /// Drop a peer that announced it is leaving
    pub fn forget(&self, peer: &str) -> bool {
        self.last_seen
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer)
            .is_some()
    }

    pub fn last_seen(&self, peer: &str) -> Option<Instant> {
        self.last_seen
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .copied()
    }

    /// Peers heard from within the timeout, plus this node
    pub fn active_peers(&self) -> BTreeSet<PeerId> {
        self.active_peers_at(Instant::now())
    }

    pub fn active_peers_at(&self, now: Instant) -> BTreeSet<PeerId> {
        let last_seen = self.last_seen.read().unwrap_or_else(PoisonError::into_inner);
        let mut active: BTreeSet<PeerId> = last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) <= self.timeout)
            .map(|(peer, _)| peer.clone())
            .collect();
        active.insert(self.self_id.clone());
        active
    }

    /// Check if `peer` is currently active
    pub fn is_active(&self, peer: &str) -> bool {
        self.is_active_at(peer, Instant::now())
    }

    pub fn is_active_at(&self, peer: &str, now: Instant) -> bool {
        if peer == self.self_id {
            return true;
        }
        match self.last_seen(peer) {
            Some(seen) => now.saturating_duration_since(seen) <= self.timeout,
            None => false,
        }
    }
}
