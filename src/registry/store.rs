//! Replicated state store
//!
//! Holds the registry, cluster view and pending-request queue behind three
//! independent locks, and fans out change notifications to subscribers.
//! When more than one lock is needed they are taken in the order
//! registry, cluster view, requests.

use std::sync::{mpsc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use super::model::{
    ClusterView, PeerId, PendingRequests, Rejection, Role, ServersData, StateSnapshot, UserRequest,
};

/// Change notification delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    /// Registry contents or lastUpdate changed
    Registry,
    /// Cluster view changed
    ClusterView,
    /// Pending request queue changed
    Requests,
    /// This node changed role
    Role(Role),
    /// The agreed master changed
    Master(Option<PeerId>),
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Shared replicated state of one node
#[derive(Default)]
pub struct ReplicatedState {
    registry: RwLock<ServersData>,
    cluster: RwLock<ClusterView>,
    requests: RwLock<PendingRequests>,
    subscribers: Mutex<Vec<mpsc::Sender<StateChange>>>,
}

impl ReplicatedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with a registry
    pub fn with_registry(registry: ServersData) -> Self {
        let state = Self::new();
        *write(&state.registry) = registry;
        state
    }

    pub fn registry(&self) -> ServersData {
        read(&self.registry).clone()
    }

    pub fn cluster_view(&self) -> ClusterView {
        read(&self.cluster).clone()
    }

    pub fn pending_requests(&self) -> PendingRequests {
        read(&self.requests).clone()
    }

    /// Consistent copy of all three aggregates
    pub fn snapshot(&self) -> StateSnapshot {
        let registry = read(&self.registry);
        let cluster = read(&self.cluster);
        let requests = read(&self.requests);

        StateSnapshot {
            registry: registry.clone(),
            cluster_view: cluster.clone(),
            pending_requests: requests.clone(),
        }
    }

    /// Replace the whole mirror with a snapshot received from the master
    pub fn replace(&self, snapshot: StateSnapshot) {
        {
            let mut registry = write(&self.registry);
            let mut cluster = write(&self.cluster);
            let mut requests = write(&self.requests);

            *registry = snapshot.registry;
            *cluster = snapshot.cluster_view;
            *requests = snapshot.pending_requests;
        }

        self.notify(StateChange::Registry);
        self.notify(StateChange::ClusterView);
        self.notify(StateChange::Requests);
    }

    /// Replace only the registry (snapshot load)
    pub fn replace_registry(&self, registry: ServersData) {
        *write(&self.registry) = registry;
        self.notify(StateChange::Registry);
    }

    /// Mutate the registry under its lock
    pub fn update_registry<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut ServersData) -> R,
    {
        let result = {
            let mut registry = write(&self.registry);
            f(&mut registry)
        };
        self.notify(StateChange::Registry);
        result
    }

    /// Validate and apply a write-request, queueing it for review on success
    ///
    /// The registry lock is held across validation and mutation, so two
    /// concurrent requests for the same host are serialized.
    pub fn apply_request(&self, request: UserRequest) -> Result<(), Rejection> {
        {
            let mut registry = write(&self.registry);
            registry.apply(&request, Utc::now())?;
            write(&self.requests).push(request);
        }

        self.notify(StateChange::Registry);
        self.notify(StateChange::Requests);
        Ok(())
    }

    /// Remove and return every queued request
    pub fn drain_requests(&self) -> Vec<UserRequest> {
        let drained = write(&self.requests).drain();
        if !drained.is_empty() {
            self.notify(StateChange::Requests);
        }
        drained
    }

    /// Record a node in the cluster view
    pub fn add_node(&self, peer_id: &str, role: Role) {
        write(&self.cluster).add_or_update(peer_id, role);
        self.notify(StateChange::ClusterView);
    }

    /// Remove a node from the cluster view
    pub fn remove_node(&self, peer_id: &str) -> bool {
        let removed = write(&self.cluster).remove(peer_id);
        if removed {
            self.notify(StateChange::ClusterView);
        }
        removed
    }

    /// Record `peer_id` as the only MASTER in the cluster view
    pub fn promote_node(&self, peer_id: &str) {
        {
            let mut cluster = write(&self.cluster);
            let demoted: Vec<PeerId> = cluster
                .nodes()
                .iter()
                .filter(|n| n.role == Role::Master && n.peer_id != peer_id)
                .map(|n| n.peer_id.clone())
                .collect();
            for peer in demoted {
                cluster.add_or_update(&peer, Role::Slave);
            }
            cluster.add_or_update(peer_id, Role::Master);
        }
        self.notify(StateChange::ClusterView);
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> mpsc::Receiver<StateChange> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver a change to every live subscriber, dropping closed ones
    pub fn notify(&self, change: StateChange) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }
}
