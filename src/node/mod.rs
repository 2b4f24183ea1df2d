//! Node Orchestrator
//!
//! Wires membership, election and replication together and drives the
//! MASTER/SLAVE role lifecycle. Each role owns a [`TaskSet`]; switching
//! roles stops the old set before starting the new one.

mod poller;
mod supervisor;

pub use poller::{refresh_once, run_poller, RegistryRefresher, TouchRefresher};
pub use supervisor::{StopSignal, TaskSet};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::HostbookConfig;
use crate::error::{Error, Result};
use crate::network::discovery::{
    run_election_listener, run_heartbeat_sender, run_membership_listener, run_presence_beacon,
    ElectionHandler, MembershipHandler,
};
use crate::network::protocol::{ForceMasterMsg, JoinRequestMsg, LeaveMsg};
use crate::network::{
    bind_udp, encode, local_ipv4, Announcement, Broadcaster, Message, MAX_DATAGRAM_SIZE,
};
use crate::registry::{
    ClusterView, PeerId, ReplicatedState, Role, SnapshotStore, StateChange, StateSnapshot,
    UserRequest,
};
use crate::replication::{ClientSettings, Outbox, ReplicationClient, ReplicationServer};
use crate::state::{ElectionCoordinator, MembershipDirectory};

/// Read timeout of the UDP receive loops
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on joining a stopped task set
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What happened to a submitted write-request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Submitted {
    /// Applied to the registry on this (master) node
    Applied,
    /// Queued for forwarding to the master
    Forwarded,
}

/// Point-in-time view of a node, as served by the admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: PeerId,
    pub role: Role,
    pub master: Option<PeerId>,
    pub epoch: u64,
    pub manual_master: bool,
    pub override_master: Option<PeerId>,
    pub active_peers: Vec<PeerId>,
    pub cluster_view: ClusterView,
    pub servers: usize,
    pub pending_requests: usize,
    /// Requests waiting to be forwarded to the master
    pub queued_requests: usize,
    pub last_update: Option<DateTime<Utc>>,
}

/// A cluster node
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    me: Weak<NodeInner>,
    config: HostbookConfig,
    self_id: PeerId,
    state: Arc<ReplicatedState>,
    directory: Arc<MembershipDirectory>,
    election: Arc<ElectionCoordinator>,
    broadcaster: Arc<Broadcaster>,
    snapshots: SnapshotStore,
    refresher: Arc<dyn RegistryRefresher>,
    outbox: Arc<Outbox>,

    role: Mutex<Role>,
    master: Mutex<Option<PeerId>>,
    last_master_heartbeat: Mutex<Instant>,

    /// Serializes role transitions
    transition: Mutex<()>,
    core_tasks: Mutex<Option<TaskSet>>,
    master_tasks: Mutex<Option<TaskSet>>,
    slave_tasks: Mutex<Option<TaskSet>>,
    process_stop: StopSignal,

    joining: AtomicBool,
    join_answered: AtomicBool,
    shut_down: AtomicBool,
}

impl Node {
    /// Create a node with the default registry refresher
    pub fn new(config: HostbookConfig) -> Result<Self> {
        Self::with_refresher(config, Arc::new(TouchRefresher))
    }

    /// Create a node that refreshes the registry through `refresher`
    pub fn with_refresher(config: HostbookConfig, refresher: Arc<dyn RegistryRefresher>) -> Result<Self> {
        config.validate()?;

        let self_id = match &config.node.address {
            Some(address) => address.clone(),
            None => local_ipv4().to_string(),
        };

        let directory = Arc::new(MembershipDirectory::new(self_id.clone(), config.heartbeat_timeout()));
        let election = Arc::new(ElectionCoordinator::new(
            self_id.clone(),
            Arc::clone(&directory),
            config.priorities(),
            config.election_cooldown(),
            config.cluster.manual_master,
        ));
        let broadcaster = Arc::new(Broadcaster::new(&config.cluster.broadcast_address)?);

        let snapshots = SnapshotStore::new(config.snapshot_dir());
        let state = match snapshots.load() {
            Ok(Some(registry)) => {
                info!("Loaded {} servers from {:?}", registry.servers.len(), snapshots.path());
                ReplicatedState::with_registry(registry)
            }
            Ok(None) => ReplicatedState::new(),
            Err(e) => {
                warn!("Ignoring registry snapshot: {}", e);
                ReplicatedState::new()
            }
        };

        let core = TaskSet::new("core");
        let process_stop = core.signal();

        info!("Node {} created", self_id);

        let inner = Arc::new_cyclic(|me| NodeInner {
            me: me.clone(),
            config,
            self_id,
            state: Arc::new(state),
            directory,
            election,
            broadcaster,
            snapshots,
            refresher,
            outbox: Arc::new(Outbox::new()),
            role: Mutex::new(Role::Slave),
            master: Mutex::new(None),
            last_master_heartbeat: Mutex::new(Instant::now()),
            transition: Mutex::new(()),
            core_tasks: Mutex::new(Some(core)),
            master_tasks: Mutex::new(None),
            slave_tasks: Mutex::new(None),
            process_stop,
            joining: AtomicBool::new(false),
            join_answered: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        });

        Ok(Self { inner })
    }

    /// Bind the UDP ports, start the core threads and run the join protocol
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let cluster = &inner.config.cluster;
        let election_port = inner.config.election_port();

        let membership_socket = bind_udp(cluster.membership_port, RECV_TIMEOUT)?;
        let election_socket = bind_udp(election_port, RECV_TIMEOUT)?;

        let mut core_guard = lock(&inner.core_tasks);
        let core = core_guard.as_mut().ok_or(Error::ShuttingDown)?;

        {
            let id = inner.self_id.clone();
            let broadcaster = Arc::clone(&inner.broadcaster);
            let interval = inner.config.heartbeat_interval();
            core.spawn("beacon", move |stop| {
                run_presence_beacon(id, broadcaster, election_port, interval, stop)
            })?;
        }
        {
            let id = inner.self_id.clone();
            let directory = Arc::clone(&inner.directory);
            let handler: Arc<dyn MembershipHandler> = inner.clone();
            core.spawn("membership", move |stop| {
                run_membership_listener(membership_socket, id, directory, handler, stop)
            })?;
        }
        {
            let id = inner.self_id.clone();
            let directory = Arc::clone(&inner.directory);
            let handler: Arc<dyn ElectionHandler> = inner.clone();
            core.spawn("election-listener", move |stop| {
                run_election_listener(election_socket, id, directory, handler, stop)
            })?;
        }
        {
            let node = Arc::clone(inner);
            core.spawn("election", move |stop| node.run_election_loop(stop))?;
        }
        drop(core_guard);

        info!(
            "Node {} started (membership {}, election {}, replication {})",
            inner.self_id, cluster.membership_port, election_port, cluster.replication_port
        );

        inner.start_join();
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.inner.self_id
    }

    pub fn config(&self) -> &HostbookConfig {
        &self.inner.config
    }

    pub fn role(&self) -> Role {
        self.inner.role()
    }

    pub fn master(&self) -> Option<PeerId> {
        self.inner.master()
    }

    pub fn is_master(&self) -> bool {
        self.inner.role() == Role::Master
    }

    /// Process-wide stop signal, raised by [`Node::shutdown`]
    pub fn stop_signal(&self) -> StopSignal {
        self.inner.process_stop.clone()
    }

    /// Consistent copy of the replicated state
    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.state.snapshot()
    }

    /// Subscribe to state and role changes
    pub fn subscribe(&self) -> Receiver<StateChange> {
        self.inner.state.subscribe()
    }

    /// Submit a reservation or release
    ///
    /// Applied directly on the master; elsewhere queued and forwarded over
    /// the replication connection.
    pub fn submit_request(&self, mut request: UserRequest) -> Result<Submitted> {
        let inner = &self.inner;
        if request.node_ip.is_empty() {
            request.node_ip = inner.self_id.clone();
        }

        if inner.role() == Role::Master {
            inner.state.apply_request(request)?;
            Ok(Submitted::Applied)
        } else {
            debug!("Queueing request for {} until the master pulls it", request.host);
            inner.outbox.push(request);
            Ok(Submitted::Forwarded)
        }
    }

    /// Make this node master and tell every other node to follow it
    pub fn force_master(&self) -> Result<()> {
        let inner = &self.inner;
        info!("Forcing {} as master", inner.self_id);

        inner.election.force(&inner.self_id);
        let message = encode(&Message::ForceMaster(ForceMasterMsg {
            requested_by: inner.self_id.clone(),
        }));
        if let Err(e) = inner.broadcaster.broadcast(inner.config.cluster.membership_port, &message) {
            warn!("Failed to broadcast ForceMaster: {}", e);
        }

        inner.become_master()
    }

    /// Drain the pending-request queue (master only)
    pub fn resolve_requests(&self) -> Result<Vec<UserRequest>> {
        let inner = &self.inner;
        if inner.role() != Role::Master {
            return Err(match inner.master() {
                Some(master) => Error::NotMaster(master),
                None => Error::NoMaster,
            });
        }

        let resolved = inner.state.drain_requests();
        info!("Resolved {} pending requests", resolved.len());
        Ok(resolved)
    }

    pub fn status(&self) -> NodeStatus {
        let inner = &self.inner;
        let snapshot = inner.state.snapshot();

        NodeStatus {
            node_id: inner.self_id.clone(),
            role: inner.role(),
            master: inner.master(),
            epoch: inner.election.epoch(),
            manual_master: inner.election.is_manual_master(),
            override_master: inner.election.override_master(),
            active_peers: inner.directory.active_peers().into_iter().collect(),
            cluster_view: snapshot.cluster_view,
            servers: snapshot.registry.servers.len(),
            pending_requests: snapshot.pending_requests.len(),
            queued_requests: inner.outbox.len(),
            last_update: snapshot.registry.last_update,
        }
    }

    /// Announce departure and stop every task
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down node {}", inner.self_id);

        let leave = encode(&Message::LeaveNotification(LeaveMsg {
            peer_id: inner.self_id.clone(),
        }));
        if let Err(e) = inner.broadcaster.broadcast(inner.config.cluster.membership_port, &leave) {
            debug!("Failed to broadcast leave notification: {}", e);
        }
        let resign = Announcement::Leave { id: inner.self_id.clone() }.to_bytes();
        if let Err(e) = inner.broadcaster.broadcast(inner.config.election_port(), &resign) {
            debug!("Failed to broadcast leave announcement: {}", e);
        }

        inner.process_stop.stop();
        inner.stop_master_tasks();
        inner.stop_slave_tasks();

        let core = lock(&inner.core_tasks).take();
        if let Some(core) = core {
            core.stop_and_join(TASK_JOIN_TIMEOUT);
        }

        info!("Node {} stopped", inner.self_id);
    }
}

impl NodeInner {
    fn role(&self) -> Role {
        *lock(&self.role)
    }

    fn master(&self) -> Option<PeerId> {
        lock(&self.master).clone()
    }

    fn set_role(&self, role: Role, master: Option<PeerId>) {
        let role_changed = {
            let mut current = lock(&self.role);
            let changed = *current != role;
            *current = role;
            changed
        };
        let master_changed = {
            let mut current = lock(&self.master);
            let changed = *current != master;
            *current = master.clone();
            changed
        };

        if role_changed {
            self.state.notify(StateChange::Role(role));
        }
        if master_changed {
            self.state.notify(StateChange::Master(master));
        }
    }

    fn stop_master_tasks(&self) {
        let tasks = lock(&self.master_tasks).take();
        if let Some(tasks) = tasks {
            tasks.stop_and_join(TASK_JOIN_TIMEOUT);
            info!("Master tasks stopped");
        }
    }

    fn stop_slave_tasks(&self) {
        let tasks = lock(&self.slave_tasks).take();
        if let Some(tasks) = tasks {
            tasks.stop_and_join(TASK_JOIN_TIMEOUT);
            debug!("Slave tasks stopped");
        }
    }

    fn master_tasks_running(&self) -> bool {
        lock(&self.master_tasks).as_ref().map(TaskSet::is_running).unwrap_or(false)
    }

    /// Enter MASTER
    ///
    /// The role only changes once every master task is running; on failure
    /// the node is left a SLAVE without a master so the next round retries.
    fn become_master(&self) -> Result<()> {
        if self.process_stop.is_stopped() {
            return Err(Error::ShuttingDown);
        }
        let _transition = lock(&self.transition);

        if self.master_tasks_running() {
            self.set_role(Role::Master, Some(self.self_id.clone()));
            debug!("Master tasks already running");
            return Ok(());
        }

        self.stop_slave_tasks();
        // Leftovers of a master set whose threads have all exited
        self.stop_master_tasks();

        let mut tasks = TaskSet::new("master");
        if let Err(e) = self.spawn_master_tasks(&mut tasks) {
            tasks.stop_and_join(TASK_JOIN_TIMEOUT);
            self.set_role(Role::Slave, None);
            return Err(e);
        }
        *lock(&self.master_tasks) = Some(tasks);

        self.set_role(Role::Master, Some(self.self_id.clone()));
        self.state.promote_node(&self.self_id);
        self.flush_outbox_locally();

        info!("Node {} is now MASTER", self.self_id);
        Ok(())
    }

    fn spawn_master_tasks(&self, tasks: &mut TaskSet) -> Result<()> {
        let config = &self.config;

        let server = ReplicationServer::bind(
            ("0.0.0.0", config.cluster.replication_port),
            self.self_id.clone(),
            Arc::clone(&self.state),
            config.client_read_timeout(),
        )?;
        tasks.spawn("replication-server", move |stop| server.run(stop))?;

        let broadcaster = Arc::clone(&self.broadcaster);
        let port = config.cluster.membership_port;
        let interval = config.heartbeat_interval();
        tasks.spawn("heartbeat", move |stop| run_heartbeat_sender(broadcaster, port, interval, stop))?;

        let state = Arc::clone(&self.state);
        let refresher = Arc::clone(&self.refresher);
        let interval = config.poll_interval();
        tasks.spawn("poller", move |stop| run_poller(state, refresher, interval, stop))?;

        let state = Arc::clone(&self.state);
        let store = self.snapshots.clone();
        let interval = config.snapshot_interval();
        tasks.spawn("snapshot", move |stop| run_snapshot_saver(state, store, interval, stop))?;

        Ok(())
    }

    /// Requests queued while this node was a slave
    fn flush_outbox_locally(&self) {
        let queued: Vec<UserRequest> = std::iter::from_fn(|| self.outbox.take()).collect();
        for request in queued {
            if let Err(reason) = self.state.apply_request(request) {
                warn!("Dropping queued request: {}", reason);
            }
        }
    }

    /// Enter SLAVE following `master`
    fn become_slave(&self, master: &str) -> Result<()> {
        if self.process_stop.is_stopped() {
            return Err(Error::ShuttingDown);
        }
        let _transition = lock(&self.transition);

        self.stop_master_tasks();
        self.stop_slave_tasks();
        self.set_role(Role::Slave, Some(master.to_string()));
        *lock(&self.last_master_heartbeat) = Instant::now();

        let client = ReplicationClient::new(
            master,
            ClientSettings::from_config(&self.config),
            Arc::clone(&self.state),
            Arc::clone(&self.outbox),
        );
        let me = self.me.clone();
        let followed = master.to_string();

        let mut tasks = TaskSet::new("slave");
        let spawned = tasks.spawn("replication-client", move |stop| {
            if let Err(e) = client.run(&stop) {
                if !stop.is_stopped() {
                    warn!("Replication with master {} lost: {}", followed, e);
                    if let Some(node) = me.upgrade() {
                        node.on_replication_lost(&followed);
                    }
                }
            }
        });
        if let Err(e) = spawned {
            tasks.stop_and_join(TASK_JOIN_TIMEOUT);
            return Err(e);
        }
        *lock(&self.slave_tasks) = Some(tasks);

        info!("Node {} is now SLAVE of {}", self.self_id, master);
        Ok(())
    }

    /// Follow the election result
    fn apply_master(&self, winner: &str) {
        let outcome = if winner == self.self_id {
            if self.role() == Role::Master && self.master_tasks_running() {
                return;
            }
            self.become_master()
        } else {
            if self.role() == Role::Slave && self.master().as_deref() == Some(winner) {
                return;
            }
            self.become_slave(winner)
        };

        if let Err(e) = outcome {
            warn!("Role transition towards master {} failed: {}", winner, e);
        }
    }

    fn run_election_loop(&self, stop: StopSignal) {
        let interval = self.config.heartbeat_interval();
        let port = self.config.election_port();

        while !stop.wait_timeout(interval) {
            if self.joining.load(Ordering::SeqCst) {
                continue;
            }

            if let Some(round) = self.election.run_round() {
                let announcement = Announcement::Master { id: round.winner.clone() };
                if let Err(e) = self.broadcaster.broadcast(port, &announcement.to_bytes()) {
                    debug!("Master announcement failed: {}", e);
                }
                self.apply_master(&round.winner);
            }
        }
    }

    /// Start the join protocol unless one is already running
    fn start_join(&self) {
        if self.process_stop.is_stopped() {
            return;
        }
        if self.joining.swap(true, Ordering::SeqCst) {
            debug!("Join already in progress");
            return;
        }
        self.join_answered.store(false, Ordering::SeqCst);

        let node = match self.me.upgrade() {
            Some(node) => node,
            None => return,
        };
        let spawned = thread::Builder::new().name("join".into()).spawn(move || {
            node.run_join();
            node.joining.store(false, Ordering::SeqCst);
        });
        if let Err(e) = spawned {
            warn!("Failed to start join worker: {}", e);
            self.joining.store(false, Ordering::SeqCst);
        }
    }

    fn run_join(&self) {
        let attempts = self.config.cluster.join_attempts;
        let port = self.config.cluster.membership_port;
        let request = encode(&Message::JoinRequest(JoinRequestMsg {
            peer_id: self.self_id.clone(),
        }));

        for attempt in 1..=attempts {
            info!("Looking for a master (attempt {}/{})", attempt, attempts);
            if let Err(e) = self.broadcaster.broadcast(port, &request) {
                warn!("Join broadcast failed: {}", e);
            }
            if self.process_stop.wait_timeout(self.config.join_interval()) {
                return;
            }
            if self.join_answered.load(Ordering::SeqCst) {
                return;
            }
        }

        info!("No master answered after {} attempts, promoting self", attempts);
        self.load_snapshot_if_newer();
        if let Err(e) = self.become_master() {
            warn!("Self-promotion failed: {}", e);
        }
    }

    /// Install the on-disk registry unless the mirror is more recent
    fn load_snapshot_if_newer(&self) {
        match self.snapshots.load() {
            Ok(Some(registry)) => {
                if registry.last_update >= self.state.registry().last_update {
                    info!("Restoring registry from {:?}", self.snapshots.path());
                    self.state.replace_registry(registry);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring registry snapshot: {}", e),
        }
    }

    fn on_replication_lost(&self, master: &str) {
        if self.process_stop.is_stopped() || self.master().as_deref() != Some(master) {
            return;
        }
        self.set_role(Role::Slave, None);
        self.start_join();
    }

    fn on_heartbeat(&self, from: &str) {
        if self.master().as_deref() == Some(from) {
            *lock(&self.last_master_heartbeat) = Instant::now();
        }
    }

    fn on_join_request(&self, from: &str, peer_id: &str) {
        if self.role() != Role::Master {
            return;
        }
        info!("Join request from {} ({})", from, peer_id);

        self.state.add_node(from, Role::Slave);
        let reply = self.join_answer();
        if let Err(e) = self.broadcaster.send_to(from, self.config.cluster.membership_port, &reply) {
            warn!("Failed to answer join request from {}: {}", from, e);
        }
    }

    /// Encoded `JoinResponse`, reduced to a master pointer (cluster view
    /// only) when the full state does not fit in one datagram
    fn join_answer(&self) -> Vec<u8> {
        let snapshot = self.state.snapshot();
        let cluster_view = snapshot.cluster_view.clone();

        let full = encode(&Message::JoinResponse(snapshot));
        if full.len() <= MAX_DATAGRAM_SIZE {
            return full;
        }

        info!("State of {} bytes exceeds a datagram, answering join with a master pointer", full.len());
        encode(&Message::JoinResponse(StateSnapshot {
            cluster_view,
            ..Default::default()
        }))
    }

    /// Pull the master's state once over the replication channel
    fn fetch_state_from(&self, master: &str) -> Result<()> {
        let client = ReplicationClient::new(
            master,
            ClientSettings::from_config(&self.config),
            Arc::clone(&self.state),
            Arc::clone(&self.outbox),
        );
        let mut stream = client.connect()?;
        client.sync_once(&mut stream)
    }

    fn on_join_response(&self, from: &str, snapshot: StateSnapshot) {
        if !self.joining.load(Ordering::SeqCst) {
            debug!("Ignoring unsolicited join response from {}", from);
            return;
        }
        if self.join_answered.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Master {} answered join", from);
        let pointer_only = snapshot.registry.servers.is_empty();
        self.state.replace(snapshot);
        if pointer_only {
            if let Err(e) = self.fetch_state_from(from) {
                warn!("Initial state fetch from {} failed, relying on replication: {}", from, e);
            }
        }
        self.election.adopt(from);
        if let Err(e) = self.become_slave(from) {
            warn!("Failed to follow master {}: {}", from, e);
        }
    }

    fn on_peer_left(&self, peer: &str) {
        if peer == self.self_id {
            return;
        }
        info!("Peer {} left", peer);

        self.state.remove_node(peer);
        self.election.on_leave(peer);

        if self.master().as_deref() == Some(peer) {
            let _transition = lock(&self.transition);
            self.stop_slave_tasks();
            self.set_role(Role::Slave, None);
        }
    }

    fn on_force_master(&self, requested_by: &str) {
        if requested_by == self.self_id {
            return;
        }
        info!("{} forced itself as master", requested_by);

        self.election.force(requested_by);
        if let Err(e) = self.become_slave(requested_by) {
            warn!("Failed to follow forced master {}: {}", requested_by, e);
        }
    }
}

impl MembershipHandler for NodeInner {
    fn on_message(&self, from: &PeerId, message: Message) {
        match message {
            Message::Heartbeat => self.on_heartbeat(from),
            Message::JoinRequest(request) => self.on_join_request(from, &request.peer_id),
            Message::JoinResponse(snapshot) => self.on_join_response(from, snapshot),
            Message::LeaveNotification(leave) => self.on_peer_left(&leave.peer_id),
            Message::ForceMaster(force) => self.on_force_master(&force.requested_by),
            other => debug!("Ignoring {} on membership port", other.type_name()),
        }
    }

    fn on_tick(&self) {
        if self.joining.load(Ordering::SeqCst) || self.process_stop.is_stopped() {
            return;
        }
        if self.role() != Role::Slave {
            return;
        }
        let master = match self.master() {
            Some(master) => master,
            None => return,
        };

        let silent = lock(&self.last_master_heartbeat).elapsed();
        if silent > self.config.heartbeat_timeout() {
            warn!("No heartbeat from master {} for {:?}, rejoining", master, silent);
            {
                let _transition = lock(&self.transition);
                self.stop_slave_tasks();
                self.set_role(Role::Slave, None);
            }
            self.start_join();
        }
    }
}

impl ElectionHandler for NodeInner {
    fn on_announcement(&self, _from: &PeerId, announcement: Announcement) {
        match announcement {
            Announcement::Presence { .. } => {}
            Announcement::Master { id } => {
                if self.election.on_announcement(&id) && !self.joining.load(Ordering::SeqCst) {
                    self.apply_master(&id);
                }
            }
            Announcement::Leave { id } => self.on_peer_left(&id),
        }
    }
}

/// Persist the registry every `interval`, and once more on stop
fn run_snapshot_saver(
    state: Arc<ReplicatedState>,
    store: SnapshotStore,
    interval: Duration,
    stop: StopSignal,
) {
    loop {
        let stopped = stop.wait_timeout(interval);
        if let Err(e) = store.save(&state.registry()) {
            warn!("Failed to save registry snapshot: {}", e);
        }
        if stopped {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerPriority;
    use crate::network::decode;
    use crate::registry::{ServerElement, ServersData};
    use std::net::TcpListener;
    use tempfile::{tempdir, TempDir};

    fn test_config(dir: &TempDir) -> HostbookConfig {
        let mut config = HostbookConfig::default();
        config.node.address = Some("127.0.0.1".into());
        config.node.data_dir = dir.path().to_path_buf();
        config.cluster.replication_port = 0;
        config.cluster.heartbeat_interval_ms = 100;
        config.replication.connect_timeout_ms = 200;
        config.replication.fetch_interval_ms = 50;
        config.snapshot.interval_ms = 50;
        config
    }

    fn registry() -> ServersData {
        let mut registry = ServersData::new();
        registry.upsert(ServerElement::new("srv1"));
        registry.touch(Utc::now());
        registry
    }

    #[test]
    fn test_new_loads_snapshot() {
        let dir = tempdir().unwrap();
        SnapshotStore::new(dir.path()).save(&registry()).unwrap();

        let node = Node::new(test_config(&dir)).unwrap();
        assert_eq!(node.id(), "127.0.0.1");
        assert_eq!(node.role(), Role::Slave);
        assert!(node.snapshot().registry.get("srv1").is_some());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let mut config = test_config(&dir);
        config.cluster.heartbeat_retries = 0;
        assert!(matches!(Node::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_force_master_serves_requests() {
        let dir = tempdir().unwrap();
        SnapshotStore::new(dir.path()).save(&registry()).unwrap();
        let node = Node::new(test_config(&dir)).unwrap();
        let changes = node.subscribe();

        node.force_master().unwrap();
        assert!(node.is_master());
        assert_eq!(node.master().as_deref(), Some("127.0.0.1"));
        assert_eq!(node.snapshot().cluster_view.master().unwrap().peer_id, "127.0.0.1");
        assert!(changes.try_iter().any(|c| c == StateChange::Role(Role::Master)));

        let request = UserRequest::reserve("srv1", "alice", "");
        assert_eq!(node.submit_request(request.clone()).unwrap(), Submitted::Applied);
        assert!(matches!(node.submit_request(request), Err(Error::Rejected(_))));

        let resolved = node.resolve_requests().unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].node_ip, "127.0.0.1");
        assert!(node.snapshot().pending_requests.is_empty());

        let status = node.status();
        assert_eq!(status.role, Role::Master);
        assert_eq!(status.override_master.as_deref(), Some("127.0.0.1"));
        assert_eq!(status.servers, 1);

        // Forcing again keeps the running master tasks
        node.force_master().unwrap();
        assert!(node.is_master());

        node.shutdown();
        let saved = SnapshotStore::new(dir.path()).load().unwrap().unwrap();
        assert_eq!(saved.get("srv1").unwrap().reservation, "alice");
    }

    #[test]
    fn test_slave_queues_requests() {
        let dir = tempdir().unwrap();
        let node = Node::new(test_config(&dir)).unwrap();

        let submitted = node.submit_request(UserRequest::release("srv1", "bob")).unwrap();
        assert_eq!(submitted, Submitted::Forwarded);
        assert_eq!(node.status().queued_requests, 1);
        assert!(node.snapshot().pending_requests.is_empty());
        assert!(matches!(node.resolve_requests(), Err(Error::NoMaster)));
    }

    /// Config whose replication port points at `listener`, standing in for
    /// a remote master that accepts but stays silent
    fn follower_config(dir: &TempDir, listener: &TcpListener) -> HostbookConfig {
        let mut config = test_config(dir);
        config.cluster.replication_port = listener.local_addr().unwrap().port();
        config.replication.client_read_timeout_ms = 1000;
        config
    }

    #[test]
    fn test_join_response_and_master_leave() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.2:0").unwrap();
        let node = Node::new(follower_config(&dir, &listener)).unwrap();
        let inner = &node.inner;
        let master = "127.0.0.2".to_string();

        // Unsolicited answers are ignored
        let snapshot = StateSnapshot {
            registry: registry(),
            ..Default::default()
        };
        inner.on_message(&master, Message::JoinResponse(snapshot.clone()));
        assert!(node.master().is_none());

        inner.joining.store(true, Ordering::SeqCst);
        inner.on_message(&master, Message::JoinResponse(snapshot));
        assert_eq!(node.role(), Role::Slave);
        assert_eq!(node.master(), Some(master.clone()));
        assert_eq!(inner.election.current_master(), Some(master.clone()));
        assert!(node.snapshot().registry.get("srv1").is_some());
        assert!(matches!(node.resolve_requests(), Err(Error::NotMaster(m)) if m == master));

        inner.on_message(
            &master,
            Message::LeaveNotification(LeaveMsg { peer_id: master.clone() }),
        );
        assert!(node.master().is_none());
        assert!(inner.election.current_master().is_none());

        node.shutdown();
    }

    #[test]
    fn test_force_master_from_peer_is_followed() {
        let dir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.3:0").unwrap();
        let node = Node::new(follower_config(&dir, &listener)).unwrap();
        let forced = "127.0.0.3".to_string();

        node.inner.on_message(
            &forced,
            Message::ForceMaster(ForceMasterMsg { requested_by: forced.clone() }),
        );
        assert_eq!(node.role(), Role::Slave);
        assert_eq!(node.master(), Some(forced.clone()));
        assert_eq!(node.inner.election.override_master(), Some(forced));

        // Our own ForceMaster echoed back is ignored
        node.inner.on_message(
            &"127.0.0.1".to_string(),
            Message::ForceMaster(ForceMasterMsg { requested_by: "127.0.0.1".into() }),
        );
        assert_eq!(node.master().as_deref(), Some("127.0.0.3"));

        node.shutdown();
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        cond()
    }

    /// Node on `address` sharing `port` and a priority table with its peers
    fn cluster_config(dir: &TempDir, address: &str, port: u16) -> HostbookConfig {
        let mut config = test_config(dir);
        config.node.address = Some(address.into());
        config.cluster.replication_port = port;
        config.cluster.peers = ["127.0.0.1", "127.0.0.2", "127.0.0.3"]
            .iter()
            .zip(1..)
            .map(|(address, priority)| PeerPriority {
                address: address.to_string(),
                priority,
            })
            .collect();
        config
    }

    #[test]
    fn test_failed_promotion_stays_slave_and_retries() {
        let dir = tempdir().unwrap();
        let blocker = TcpListener::bind("0.0.0.0:0").unwrap();
        let mut config = test_config(&dir);
        config.cluster.replication_port = blocker.local_addr().unwrap().port();
        let node = Node::new(config).unwrap();

        assert!(node.force_master().is_err());
        assert_eq!(node.role(), Role::Slave);
        assert!(node.master().is_none());
        assert!(!node.inner.master_tasks_running());

        // Port freed: the next round's result is applied again
        drop(blocker);
        node.inner.apply_master("127.0.0.1");
        assert!(node.is_master());
        assert!(node.inner.master_tasks_running());

        node.shutdown();
    }

    #[test]
    fn test_large_state_join_uses_pointer_and_fetch() {
        let port = free_port();
        let master_dir = tempdir().unwrap();
        let mut big = ServersData::new();
        for i in 0..1000 {
            let mut element = ServerElement::new(format!("srv{:04}", i));
            element.app = "inventory-service".into();
            element.ip = format!("10.1.{}.{}", i / 256, i % 256);
            element.env = "production".into();
            big.upsert(element);
        }
        SnapshotStore::new(master_dir.path()).save(&big).unwrap();

        let mut config = test_config(&master_dir);
        config.cluster.replication_port = port;
        let master = Node::new(config).unwrap();
        master.force_master().unwrap();

        assert!(encode(&Message::JoinResponse(master.snapshot())).len() > MAX_DATAGRAM_SIZE);
        let answer = master.inner.join_answer();
        assert!(answer.len() <= MAX_DATAGRAM_SIZE);
        let pointer = match decode(&answer).unwrap() {
            Message::JoinResponse(snapshot) => snapshot,
            other => panic!("unexpected answer {:?}", other),
        };
        assert!(pointer.registry.servers.is_empty());
        assert_eq!(pointer.cluster_view.master().unwrap().peer_id, "127.0.0.1");

        let joiner_dir = tempdir().unwrap();
        let mut config = test_config(&joiner_dir);
        config.node.address = Some("127.0.0.4".into());
        config.cluster.replication_port = port;
        let joiner = Node::new(config).unwrap();

        joiner.inner.joining.store(true, Ordering::SeqCst);
        joiner.inner.on_message(&"127.0.0.1".to_string(), Message::JoinResponse(pointer));
        assert_eq!(joiner.role(), Role::Slave);
        assert_eq!(joiner.master().as_deref(), Some("127.0.0.1"));
        assert_eq!(joiner.snapshot().registry, master.snapshot().registry);

        joiner.shutdown();
        master.shutdown();
    }

    #[test]
    fn test_master_leave_reelects_and_slaves_follow() {
        let port = free_port();
        let dirs: Vec<TempDir> = (0..3).map(|_| tempdir().unwrap()).collect();
        SnapshotStore::new(dirs[0].path()).save(&registry()).unwrap();

        let a = Node::new(cluster_config(&dirs[0], "127.0.0.1", port)).unwrap();
        let b = Node::new(cluster_config(&dirs[1], "127.0.0.2", port)).unwrap();
        let c = Node::new(cluster_config(&dirs[2], "127.0.0.3", port)).unwrap();
        let id_a = "127.0.0.1".to_string();
        let id_b = "127.0.0.2".to_string();

        a.force_master().unwrap();
        for node in [&b, &c] {
            node.inner.on_message(
                &id_a,
                Message::ForceMaster(ForceMasterMsg { requested_by: id_a.clone() }),
            );
        }
        a.submit_request(UserRequest::reserve("srv1", "alice", "")).unwrap();

        let reserved = |node: &Node| {
            node.snapshot()
                .registry
                .get("srv1")
                .map(|s| s.reservation == "alice")
                .unwrap_or(false)
        };
        assert!(wait_for(|| reserved(&b) && reserved(&c)));

        // A announces its departure, then stops
        for node in [&b, &c] {
            node.inner.on_message(
                &id_a,
                Message::LeaveNotification(LeaveMsg { peer_id: id_a.clone() }),
            );
            assert!(node.master().is_none());
        }
        a.shutdown();

        // B still hears C and wins on priority
        b.inner.directory.record("127.0.0.3");
        let round = b.inner.election.run_round().unwrap();
        assert_eq!(round.winner, id_b);
        b.inner.apply_master(&round.winner);
        assert_eq!(b.role(), Role::Master);
        assert!(b.inner.master_tasks_running());
        assert!(reserved(&b));

        // C adopts B's announcement and mirrors its state
        c.inner.on_announcement(&id_b, Announcement::Master { id: id_b.clone() });
        assert_eq!(c.role(), Role::Slave);
        assert_eq!(c.master(), Some(id_b.clone()));
        assert!(wait_for(|| c.snapshot() == b.snapshot()));
        assert!(reserved(&c));
        assert_eq!(c.snapshot().cluster_view.master().unwrap().peer_id, id_b);

        c.shutdown();
        b.shutdown();
    }
}
