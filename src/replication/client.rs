//! Replication client (slave side)
//!
//! Holds one connection to the master, flushes forwarded write-requests
//! and pulls the full state every fetch interval.

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::network::protocol::ActionRequestMsg;
use crate::network::{read_message, write_message, Message};
use crate::node::StopSignal;
use crate::registry::{PeerId, ReplicatedState, UserRequest};

/// Write-requests waiting to be forwarded to the master
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Mutex<VecDeque<UserRequest>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: UserRequest) {
        self.lock().push_back(request);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take the oldest queued request
    pub fn take(&self) -> Option<UserRequest> {
        self.lock().pop_front()
    }

    fn push_front(&self, request: UserRequest) {
        self.lock().push_front(request);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<UserRequest>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Replication client settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub port: u16,
    pub fetch_interval: Duration,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
}

/// Replication client bound to one master
pub struct ReplicationClient {
    master: PeerId,
    settings: ClientSettings,
    state: Arc<ReplicatedState>,
    outbox: Arc<Outbox>,
}

impl ReplicationClient {
    pub fn new(
        master: impl Into<PeerId>,
        settings: ClientSettings,
        state: Arc<ReplicatedState>,
        outbox: Arc<Outbox>,
    ) -> Self {
        Self {
            master: master.into(),
            settings,
            state,
            outbox,
        }
    }

    pub fn master(&self) -> &str {
        &self.master
    }

    fn master_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.master, self.settings.port)
            .parse()
            .map_err(|_| Error::Network(format!("Invalid master address: {}", self.master)))
    }

    /// Open the connection to the master
    pub fn connect(&self) -> Result<TcpStream> {
        let addr = self.master_addr()?;
        let stream = TcpStream::connect_timeout(&addr, self.settings.connect_timeout).map_err(|e| {
            Error::ConnectionFailed {
                address: addr.to_string(),
                reason: e.to_string(),
            }
        })?;
        stream.set_read_timeout(Some(self.settings.read_timeout))?;
        stream.set_write_timeout(Some(self.settings.read_timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Sync until `stop` is raised (`Ok`) or the connection fails (`Err`)
    pub fn run(&self, stop: &StopSignal) -> Result<()> {
        let mut stream = self.connect()?;
        info!("Connected to master {}", self.master);

        loop {
            if stop.is_stopped() {
                return Ok(());
            }
            self.sync_once(&mut stream)?;
            if stop.wait_timeout(self.settings.fetch_interval) {
                return Ok(());
            }
        }
    }

    /// Flush the outbox, then fetch and install the master's state
    pub fn sync_once(&self, stream: &mut TcpStream) -> Result<()> {
        while let Some(request) = self.outbox.take() {
            let message = Message::ActionRequest(ActionRequestMsg {
                user_request: request.clone(),
            });
            if let Err(e) = write_message(stream, &message) {
                self.outbox.push_front(request);
                return Err(e);
            }
            debug!("Forwarded request for {} to master", request.host);
        }

        write_message(stream, &Message::FetchState)?;
        loop {
            match read_message(stream)? {
                Message::StateUpdate(snapshot) => {
                    self.state.replace(snapshot);
                    return Ok(());
                }
                other => debug!("Ignoring {} while waiting for state", other.type_name()),
            }
        }
    }
}
