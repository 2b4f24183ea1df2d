//! Replication server (master side)
//!
//! Accepts slave connections on the replication port and serves
//! `FetchState` and `ActionRequest` frames, one thread per connection.

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::network::{poll_readable, read_message, write_message, Message, Readiness};
use crate::node::StopSignal;
use crate::registry::{PeerId, ReplicatedState, Role};

/// How often blocked threads wake to check the stop signal
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Replication server
pub struct ReplicationServer {
    self_id: PeerId,
    listener: TcpListener,
    state: Arc<ReplicatedState>,
    client_read_timeout: Duration,
}

impl ReplicationServer {
    /// Bind the listening socket
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        self_id: impl Into<PeerId>,
        state: Arc<ReplicatedState>,
        client_read_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            self_id: self_id.into(),
            listener,
            state,
            client_read_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `stop` is raised
    pub fn run(self, stop: StopSignal) {
        info!("Replication server listening on {:?}", self.listener.local_addr());

        while !stop.is_stopped() {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    debug!("Accepted replication connection from {}", addr);
                    let connection = Connection {
                        self_id: self.self_id.clone(),
                        state: Arc::clone(&self.state),
                        client_read_timeout: self.client_read_timeout,
                        stop: stop.clone(),
                    };

                    let spawned = thread::Builder::new()
                        .name(format!("replication-conn-{}", addr))
                        .spawn(move || connection.serve(stream, addr));
                    if let Err(e) = spawned {
                        warn!("Failed to spawn connection handler for {}: {}", addr, e);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    stop.wait_timeout(POLL_INTERVAL);
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                    stop.wait_timeout(POLL_INTERVAL);
                }
            }
        }

        info!("Replication server stopped");
    }
}

struct Connection {
    self_id: PeerId,
    state: Arc<ReplicatedState>,
    client_read_timeout: Duration,
    stop: StopSignal,
}

impl Connection {
    fn serve(self, stream: TcpStream, addr: SocketAddr) {
        let peer_id = addr.ip().to_string();
        let tracked = peer_id != self.self_id;
        if tracked {
            self.state.add_node(&peer_id, Role::Slave);
        }

        match self.handle(stream) {
            Ok(()) => debug!("Replication connection from {} closed", addr),
            Err(e) => debug!("Replication connection from {} ended: {}", addr, e),
        }

        if tracked {
            self.state.remove_node(&peer_id);
        }
    }

    fn handle(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_nonblocking(false)?;
        let mut last_activity = Instant::now();

        while !self.stop.is_stopped() {
            match poll_readable(&stream, POLL_INTERVAL)? {
                Readiness::Closed => return Ok(()),
                Readiness::Idle => {
                    if last_activity.elapsed() > self.client_read_timeout {
                        return Err(Error::ConnectionTimeout(format!(
                            "{:?} idle for {:?}",
                            stream.peer_addr(),
                            self.client_read_timeout
                        )));
                    }
                    continue;
                }
                Readiness::Data => {}
            }

            stream.set_read_timeout(Some(self.client_read_timeout))?;
            let message = match read_message(&mut stream) {
                Ok(message) => message,
                Err(Error::Decode(e)) => {
                    warn!("Dropping undecodable replication frame: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            last_activity = Instant::now();

            match message {
                Message::FetchState => {
                    write_message(&mut stream, &Message::StateUpdate(self.state.snapshot()))?;
                }
                Message::ActionRequest(action) => {
                    let request = action.user_request;
                    let summary = format!(
                        "{} {} for {}",
                        if request.desired_available { "release" } else { "reserve" },
                        request.host,
                        request.user
                    );
                    match self.state.apply_request(request) {
                        Ok(()) => info!("Applied {}", summary),
                        Err(reason) => warn!("Rejected {}: {}", summary, reason),
                    }
                }
                other => debug!("Ignoring {} on replication channel", other.type_name()),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::ActionRequestMsg;
    use crate::registry::{ServerElement, ServersData, UserRequest};

    fn start_server(state: Arc<ReplicatedState>) -> (SocketAddr, StopSignal) {
        let server = ReplicationServer::bind("127.0.0.1:0", "10.9.9.9", state, Duration::from_secs(2)).unwrap();
        let addr = server.local_addr().unwrap();
        let stop = StopSignal::new();
        let signal = stop.clone();
        thread::spawn(move || server.run(signal));
        (addr, stop)
    }

    fn seeded_state() -> Arc<ReplicatedState> {
        let mut registry = ServersData::new();
        registry.upsert(ServerElement::new("srv1"));
        Arc::new(ReplicatedState::with_registry(registry))
    }

    #[test]
    fn test_fetch_state_and_action_request() {
        let state = seeded_state();
        let (addr, stop) = start_server(Arc::clone(&state));

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        write_message(&mut stream, &Message::FetchState).unwrap();
        match read_message(&mut stream).unwrap() {
            Message::StateUpdate(snapshot) => {
                assert!(snapshot.registry.get("srv1").unwrap().available);
                assert_eq!(snapshot.cluster_view.get("127.0.0.1").unwrap().role, Role::Slave);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        let request = UserRequest::reserve("srv1", "alice", "");
        for _ in 0..2 {
            write_message(
                &mut stream,
                &Message::ActionRequest(ActionRequestMsg { user_request: request.clone() }),
            )
            .unwrap();
        }

        write_message(&mut stream, &Message::FetchState).unwrap();
        match read_message(&mut stream).unwrap() {
            Message::StateUpdate(snapshot) => {
                assert_eq!(snapshot.registry.get("srv1").unwrap().reservation, "alice");
                assert_eq!(snapshot.pending_requests.len(), 1);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        stop.stop();
    }

    #[test]
    fn test_disconnect_removes_slave() {
        let state = seeded_state();
        let (addr, stop) = start_server(Arc::clone(&state));

        {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            write_message(&mut stream, &Message::FetchState).unwrap();
            read_message(&mut stream).unwrap();
            assert!(state.cluster_view().get("127.0.0.1").is_some());
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while state.cluster_view().get("127.0.0.1").is_some() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(state.cluster_view().get("127.0.0.1").is_none());

        stop.stop();
    }

    #[test]
    fn test_garbage_frame_keeps_connection() {
        let state = seeded_state();
        let (addr, stop) = start_server(state);

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let body = br#"{"Type":"Bogus","Payload":null}"#;
        let header = crate::network::FrameHeader::new(body);
        std::io::Write::write_all(&mut stream, &header.to_bytes()).unwrap();
        std::io::Write::write_all(&mut stream, body).unwrap();

        write_message(&mut stream, &Message::FetchState).unwrap();
        assert!(matches!(read_message(&mut stream).unwrap(), Message::StateUpdate(_)));

        stop.stop();
    }
}
