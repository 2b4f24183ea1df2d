//! UDP broadcast discovery
//!
//! Thread bodies for the presence beacon, the master heartbeat sender and
//! the two receive loops (membership port and election port). Receive
//! loops use a bounded read timeout so they notice the stop signal, and
//! never exit on a bad datagram.

use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use super::protocol::{decode, encode, Announcement, Message};
use super::transport::{Broadcaster, MAX_DATAGRAM_SIZE};
use crate::node::StopSignal;
use crate::registry::PeerId;
use crate::state::MembershipDirectory;

/// Consumer of membership-port traffic
pub trait MembershipHandler: Send + Sync {
    /// A decoded message from `from`
    fn on_message(&self, from: &PeerId, message: Message);

    /// Periodic callback, at least once per read timeout
    fn on_tick(&self) {}
}

/// Consumer of election-port traffic
pub trait ElectionHandler: Send + Sync {
    fn on_announcement(&self, from: &PeerId, announcement: Announcement);
}

/// Broadcast `{"type":"hello"}` every `interval` until stopped
pub fn run_presence_beacon(
    self_id: PeerId,
    broadcaster: Arc<Broadcaster>,
    port: u16,
    interval: Duration,
    stop: StopSignal,
) {
    let hello = Announcement::Presence { id: self_id }.to_bytes();
    info!("Presence beacon started on port {}", port);

    loop {
        if let Err(e) = broadcaster.broadcast(port, &hello) {
            debug!("Presence broadcast failed: {}", e);
        }
        if stop.wait_timeout(interval) {
            break;
        }
    }
}

/// Broadcast master `Heartbeat` envelopes every `interval` until stopped
pub fn run_heartbeat_sender(
    broadcaster: Arc<Broadcaster>,
    port: u16,
    interval: Duration,
    stop: StopSignal,
) {
    let heartbeat = encode(&Message::Heartbeat);
    info!("Heartbeat sender started");

    loop {
        if let Err(e) = broadcaster.broadcast(port, &heartbeat) {
            debug!("Heartbeat broadcast failed: {}", e);
        }
        if stop.wait_timeout(interval) {
            break;
        }
    }

    info!("Heartbeat sender stopped");
}

fn is_self(src: IpAddr, self_id: &str) -> bool {
    src.to_string() == self_id
}

/// Receive membership-port envelopes until stopped
pub fn run_membership_listener(
    socket: UdpSocket,
    self_id: PeerId,
    directory: Arc<MembershipDirectory>,
    handler: Arc<dyn MembershipHandler>,
    stop: StopSignal,
) {
    let tick_every = socket
        .read_timeout()
        .ok()
        .flatten()
        .unwrap_or(Duration::from_millis(500));
    let mut last_tick = Instant::now();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    info!("Membership listener bound to {:?}", socket.local_addr());

    while !stop.is_stopped() {
        match socket.recv_from(&mut buf) {
            Ok((len, src)) => {
                if is_self(src.ip(), &self_id) {
                    continue;
                }

                let message = match decode(&buf[..len]) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!("Discarding datagram from {}: {}", src, e);
                        continue;
                    }
                };

                let from = src.ip().to_string();
                trace!("{} from {}", message.type_name(), from);
                if !matches!(message, Message::LeaveNotification(_)) {
                    directory.record(&from);
                }
                handler.on_message(&from, message);
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                warn!("Membership recv error: {}", e);
                stop.wait_timeout(Duration::from_millis(100));
            }
        }

        if last_tick.elapsed() >= tick_every {
            last_tick = Instant::now();
            handler.on_tick();
        }
    }

    info!("Membership listener stopped");
}

/// Receive election-port announcements until stopped
pub fn run_election_listener(
    socket: UdpSocket,
    self_id: PeerId,
    directory: Arc<MembershipDirectory>,
    handler: Arc<dyn ElectionHandler>,
    stop: StopSignal,
) {
    let mut buf = [0u8; 1024];

    info!("Election listener bound to {:?}", socket.local_addr());

    while !stop.is_stopped() {
        match socket.recv_from(&mut buf) {
            Ok((len, src)) => {
                let announcement = match Announcement::from_bytes(&buf[..len]) {
                    Ok(a) => a,
                    Err(e) => {
                        debug!("Discarding announcement from {}: {}", src, e);
                        continue;
                    }
                };

                let from = src.ip().to_string();
                if !is_self(src.ip(), &self_id) && !matches!(announcement, Announcement::Leave { .. }) {
                    directory.record(&from);
                }
                handler.on_announcement(&from, announcement);
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                warn!("Election recv error: {}", e);
                stop.wait_timeout(Duration::from_millis(100));
            }
        }
    }

    info!("Election listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::bind_udp;
    use crate::network::protocol::JoinRequestMsg;
    use std::sync::Mutex;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<(PeerId, Message)>>,
        announcements: Mutex<Vec<(PeerId, Announcement)>>,
    }

    impl MembershipHandler for Recorder {
        fn on_message(&self, from: &PeerId, message: Message) {
            self.messages.lock().unwrap().push((from.clone(), message));
        }
    }

    impl ElectionHandler for Recorder {
        fn on_announcement(&self, from: &PeerId, announcement: Announcement) {
            self.announcements.lock().unwrap().push((from.clone(), announcement));
        }
    }

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_membership_listener_records_and_survives_garbage() {
        let socket = bind_udp(0, Duration::from_millis(50)).unwrap();
        let port = socket.local_addr().unwrap().port();
        let directory = Arc::new(MembershipDirectory::new("10.9.9.9", Duration::from_secs(6)));
        let recorder = Arc::new(Recorder::default());
        let stop = StopSignal::new();

        let handle = {
            let directory = Arc::clone(&directory);
            let handler: Arc<dyn MembershipHandler> = recorder.clone();
            let stop = stop.clone();
            thread::spawn(move || run_membership_listener(socket, "10.9.9.9".into(), directory, handler, stop))
        };

        let sender = Broadcaster::new("255.255.255.255").unwrap();
        sender.send_to("127.0.0.1", port, b"garbage").unwrap();
        let join = Message::JoinRequest(JoinRequestMsg { peer_id: "127.0.0.1".into() });
        sender.send_to("127.0.0.1", port, &encode(&join)).unwrap();

        assert!(wait_until(|| !recorder.messages.lock().unwrap().is_empty()));
        let messages = recorder.messages.lock().unwrap().clone();
        assert_eq!(messages, [("127.0.0.1".to_string(), join)]);
        assert!(directory.is_active("127.0.0.1"));

        stop.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_membership_listener_ignores_self() {
        let socket = bind_udp(0, Duration::from_millis(50)).unwrap();
        let port = socket.local_addr().unwrap().port();
        let directory = Arc::new(MembershipDirectory::new("127.0.0.1", Duration::from_secs(6)));
        let recorder = Arc::new(Recorder::default());
        let stop = StopSignal::new();

        let handle = {
            let directory = Arc::clone(&directory);
            let handler: Arc<dyn MembershipHandler> = recorder.clone();
            let stop = stop.clone();
            thread::spawn(move || run_membership_listener(socket, "127.0.0.1".into(), directory, handler, stop))
        };

        let sender = Broadcaster::new("255.255.255.255").unwrap();
        sender.send_to("127.0.0.1", port, &encode(&Message::Heartbeat)).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(recorder.messages.lock().unwrap().is_empty());

        stop.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_election_listener_delivers_announcements() {
        let socket = bind_udp(0, Duration::from_millis(50)).unwrap();
        let port = socket.local_addr().unwrap().port();
        let directory = Arc::new(MembershipDirectory::new("10.9.9.9", Duration::from_secs(6)));
        let recorder = Arc::new(Recorder::default());
        let stop = StopSignal::new();

        let handle = {
            let directory = Arc::clone(&directory);
            let handler: Arc<dyn ElectionHandler> = recorder.clone();
            let stop = stop.clone();
            thread::spawn(move || run_election_listener(socket, "10.9.9.9".into(), directory, handler, stop))
        };

        let sender = Broadcaster::new("255.255.255.255").unwrap();
        let master = Announcement::Master { id: "10.0.0.1".into() };
        sender.send_to("127.0.0.1", port, &master.to_bytes()).unwrap();

        assert!(wait_until(|| !recorder.announcements.lock().unwrap().is_empty()));
        assert_eq!(recorder.announcements.lock().unwrap()[0].1, master);
        assert!(directory.is_active("127.0.0.1"));

        stop.stop();
        handle.join().unwrap();
    }
}
