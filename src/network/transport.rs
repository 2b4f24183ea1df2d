//! UDP transport helpers

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::{Error, Result};

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

fn check_datagram(data: &[u8]) -> Result<()> {
    if data.len() > MAX_DATAGRAM_SIZE {
        return Err(Error::Network(format!(
            "Datagram of {} bytes exceeds limit of {}",
            data.len(),
            MAX_DATAGRAM_SIZE
        )));
    }
    Ok(())
}

/// Sending side of the membership and election ports
pub struct Broadcaster {
    socket: UdpSocket,
    broadcast: IpAddr,
}

impl Broadcaster {
    /// Bind an ephemeral broadcast-capable socket
    pub fn new(broadcast_address: &str) -> Result<Self> {
        let broadcast: IpAddr = broadcast_address.parse().map_err(|_| {
            Error::Config(format!("Invalid broadcast address: {}", broadcast_address))
        })?;

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_broadcast(true)?;

        Ok(Self { socket, broadcast })
    }

    /// Send one datagram to every node listening on `port`
    pub fn broadcast(&self, port: u16, data: &[u8]) -> Result<()> {
        check_datagram(data)?;
        self.socket.send_to(data, SocketAddr::new(self.broadcast, port))?;
        Ok(())
    }

    /// Send one datagram to a single node
    pub fn send_to(&self, ip: &str, port: u16, data: &[u8]) -> Result<()> {
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| Error::Network(format!("Invalid peer address: {}", ip)))?;
        check_datagram(data)?;
        self.socket.send_to(data, SocketAddr::new(ip, port))?;
        Ok(())
    }
}

/// Bind a receiving socket on all interfaces with a bounded read timeout
pub fn bind_udp(port: u16, read_timeout: Duration) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", port)).map_err(|e| {
        Error::Network(format!("Failed to bind UDP port {}: {}", port, e))
    })?;
    socket.set_read_timeout(Some(read_timeout))?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// Detect the IPv4 address this host uses for outbound traffic
///
/// Connecting a UDP socket sends nothing; it only selects a route. Falls
/// back to loopback when no route exists.
pub fn local_ipv4() -> Ipv4Addr {
    let detect = || -> std::io::Result<Option<Ipv4Addr>> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(match socket.local_addr()?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
            _ => None,
        })
    };

    match detect() {
        Ok(Some(ip)) => ip,
        _ => {
            tracing::warn!("Could not detect local IPv4 address, using 127.0.0.1");
            Ipv4Addr::LOCALHOST
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unicast_loopback() {
        let receiver = bind_udp(0, Duration::from_secs(2)).unwrap();
        let port = receiver.local_addr().unwrap().port();

        let sender = Broadcaster::new("255.255.255.255").unwrap();
        sender.send_to("127.0.0.1", port, b"ping").unwrap();

        let mut buf = [0u8; 16];
        let (len, src) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(src.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(matches!(Broadcaster::new("not-an-ip"), Err(Error::Config(_))));
        let sender = Broadcaster::new("255.255.255.255").unwrap();
        assert!(matches!(sender.send_to("nope", 1, b"x"), Err(Error::Network(_))));
    }

    #[test]
    fn test_oversized_datagram_refused() {
        let sender = Broadcaster::new("255.255.255.255").unwrap();
        let data = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert!(matches!(sender.send_to("127.0.0.1", 9, &data), Err(Error::Network(_))));
        assert!(matches!(sender.broadcast(9, &data), Err(Error::Network(_))));
    }

    #[test]
    fn test_local_ipv4_is_not_unspecified() {
        assert!(!local_ipv4().is_unspecified());
    }
}
