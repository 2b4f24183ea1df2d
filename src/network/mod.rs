//! Network Module
//!
//! TCP framing for the replication channel, UDP helpers for the membership
//! and election ports, and the discovery threads built on them.

pub mod protocol;
pub mod discovery;
mod transport;

pub use protocol::{decode, encode, Announcement, DecodeError, Message};
pub use transport::{bind_udp, local_ipv4, Broadcaster, MAX_DATAGRAM_SIZE};

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::{Error, Result};

/// Largest frame body accepted on the replication channel
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Frame header: body length and CRC32, both big-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    pub fn new(body: &[u8]) -> Self {
        Self {
            length: body.len() as u32,
            checksum: crc32fast::hash(body),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [a, b, c, d, e, f, g, h] = *bytes;
        Self {
            length: u32::from_be_bytes([a, b, c, d]),
            checksum: u32::from_be_bytes([e, f, g, h]),
        }
    }
}

/// Read a framed message
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message> {
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes)?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_SIZE {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds limit of {}",
            header.length, MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body)?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    Ok(decode(&body)?)
}

/// Write a framed message
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    let body = encode(message);
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(Error::Network(format!(
            "{} of {} bytes exceeds frame limit of {}",
            message.type_name(),
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;

    Ok(())
}

/// Outcome of polling a stream for incoming data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least one byte is waiting
    Data,
    /// Nothing arrived within the poll window
    Idle,
    /// The peer closed the connection
    Closed,
}

/// Wait up to `poll` for data without consuming it
pub fn poll_readable(stream: &TcpStream, poll: Duration) -> Result<Readiness> {
    stream.set_read_timeout(Some(poll))?;
    let mut byte = [0u8; 1];
    match stream.peek(&mut byte) {
        Ok(0) => Ok(Readiness::Closed),
        Ok(_) => Ok(Readiness::Data),
        Err(e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
        {
            Ok(Readiness::Idle)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::JoinRequestMsg;
    use std::io::Cursor;

    #[test]
    fn test_frame_header_big_endian() {
        let header = FrameHeader { length: 0x0102_0304, checksum: 0xAABB_CCDD };
        let bytes = header.to_bytes();
        assert_eq!(bytes, [1, 2, 3, 4, 0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(FrameHeader::from_bytes(&bytes), header);
    }

    #[test]
    fn test_framed_message_over_buffer() {
        let message = Message::JoinRequest(JoinRequestMsg { peer_id: "10.0.0.4".into() });
        let mut buf = Vec::new();
        write_message(&mut buf, &message).unwrap();
        write_message(&mut buf, &Message::FetchState).unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_message(&mut cursor).unwrap(), message);
        assert_eq!(read_message(&mut cursor).unwrap(), Message::FetchState);
        assert!(matches!(read_message(&mut cursor), Err(Error::Io(_))));
    }

    #[test]
    fn test_corrupt_frame_rejected() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Message::Heartbeat).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        assert!(matches!(read_message(&mut Cursor::new(buf)), Err(Error::Network(_))));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let header = FrameHeader { length: MAX_FRAME_SIZE + 1, checksum: 0 };
        let buf = header.to_bytes().to_vec();

        assert!(matches!(read_message(&mut Cursor::new(buf)), Err(Error::Network(_))));
    }

    #[test]
    fn test_oversized_message_not_written() {
        use crate::registry::{ServerElement, StateSnapshot};

        let mut snapshot = StateSnapshot::default();
        let mut element = ServerElement::new("srv-big");
        element.comment = "x".repeat(MAX_FRAME_SIZE as usize);
        snapshot.registry.upsert(element);

        let mut buf = Vec::new();
        let err = write_message(&mut buf, &Message::StateUpdate(snapshot)).unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_garbage_body_is_decode_error() {
        let body = b"{\"Type\":\"Nope\"}";
        let mut buf = FrameHeader::new(body).to_bytes().to_vec();
        buf.extend_from_slice(body);

        assert!(matches!(read_message(&mut Cursor::new(buf)), Err(Error::Decode(_))));
    }
}
