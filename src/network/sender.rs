//! UDP transmitter for encoded frames
//!
//! One socket per capture session, connected to the destination so the hot
//! loop pays no per-send address lookup. The socket lives on the capture
//! thread; sends are blocking but a datagram send on a connected UDP socket
//! does not stall.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use bytes::Bytes;

use crate::error::NetworkError;
use crate::protocol::{encode_header, HEADER_LEN, MAX_PAYLOAD_LEN};

/// Resolve and validate a destination before any resource is acquired.
pub fn resolve_destination(host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
    if host.trim().is_empty() {
        return Err(NetworkError::InvalidDestination(
            "destination host is empty".into(),
        ));
    }
    if port == 0 {
        return Err(NetworkError::InvalidDestination(
            "destination port must be non-zero".into(),
        ));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::InvalidDestination(format!("{host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| {
            NetworkError::InvalidDestination(format!("{host}:{port} resolved to no address"))
        })
}

/// Connected UDP socket with the wire-format framing applied per send
pub struct UdpTransmitter {
    socket: UdpSocket,
    destination: SocketAddr,
    /// Datagram assembly buffer (reused to avoid allocations)
    send_buffer: Vec<u8>,
    packets_sent: u64,
    bytes_sent: u64,
}

impl UdpTransmitter {
    pub fn connect(destination: SocketAddr) -> Result<Self, NetworkError> {
        let bind_addr: SocketAddr = if destination.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr)
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        socket
            .connect(destination)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        Ok(Self {
            socket,
            destination,
            send_buffer: Vec::with_capacity(HEADER_LEN + MAX_PAYLOAD_LEN),
            packets_sent: 0,
            bytes_sent: 0,
        })
    }

    /// Frame and send one encoded payload.
    pub fn send_frame(
        &mut self,
        sequence: u32,
        timestamp_ms: u32,
        payload: &Bytes,
    ) -> Result<(), NetworkError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(NetworkError::PacketTooLarge(payload.len() + HEADER_LEN));
        }

        self.send_buffer.clear();
        self.send_buffer
            .extend_from_slice(&encode_header(sequence, timestamp_ms));
        self.send_buffer.extend_from_slice(payload);

        self.socket
            .send(&self.send_buffer)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        self.packets_sent += 1;
        self.bytes_sent += self.send_buffer.len() as u64;
        Ok(())
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_header;

    #[test]
    fn test_resolve_destination_rejects_bad_input() {
        assert!(resolve_destination("", 5555).is_err());
        assert!(resolve_destination("127.0.0.1", 0).is_err());
        assert!(resolve_destination("definitely-not-a-real-host.invalid", 5555).is_err());
    }

    #[test]
    fn test_resolve_destination_accepts_literal_ip() {
        let addr = resolve_destination("127.0.0.1", 5555).unwrap();
        assert_eq!(addr.port(), 5555);
    }

    #[test]
    fn test_send_frame_reaches_receiver() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = receiver.local_addr().unwrap();

        let mut tx = UdpTransmitter::connect(dest).unwrap();
        tx.send_frame(7, 1234, &Bytes::from_static(b"payload"))
            .unwrap();

        let mut buf = [0u8; 64];
        let len = receiver.recv(&mut buf).unwrap();
        assert_eq!(len, HEADER_LEN + 7);
        assert_eq!(decode_header(&buf[..len]).unwrap(), (7, 1234));
        assert_eq!(&buf[HEADER_LEN..len], b"payload");
        assert_eq!(tx.packets_sent(), 1);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut tx = UdpTransmitter::connect(receiver.local_addr().unwrap()).unwrap();
        let huge = Bytes::from(vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(
            tx.send_frame(0, 0, &huge),
            Err(NetworkError::PacketTooLarge(_))
        ));
    }
}
