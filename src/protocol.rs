//! UDP wire format for the audio stream
//!
//! Each datagram is an 8-byte big-endian header followed by one compressed
//! Opus frame: `[sequence: u32][timestamp_ms: u32][payload...]`. The
//! timestamp is the sender's capture clock in milliseconds and is
//! informational only; sequence numbers wrap at the u32 boundary.

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::MAX_PACKET_SIZE;
use crate::error::NetworkError;

/// Length of the wire header in bytes
pub const HEADER_LEN: usize = 8;

/// Maximum payload that fits a single datagram alongside the header
pub const MAX_PAYLOAD_LEN: usize = MAX_PACKET_SIZE - HEADER_LEN;

/// Encode the packet header into a fixed 8-byte array.
pub fn encode_header(sequence: u32, timestamp_ms: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&sequence.to_be_bytes());
    header[4..].copy_from_slice(&timestamp_ms.to_be_bytes());
    header
}

/// Decode the packet header, failing if fewer than 8 bytes are available.
pub fn decode_header(bytes: &[u8]) -> Result<(u32, u32), NetworkError> {
    if bytes.len() < HEADER_LEN {
        return Err(NetworkError::MalformedPacket);
    }
    let sequence = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let timestamp_ms = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    Ok((sequence, timestamp_ms))
}

/// A single datagram of the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePacket {
    pub sequence: u32,
    pub timestamp_ms: u32,
    pub payload: Bytes,
}

impl WirePacket {
    /// Serialize header and payload into one datagram buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_slice(&encode_header(self.sequence, self.timestamp_ms));
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a received datagram.
    ///
    /// A datagram that is all header and no payload carries no audio and is
    /// rejected as malformed, same as a truncated header.
    pub fn parse(datagram: &[u8]) -> Result<Self, NetworkError> {
        let (sequence, timestamp_ms) = decode_header(datagram)?;
        if datagram.len() <= HEADER_LEN {
            return Err(NetworkError::MalformedPacket);
        }
        Ok(Self {
            sequence,
            timestamp_ms,
            payload: Bytes::copy_from_slice(&datagram[HEADER_LEN..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        for (seq, ts) in [(0u32, 0u32), (1, 2), (u32::MAX, u32::MAX), (u32::MAX, 0)] {
            let header = encode_header(seq, ts);
            assert_eq!(decode_header(&header).unwrap(), (seq, ts));
        }
    }

    #[test]
    fn test_header_is_big_endian() {
        let header = encode_header(0x0102_0304, 0x0506_0708);
        assert_eq!(header, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_short_header_rejected() {
        assert!(matches!(
            decode_header(&[0u8; 7]),
            Err(NetworkError::MalformedPacket)
        ));
    }

    #[test]
    fn test_packet_roundtrip() {
        let packet = WirePacket {
            sequence: 42,
            timestamp_ms: 1234,
            payload: Bytes::from_static(b"opus"),
        };
        let wire = packet.encode();
        assert_eq!(WirePacket::parse(&wire).unwrap(), packet);
    }

    #[test]
    fn test_empty_payload_is_malformed() {
        let wire = encode_header(7, 7);
        assert!(matches!(
            WirePacket::parse(&wire),
            Err(NetworkError::MalformedPacket)
        ));
    }
}
