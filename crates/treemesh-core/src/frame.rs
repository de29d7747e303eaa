//! Wire frame and header model
//!
//! This module defines the fixed-size transmission unit exchanged with the
//! radio driver. Every frame on a network is exactly [`FRAME_LEN`] bytes:
//! a 12-byte header followed by a small inline payload. The header carries
//! hop-by-hop addressing (`from`, `prev_hop`, `to`), a diagnostic sequence
//! id, the originator's identity plus hop weight, and a one-byte type tag.
//!
//! ## Frame Structure
//!
//! ```text
//! ┌──────────┬───────────┬─────────┬────────┬───────────┬──────────┬───────┬──────────────┐
//! │ from(2B) │ prev_hop  │ to (2B) │ id(2B) │ source ip │ source   │ type  │ payload      │
//! │          │   (2B)    │         │        │   (2B)    │ weight   │ (1B)  │ (20B inline) │
//! └──────────┴───────────┴─────────┴────────┴───────────┴──────────┴───────┴──────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::{MeshError, MeshResult};

/// Total on-air frame size; every node on a network must agree on this.
pub const FRAME_LEN: usize = 32;

/// Header size in bytes.
pub const HEADER_LEN: usize = 12;

/// Inline payload capacity per frame.
pub const PAYLOAD_LEN: usize = FRAME_LEN - HEADER_LEN;

/// Sentinel weight meaning "no route to the master".
pub const MAX_WEIGHT: u8 = 0xFF;

/// Logical node address - 16-bit, administrator-assigned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress(u16);

impl NodeAddress {
    /// Reserved address of the master (root) node.
    pub const MASTER: NodeAddress = NodeAddress(0x0000);

    /// Reserved broadcast recipient address.
    pub const BROADCAST: NodeAddress = NodeAddress(0x7918);

    /// Create an address from its raw 16-bit value
    pub fn new(raw: u16) -> Self {
        NodeAddress(raw)
    }

    /// Get the raw 16-bit value
    pub fn raw(&self) -> u16 {
        self.0
    }

    /// Check if this is the master's reserved address
    pub fn is_master(&self) -> bool {
        *self == Self::MASTER
    }

    /// Check if this is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({:#06x})", self.0)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// A node's identity: its logical address and current hop-count estimate
/// to the master. Weight 0 is the master itself; [`MAX_WEIGHT`] means the
/// node has no route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub ip: NodeAddress,
    pub weight: u8,
}

impl NodeIdentity {
    /// Identity of the master node (weight 0 by definition)
    pub fn master() -> Self {
        Self {
            ip: NodeAddress::MASTER,
            weight: 0,
        }
    }

    /// An unjoined identity with the given address
    pub fn unjoined(ip: NodeAddress) -> Self {
        Self {
            ip,
            weight: MAX_WEIGHT,
        }
    }
}

/// Message type tags. One byte on the wire, low 7 bits significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Broadcast handshake announcing a node seeking a parent
    Join,
    /// Unicast reply to a Join, carrying identity/weight/network time
    Welcome,
    /// Application data one hop from the master
    Data,
    /// Relayed application data not yet one hop from the master
    Forward,
    /// Lightweight post-join propagation of an improved path
    WeightUpdate,
    /// Accepted on the wire but never acted upon
    Unknown(u8),
}

impl MessageType {
    /// Decode from the wire tag (low 7 bits significant)
    pub fn from_byte(byte: u8) -> Self {
        match byte & 0x7F {
            b'J' => MessageType::Join,
            b'W' => MessageType::Welcome,
            b'D' => MessageType::Data,
            b'F' => MessageType::Forward,
            b'U' => MessageType::WeightUpdate,
            other => MessageType::Unknown(other),
        }
    }

    /// Encode to the wire tag
    pub fn as_byte(&self) -> u8 {
        match self {
            MessageType::Join => b'J',
            MessageType::Welcome => b'W',
            MessageType::Data => b'D',
            MessageType::Forward => b'F',
            MessageType::WeightUpdate => b'U',
            MessageType::Unknown(tag) => *tag,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Unknown(tag) => write!(f, "?{:#04x}", tag),
            other => write!(f, "{}", other.as_byte() as char),
        }
    }
}

// Sequence ids are diagnostic-only, so one process-wide counter is fine
// even with several simulated nodes in a test process.
static NEXT_ID: AtomicU16 = AtomicU16::new(1);

/// Header sent with each message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Logical address of the sending hop
    pub from: NodeAddress,
    /// Immediate sender of the previous hop when relayed
    pub prev_hop: NodeAddress,
    /// Logical address this frame is addressed to
    pub to: NodeAddress,
    /// Sequential message id, wraps at the 16-bit boundary
    pub id: u16,
    /// Originator identity plus hop weight for control messages;
    /// original sender plus forward hop count for relayed data
    pub source: NodeIdentity,
    /// Message type tag
    pub kind: MessageType,
}

impl Header {
    /// Create a header for an outbound message, assigning the next
    /// sequence id. `prev_hop` starts equal to `from`; forwarding
    /// rewrites it to the immediate sender.
    pub fn new(from: NodeAddress, to: NodeAddress, kind: MessageType, source: NodeIdentity) -> Self {
        Self {
            from,
            prev_hop: from,
            to,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            source,
            kind,
        }
    }

    /// Serialize into the first [`HEADER_LEN`] bytes of `buf`
    fn write_to(&self, buf: &mut [u8; FRAME_LEN]) {
        buf[0..2].copy_from_slice(&self.from.raw().to_le_bytes());
        buf[2..4].copy_from_slice(&self.prev_hop.raw().to_le_bytes());
        buf[4..6].copy_from_slice(&self.to.raw().to_le_bytes());
        buf[6..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..10].copy_from_slice(&self.source.ip.raw().to_le_bytes());
        buf[10] = self.source.weight;
        buf[11] = self.kind.as_byte();
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            from: NodeAddress::new(u16::from_le_bytes([buf[0], buf[1]])),
            prev_hop: NodeAddress::new(u16::from_le_bytes([buf[2], buf[3]])),
            to: NodeAddress::new(u16::from_le_bytes([buf[4], buf[5]])),
            id: u16::from_le_bytes([buf[6], buf[7]]),
            source: NodeIdentity {
                ip: NodeAddress::new(u16::from_le_bytes([buf[8], buf[9]])),
                weight: buf[10],
            },
            kind: MessageType::from_byte(buf[11]),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "msg {:04x} from {} to {} type {} src {} w{}",
            self.id, self.from, self.to, self.kind, self.source.ip, self.source.weight
        )
    }
}

/// A complete frame: header plus inline payload, total [`FRAME_LEN`] bytes.
/// This is the unit exchanged with the radio driver and is never split
/// across transmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub header: Header,
    pub payload: [u8; PAYLOAD_LEN],
}

impl Frame {
    /// Create a frame with an empty payload
    pub fn new(header: Header) -> Self {
        Self {
            header,
            payload: [0u8; PAYLOAD_LEN],
        }
    }

    /// Create a frame carrying `payload`, truncated to [`PAYLOAD_LEN`]
    pub fn with_payload(header: Header, payload: &[u8]) -> Self {
        let mut frame = Self::new(header);
        let len = payload.len().min(PAYLOAD_LEN);
        frame.payload[..len].copy_from_slice(&payload[..len]);
        frame
    }

    /// Store a millisecond timestamp in the leading payload bytes.
    /// Used by Welcome messages to carry the replier's network time.
    pub fn set_time_ms(&mut self, time_ms: u64) {
        self.payload[0..8].copy_from_slice(&time_ms.to_le_bytes());
    }

    /// Read the millisecond timestamp from the leading payload bytes
    pub fn time_ms(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.payload[0..8]);
        u64::from_le_bytes(bytes)
    }

    /// Serialize to the fixed on-air representation
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        self.header.write_to(&mut buf);
        buf[HEADER_LEN..].copy_from_slice(&self.payload);
        buf
    }

    /// Deserialize from on-air bytes
    pub fn from_bytes(bytes: &[u8]) -> MeshResult<Self> {
        if bytes.len() < FRAME_LEN {
            return Err(MeshError::ShortFrame(bytes.len()));
        }
        let header = Header::read_from(bytes);
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&bytes[HEADER_LEN..FRAME_LEN]);
        Ok(Self { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_address() {
        let addr = NodeAddress::new(0x0003);
        assert!(!addr.is_master());
        assert!(!addr.is_broadcast());
        assert!(NodeAddress::MASTER.is_master());
        assert!(NodeAddress::BROADCAST.is_broadcast());
    }

    #[test]
    fn test_message_type_tags() {
        assert_eq!(MessageType::from_byte(b'J'), MessageType::Join);
        assert_eq!(MessageType::from_byte(b'W'), MessageType::Welcome);
        assert_eq!(MessageType::from_byte(b'D'), MessageType::Data);
        assert_eq!(MessageType::from_byte(b'F'), MessageType::Forward);
        assert_eq!(MessageType::from_byte(b'U'), MessageType::WeightUpdate);
        // High bit is insignificant on the wire
        assert_eq!(MessageType::from_byte(b'J' | 0x80), MessageType::Join);
        assert_eq!(MessageType::from_byte(b'X'), MessageType::Unknown(b'X'));
        assert_eq!(MessageType::Unknown(b'X').as_byte(), b'X');
    }

    #[test]
    fn test_header_ids_monotonic() {
        let src = NodeIdentity::unjoined(NodeAddress::new(5));
        let a = Header::new(NodeAddress::new(5), NodeAddress::BROADCAST, MessageType::Join, src);
        let b = Header::new(NodeAddress::new(5), NodeAddress::BROADCAST, MessageType::Join, src);
        assert_eq!(b.id, a.id.wrapping_add(1));
    }

    #[test]
    fn test_frame_roundtrip() {
        let src = NodeIdentity {
            ip: NodeAddress::new(0x0042),
            weight: 3,
        };
        let header = Header::new(
            NodeAddress::new(0x0042),
            NodeAddress::MASTER,
            MessageType::Data,
            src,
        );
        let frame = Frame::with_payload(header, b"sensor reading");

        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), FRAME_LEN);

        let recovered = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(recovered, frame);
        assert_eq!(recovered.header.kind, MessageType::Data);
        assert_eq!(&recovered.payload[..14], b"sensor reading");
    }

    #[test]
    fn test_frame_too_short() {
        let err = Frame::from_bytes(&[0u8; 10]).unwrap_err();
        assert_eq!(err, MeshError::ShortFrame(10));
    }

    #[test]
    fn test_welcome_time_payload() {
        let header = Header::new(
            NodeAddress::MASTER,
            NodeAddress::new(1),
            MessageType::Welcome,
            NodeIdentity::master(),
        );
        let mut frame = Frame::new(header);
        frame.set_time_ms(123_456);
        assert_eq!(frame.time_ms(), 123_456);

        let recovered = Frame::from_bytes(&frame.to_bytes()).unwrap();
        assert_eq!(recovered.time_ms(), 123_456);
    }

    #[test]
    fn test_payload_truncation() {
        let header = Header::new(
            NodeAddress::new(1),
            NodeAddress::MASTER,
            MessageType::Data,
            NodeIdentity::unjoined(NodeAddress::new(1)),
        );
        let long = [0xAB; 64];
        let frame = Frame::with_payload(header, &long);
        assert_eq!(frame.payload, [0xAB; PAYLOAD_LEN]);
    }
}
