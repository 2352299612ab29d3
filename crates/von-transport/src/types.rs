//! Core types for VON packet delivery

use serde::{Deserialize, Serialize};

/// Peer identifier
///
/// Positive once assigned. See [`ID_UNASSIGNED`] and [`ID_GATEWAY`].
pub type PeerId = u64;

/// Id of a peer that has not been given one yet
pub const ID_UNASSIGNED: PeerId = 0;

/// Id reserved for the bootstrap gateway
pub const ID_GATEWAY: PeerId = 1;

/// Largest datagram the UDP transport will send or accept
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// Delivery priority, highest first
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Join, move and handshake traffic
    Highest,
    /// Consistency checks
    High,
    /// Neighbor lists
    #[default]
    Normal,
    /// Application data
    Low,
    /// Background traffic
    Lowest,
}

/// A logical packet addressed to one or more peers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Message type, interpreted by the layer above
    pub msg_type: u8,
    /// Delivery priority
    pub priority: Priority,
    /// Sender id (stamped by the transport on send)
    pub src: PeerId,
    /// Recipients
    pub targets: Vec<PeerId>,
    /// Encoded message payload
    pub body: bytes::Bytes,
    /// Whether the sender asked for reliable delivery
    pub reliable: bool,
}

impl Packet {
    /// Create a packet with no targets yet
    pub fn new(msg_type: u8, body: bytes::Bytes, priority: Priority) -> Self {
        Self {
            msg_type,
            priority,
            src: crate::ID_UNASSIGNED,
            targets: Vec::new(),
            body,
            reliable: true,
        }
    }

    /// Create a packet for a single target
    pub fn to(target: PeerId, msg_type: u8, body: bytes::Bytes, priority: Priority) -> Self {
        Self::new(msg_type, body, priority).with_targets(vec![target])
    }

    /// Replace the target list
    pub fn with_targets(mut self, targets: Vec<PeerId>) -> Self {
        self.targets = targets;
        self
    }

    /// Mark the packet as best-effort
    pub fn unreliable(mut self) -> Self {
        self.reliable = false;
        self
    }

    /// Serialize to bytes (one datagram).
    pub fn to_bytes(&self) -> Result<Vec<u8>, crate::TransportError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, crate::TransportError> {
        Ok(bincode::deserialize(bytes)?)
    }
}
