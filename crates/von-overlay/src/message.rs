//! Wire messages of the overlay protocol.
//!
//! Every packet body is one bincode-encoded [`Message`]. The packet's
//! `msg_type` byte repeats the [`MessageType`] of the body so dispatchers
//! and statistics can classify traffic without decoding it.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use von_geometry::Position;
use von_transport::PeerId;

use crate::node::{Node, Timestamp};
use crate::{Error, Result};

/// Message type catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// ID handshake with the gateway
    Ping = 0,
    /// Nearest-acceptor routing of an inner request
    Query = 1,
    /// Join request, routed as a query
    Join = 2,
    /// Batch of neighbor records
    Node = 3,
    /// Mutual-awareness handshake
    Hello = 4,
    /// Handshake response
    HelloR = 5,
    /// Enclosing-neighbor cross-check
    En = 6,
    /// Center update to regular neighbors
    Move = 7,
    /// Full AOI update to regular neighbors
    MoveF = 8,
    /// Center update to boundary neighbors
    MoveB = 9,
    /// Full AOI update to boundary neighbors
    MoveFB = 10,
    /// Disconnect notice
    Bye = 11,
    /// Application payload between neighbors
    Data = 12,
}

impl MessageType {
    /// Number of message types
    pub const COUNT: usize = 13;

    /// Every message type, in wire order.
    pub const ALL: [MessageType; Self::COUNT] = [
        Self::Ping,
        Self::Query,
        Self::Join,
        Self::Node,
        Self::Hello,
        Self::HelloR,
        Self::En,
        Self::Move,
        Self::MoveF,
        Self::MoveB,
        Self::MoveFB,
        Self::Bye,
        Self::Data,
    ];

    /// Decode a wire byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    /// Short name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Query => "QUERY",
            Self::Join => "JOIN",
            Self::Node => "NODE",
            Self::Hello => "HELLO",
            Self::HelloR => "HELLO_R",
            Self::En => "EN",
            Self::Move => "MOVE",
            Self::MoveF => "MOVE_F",
            Self::MoveB => "MOVE_B",
            Self::MoveFB => "MOVE_FB",
            Self::Bye => "BYE",
            Self::Data => "DATA",
        }
    }

    /// One of the four MOVE variants.
    pub fn is_move(self) -> bool {
        matches!(self, Self::Move | Self::MoveF | Self::MoveB | Self::MoveFB)
    }

    /// MOVE variant sent to boundary neighbors.
    pub fn is_boundary_move(self) -> bool {
        matches!(self, Self::MoveB | Self::MoveFB)
    }

    /// MOVE variant carrying the radius.
    pub fn is_full_move(self) -> bool {
        matches!(self, Self::MoveF | Self::MoveFB)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position update carried by the MOVE family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveInfo {
    /// New AOI center
    pub center: Position,
    /// New radius, only in the full variants
    pub radius: Option<f64>,
    /// Logical time of the move
    pub time: Timestamp,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Ask the gateway for an id; `addr` is where to send the answer
    PingRequest {
        /// Requester's transport address
        addr: SocketAddr,
    },
    /// Gateway's answer to a [`Message::PingRequest`]
    PingReply {
        /// The id handed out
        assigned: PeerId,
    },
    /// Route `request` to the peer whose region holds `pos`
    Query {
        /// Target position
        pos: Position,
        /// Message handed to the acceptor
        request: Box<Message>,
    },
    /// A joining node looking for its acceptor
    Join(Node),
    /// Neighbor records the receiver may want to know about
    Nodes(Vec<Node>),
    /// Full self record of a newly discovered neighbor
    Hello(Node),
    /// Response to [`Message::Hello`]
    HelloReply {
        /// Responder's current center
        pos: Position,
        /// Responder's application data
        meta: Option<Vec<u8>>,
    },
    /// The receiver's enclosing neighbors, as the sender sees them
    En(Vec<PeerId>),
    /// Center update to a regular neighbor
    Move(MoveInfo),
    /// Full update to a regular neighbor
    MoveF(MoveInfo),
    /// Center update to a boundary neighbor
    MoveB(MoveInfo),
    /// Full update to a boundary neighbor
    MoveFB(MoveInfo),
    /// The sender is dropping the receiver
    Bye,
    /// Application payload
    Data(Vec<u8>),
}

impl Message {
    /// Type of this message.
    pub fn kind(&self) -> MessageType {
        match self {
            Self::PingRequest { .. } | Self::PingReply { .. } => MessageType::Ping,
            Self::Query { .. } => MessageType::Query,
            Self::Join(_) => MessageType::Join,
            Self::Nodes(_) => MessageType::Node,
            Self::Hello(_) => MessageType::Hello,
            Self::HelloReply { .. } => MessageType::HelloR,
            Self::En(_) => MessageType::En,
            Self::Move(_) => MessageType::Move,
            Self::MoveF(_) => MessageType::MoveF,
            Self::MoveB(_) => MessageType::MoveB,
            Self::MoveFB(_) => MessageType::MoveFB,
            Self::Bye => MessageType::Bye,
            Self::Data(_) => MessageType::Data,
        }
    }

    /// Build the MOVE variant for the given recipient class.
    pub fn movement(info: MoveInfo, boundary: bool) -> Self {
        match (info.radius.is_some(), boundary) {
            (false, false) => Self::Move(info),
            (true, false) => Self::MoveF(info),
            (false, true) => Self::MoveB(info),
            (true, true) => Self::MoveFB(info),
        }
    }

    /// Encode as a packet body.
    pub fn encode(&self) -> Result<bytes::Bytes> {
        Ok(bincode::serialize(self)?.into())
    }

    /// Decode a packet body and check it against the packet's type byte.
    pub fn decode(msg_type: u8, body: &[u8]) -> Result<Self> {
        let expected = MessageType::from_u8(msg_type)
            .ok_or_else(|| Error::InvalidMessage(format!("unknown message type {}", msg_type)))?;
        let msg: Message = bincode::deserialize(body)?;
        if msg.kind() != expected {
            return Err(Error::InvalidMessage(format!(
                "{} body in {} packet",
                msg.kind(),
                expected
            )));
        }
        Ok(msg)
    }
}
