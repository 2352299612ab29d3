//! The transport abstraction overlay peers send through
//!
//! A transport delivers packets to numeric peer ids. It keeps its own
//! id → address table, filled by the peer as it learns endpoints, and
//! reports inbound traffic as [`TransportEvent`]s on a channel handed out
//! when the transport is created.
//!
//! Sending never blocks. Failures are returned per target so the caller
//! can treat an unreachable peer exactly like one that said goodbye.

use std::net::SocketAddr;

use thiserror::Error;

use crate::types::{Packet, PeerId, Priority};

/// Errors raised while sending or decoding packets
#[derive(Debug, Error)]
pub enum TransportError {
    /// No address is known for the target id
    #[error("no address known for peer {0}")]
    UnknownTarget(PeerId),

    /// The address is known but nothing is listening there
    #[error("peer unreachable at {0}")]
    Unreachable(SocketAddr),

    /// The transport has been closed
    #[error("transport closed")]
    Closed,

    /// The packet does not fit in one datagram
    #[error("packet too large: {0} bytes")]
    TooLarge(usize),

    /// Wire encoding failed
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that happened on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A packet arrived from `from`
    Packet {
        /// Sender id, as stamped in the packet
        from: PeerId,
        /// The packet itself
        packet: Packet,
    },
    /// A peer became reachable
    Connected(PeerId),
    /// A peer went away
    Disconnected(PeerId),
}

/// Packet delivery to peer ids
pub trait Transport: Send {
    /// My own id
    fn id(&self) -> PeerId;

    /// Set my own id (once assigned by the gateway)
    fn set_id(&mut self, id: PeerId);

    /// Address other peers reach me at
    fn local_addr(&self) -> SocketAddr;

    /// Remember where `id` can be reached
    fn store_mapping(&mut self, id: PeerId, addr: SocketAddr);

    /// Look up the address of `id`
    fn address_of(&self, id: PeerId) -> Option<SocketAddr>;

    /// Deliver a packet to one target
    fn send_to(&mut self, target: PeerId, packet: &Packet) -> Result<(), TransportError>;

    /// Forget a peer. Returns `false` if it was not known.
    fn disconnect(&mut self, id: PeerId) -> bool;

    /// Stop sending and receiving
    fn close(&mut self);

    /// Deliver a packet to each of its targets.
    ///
    /// The source id is stamped before sending. Returns the targets that
    /// could not be reached.
    fn send_pack(&mut self, mut packet: Packet) -> Vec<(PeerId, TransportError)> {
        packet.src = self.id();
        let mut failed = Vec::new();
        for &target in &packet.targets {
            if let Err(e) = self.send_to(target, &packet) {
                tracing::debug!("send to {} failed: {}", target, e);
                failed.push((target, e));
            }
        }
        failed
    }

    /// Build and send a single-target packet
    fn send_message(
        &mut self,
        target: PeerId,
        msg_type: u8,
        body: bytes::Bytes,
        priority: Priority,
        reliable: bool,
    ) -> Result<(), TransportError> {
        let mut packet = Packet::to(target, msg_type, body, priority);
        packet.reliable = reliable;
        match self.send_pack(packet).pop() {
            Some((_, e)) => Err(e),
            None => Ok(()),
        }
    }
}
