//! Error types for von-overlay.

use thiserror::Error;
use von_transport::{PeerId, TransportError};

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to applications.
///
/// Protocol-level problems (stale updates, unknown senders) are logged and
/// dropped inside the peer; only caller mistakes and transport failures
/// end up here.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport could not deliver a packet.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A packet body could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// A decoded message did not match its packet header.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The operation needs a joined peer.
    #[error("invalid peer state: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    /// The target is not a current neighbor.
    #[error("peer {0} is not a neighbor")]
    NotNeighbor(PeerId),

    /// The peer service has stopped.
    #[error("peer service closed")]
    ServiceClosed,
}
