//! VON Transport - packet delivery to numeric peer ids
//!
//! This crate provides:
//! - The [`Transport`] trait overlay peers hold and send through
//! - [`Packet`], the logical `{type, body, priority, targets, src}` unit
//! - [`UdpTransport`], a tokio UDP adapter with socket2 buffer tuning
//! - [`MemoryNetwork`], an in-process switchboard for simulations
//!
//! Inbound traffic is never pushed into the peer directly: every transport
//! hands out an unbounded receiver of [`TransportEvent`]s, and whoever owns
//! the peer drains it.
//!
//! # Example
//!
//! ```rust,ignore
//! use von_transport::{UdpConfig, UdpTransport, ID_UNASSIGNED};
//!
//! let config = UdpConfig {
//!     bind: "0.0.0.0:3737".parse()?,
//!     ..Default::default()
//! };
//! let (transport, events) = UdpTransport::bind(config, ID_UNASSIGNED).await?;
//! ```

pub mod memory;
pub mod transport;
pub mod types;
pub mod udp;

// Re-export main types at crate root
pub use memory::{MemoryNetwork, MemoryTransport};
pub use transport::{Transport, TransportError, TransportEvent};
pub use types::{Packet, PeerId, Priority, ID_GATEWAY, ID_UNASSIGNED, MAX_DATAGRAM};
pub use udp::{UdpConfig, UdpTransport};

/// Default UDP port for overlay peers
pub const DEFAULT_PORT: u16 = 3737;
