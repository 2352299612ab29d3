//! VON: a Voronoi-based spatial overlay network
//!
//! Every peer has a position and a circular area of interest (AOI) in a
//! shared 2-D world. Each peer keeps the Voronoi diagram of the nodes it
//! knows, and uses it to decide which nodes are worth keeping as neighbors:
//!
//! - **AOI neighbors** have a site inside my AOI (plus a buffer)
//! - **Enclosing neighbors** own a cell adjacent to mine
//! - **Boundary neighbors** own a cell cut by my AOI circle
//!
//! Enclosing neighbors are always kept, so the overlay stays connected
//! no matter how small the AOIs are. When a peer moves, its boundary
//! neighbors tell it about nodes that just entered its view, and neighbors
//! that stay out of view for a grace period are dropped.
//!
//! # Layout
//!
//! - [`Peer`] is the synchronous state machine, driven by transport events
//!   and a periodic tick
//! - [`PeerService`] runs a peer on a tokio task and hands out a
//!   cloneable [`PeerHandle`] for async callers
//! - [`Message`] is the wire protocol, bincode-encoded in packet bodies
//!
//! # Example
//!
//! ```
//! use von_geometry::Position;
//! use von_overlay::{Aoi, Peer, PeerConfig};
//! use von_transport::{MemoryNetwork, ID_UNASSIGNED};
//!
//! let net = MemoryNetwork::new();
//! let (transport, _events) = net.bind("127.0.0.1:0".parse().unwrap(), ID_UNASSIGNED).unwrap();
//! let mut gateway = Peer::new(transport, PeerConfig::default());
//!
//! let own = gateway.local_addr();
//! gateway.join(own, Aoi::new(Position::new(100.0, 100.0), 50.0));
//! assert!(gateway.is_joined());
//! assert_eq!(gateway.id(), von_transport::ID_GATEWAY);
//! ```

mod config;
mod error;
mod message;
mod neighbors;
mod node;
mod observer;
mod peer;
mod service;

pub use config::PeerConfig;
pub use error::{Error, Result};
pub use message::{Message, MessageType, MoveInfo};
pub use neighbors::{NeighborState, NeighborTable, UpdateStatus};
pub use node::{now_millis, Aoi, Endpoint, Node, Timestamp};
pub use observer::{NoopObserver, PeerObserver, TrafficSnapshot, TrafficStats, TypeCounters};
pub use peer::{Peer, PeerState};
pub use service::{PeerHandle, PeerService, PeerStatus};
