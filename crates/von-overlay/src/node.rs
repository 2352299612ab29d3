//! Neighbor records exchanged between peers.
//!
//! A [`Node`] is always passed around by value: peers send snapshot copies
//! and never hold references into each other's tables.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use von_geometry::Position;
use von_transport::{PeerId, ID_UNASSIGNED};

/// Logical update time (unix millis).
pub type Timestamp = u64;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or_default()
}

/// Area of interest: a circle in the plane.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Aoi {
    /// Center of the circle
    pub center: Position,
    /// Radius; zero means no interest
    pub radius: f64,
}

impl Aoi {
    /// Create a new AOI.
    pub const fn new(center: Position, radius: f64) -> Self {
        Self { center, radius }
    }

    /// Finite center and non-negative radius.
    pub fn is_valid(&self) -> bool {
        self.center.is_finite() && self.radius.is_finite() && self.radius >= 0.0
    }
}

impl std::fmt::Display for Aoi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} r={}", self.center, self.radius)
    }
}

/// Where a peer can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Peer id
    pub id: PeerId,
    /// Transport address
    pub addr: SocketAddr,
    /// Local time this endpoint was last heard from (unix millis)
    #[serde(skip)]
    pub last_accessed: Timestamp,
}

impl Endpoint {
    /// Create an endpoint, never accessed.
    pub const fn new(id: PeerId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_accessed: 0,
        }
    }
}

/// A neighbor record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Peer id
    pub id: PeerId,
    /// Contact information
    pub endpoint: Endpoint,
    /// Current area of interest
    pub aoi: Aoi,
    /// Logical time of the last change
    pub time: Timestamp,
    /// Opaque application data
    pub meta: Option<Vec<u8>>,
}

impl Node {
    /// Create a node record.
    pub fn new(id: PeerId, addr: SocketAddr, aoi: Aoi, time: Timestamp) -> Self {
        Self {
            id,
            endpoint: Endpoint::new(id, addr),
            aoi,
            time,
            meta: None,
        }
    }

    /// Node id has been assigned.
    pub fn has_id(&self) -> bool {
        self.id != ID_UNASSIGNED
    }

    /// Copy state from a newer snapshot of the same node.
    ///
    /// Metadata is only replaced when the snapshot carries some.
    pub fn update(&mut self, other: &Node) {
        self.endpoint.addr = other.endpoint.addr;
        self.aoi = other.aoi;
        self.time = other.time;
        if other.meta.is_some() {
            self.meta = other.meta.clone();
        }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} @{} t={}", self.id, self.aoi, self.endpoint.addr, self.time)
    }
}
