//! Instrumentation hooks.
//!
//! A [`PeerObserver`] is injected when the peer is built and is told about
//! traffic and neighbor changes. Every hook has an empty default, so an
//! observer only implements what it cares about. Hooks run inline on the
//! peer's loop and must not block.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use von_transport::PeerId;

use crate::message::MessageType;
use crate::node::Node;

/// Callbacks fired by a peer.
pub trait PeerObserver: Send + Sync {
    /// A packet of `bytes` body bytes went out to `targets` peers.
    fn on_send(&self, _kind: MessageType, _targets: usize, _bytes: usize) {}

    /// A packet arrived.
    fn on_receive(&self, _from: PeerId, _kind: MessageType, _bytes: usize) {}

    /// The peer finished joining.
    fn on_joined(&self, _id: PeerId) {}

    /// A neighbor entered the table.
    fn on_neighbor_inserted(&self, _node: &Node) {}

    /// A neighbor left the table.
    fn on_neighbor_removed(&self, _id: PeerId) {}

    /// A NODE list was processed; `accepted` entries were new or newer.
    fn on_node_list(&self, _received: usize, _accepted: usize) {}

    /// Application data arrived from a neighbor.
    fn on_data(&self, _from: PeerId, _payload: &[u8]) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PeerObserver for NoopObserver {}

/// Per-type traffic counters.
///
/// Share it with `Arc` between the peer and whoever reports on it.
#[derive(Debug, Default)]
pub struct TrafficStats {
    sent_packets: [AtomicU64; MessageType::COUNT],
    sent_bytes: [AtomicU64; MessageType::COUNT],
    recv_packets: [AtomicU64; MessageType::COUNT],
    recv_bytes: [AtomicU64; MessageType::COUNT],
    node_received: AtomicU64,
    node_accepted: AtomicU64,
}

/// Counters for one message type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeCounters {
    /// Packets sent (one per target)
    pub sent_packets: u64,
    /// Body bytes sent (counted per target)
    pub sent_bytes: u64,
    /// Packets received
    pub recv_packets: u64,
    /// Body bytes received
    pub recv_bytes: u64,
}

/// Point-in-time copy of [`TrafficStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrafficSnapshot {
    /// Counters by message type name
    pub by_type: Vec<(&'static str, TypeCounters)>,
    /// NODE entries received
    pub node_received: u64,
    /// NODE entries accepted as new information
    pub node_accepted: u64,
}

impl TrafficSnapshot {
    /// Counters for one type.
    pub fn get(&self, kind: MessageType) -> TypeCounters {
        self.by_type
            .iter()
            .find(|(name, _)| *name == kind.as_str())
            .map(|(_, c)| *c)
            .unwrap_or_default()
    }
}

impl TrafficStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> TrafficSnapshot {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        let by_type = MessageType::ALL
            .iter()
            .map(|&kind| {
                let i = kind as usize;
                (
                    kind.as_str(),
                    TypeCounters {
                        sent_packets: load(&self.sent_packets[i]),
                        sent_bytes: load(&self.sent_bytes[i]),
                        recv_packets: load(&self.recv_packets[i]),
                        recv_bytes: load(&self.recv_bytes[i]),
                    },
                )
            })
            .collect();

        TrafficSnapshot {
            by_type,
            node_received: load(&self.node_received),
            node_accepted: load(&self.node_accepted),
        }
    }
}

impl PeerObserver for TrafficStats {
    fn on_send(&self, kind: MessageType, targets: usize, bytes: usize) {
        let i = kind as usize;
        self.sent_packets[i].fetch_add(targets as u64, Ordering::Relaxed);
        self.sent_bytes[i].fetch_add((bytes * targets) as u64, Ordering::Relaxed);
    }

    fn on_receive(&self, _from: PeerId, kind: MessageType, bytes: usize) {
        let i = kind as usize;
        self.recv_packets[i].fetch_add(1, Ordering::Relaxed);
        self.recv_bytes[i].fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn on_node_list(&self, received: usize, accepted: usize) {
        self.node_received.fetch_add(received as u64, Ordering::Relaxed);
        self.node_accepted.fetch_add(accepted as u64, Ordering::Relaxed);
    }
}
