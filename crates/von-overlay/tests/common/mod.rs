//! Deterministic in-process overlay simulation.
//!
//! Peers share one [`MemoryNetwork`]; [`Sim::run`] delivers queued packets
//! round by round until the network is quiet.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedReceiver;
use von_geometry::Position;
use von_overlay::{Aoi, Message, MessageType, Node, Peer, PeerConfig, PeerObserver};
use von_transport::{MemoryNetwork, MemoryTransport, PeerId, TransportEvent, ID_UNASSIGNED};

/// Upper bound on delivery rounds before a test is declared divergent
const MAX_ROUNDS: usize = 10_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Observer that keeps everything it sees.
#[derive(Debug, Default)]
pub struct Recorder {
    sent: Mutex<Vec<(MessageType, usize)>>,
    received: Mutex<Vec<(PeerId, MessageType)>>,
    data: Mutex<Vec<(PeerId, Vec<u8>)>>,
    removed: Mutex<Vec<PeerId>>,
}

impl Recorder {
    pub fn sent_kinds(&self) -> Vec<MessageType> {
        self.sent.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }

    pub fn received_from(&self, from: PeerId, kind: MessageType) -> usize {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|(f, k)| *f == from && *k == kind)
            .count()
    }

    pub fn data(&self) -> Vec<(PeerId, Vec<u8>)> {
        self.data.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<PeerId> {
        self.removed.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
        self.received.lock().unwrap().clear();
        self.data.lock().unwrap().clear();
        self.removed.lock().unwrap().clear();
    }
}

impl PeerObserver for Recorder {
    fn on_send(&self, kind: MessageType, targets: usize, _bytes: usize) {
        self.sent.lock().unwrap().push((kind, targets));
    }

    fn on_receive(&self, from: PeerId, kind: MessageType, _bytes: usize) {
        self.received.lock().unwrap().push((from, kind));
    }

    fn on_neighbor_removed(&self, id: PeerId) {
        self.removed.lock().unwrap().push(id);
    }

    fn on_data(&self, from: PeerId, payload: &[u8]) {
        self.data.lock().unwrap().push((from, payload.to_vec()));
    }
}

pub struct Sim {
    pub net: MemoryNetwork,
    pub peers: Vec<Peer<MemoryTransport>>,
    pub recorders: Vec<Arc<Recorder>>,
    inboxes: Vec<UnboundedReceiver<TransportEvent>>,
    config: PeerConfig,
}

impl Sim {
    pub fn new() -> Self {
        Self::with_config(PeerConfig {
            rng_seed: Some(7),
            ..PeerConfig::default()
        })
    }

    pub fn with_config(config: PeerConfig) -> Self {
        init_tracing();
        Self {
            net: MemoryNetwork::new(),
            peers: Vec::new(),
            recorders: Vec::new(),
            inboxes: Vec::new(),
            config,
        }
    }

    /// Bind a new, unjoined peer and return its index.
    pub fn add_peer(&mut self) -> usize {
        let (transport, inbox) = self
            .net
            .bind("127.0.0.1:0".parse().unwrap(), ID_UNASSIGNED)
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let peer = Peer::with_observer(transport, self.config.clone(), recorder.clone());
        self.peers.push(peer);
        self.recorders.push(recorder);
        self.inboxes.push(inbox);
        self.peers.len() - 1
    }

    /// Address of peer 0, the gateway.
    pub fn gateway_addr(&self) -> SocketAddr {
        self.peers[0].local_addr()
    }

    /// Add a peer and join it at `(x, y)`; the first one becomes the gateway.
    pub fn spawn(&mut self, x: f64, y: f64, radius: f64) -> usize {
        let idx = self.add_peer();
        let gateway = if idx == 0 {
            self.peers[0].local_addr()
        } else {
            self.gateway_addr()
        };
        self.peers[idx].join(gateway, Aoi::new(Position::new(x, y), radius));
        self.run();
        assert!(self.peers[idx].is_joined(), "peer {} did not join", idx);
        idx
    }

    pub fn id(&self, idx: usize) -> PeerId {
        self.peers[idx].id()
    }

    pub fn index_of(&self, id: PeerId) -> usize {
        self.peers.iter().position(|p| p.id() == id).unwrap()
    }

    /// Deliver everything until no packet is in flight.
    pub fn run(&mut self) -> usize {
        let mut total = 0;
        for _ in 0..MAX_ROUNDS {
            let mut delivered = 0;
            for (peer, inbox) in self.peers.iter_mut().zip(self.inboxes.iter_mut()) {
                while let Ok(event) = inbox.try_recv() {
                    peer.handle_event(event);
                    delivered += 1;
                }
            }
            if delivered == 0 {
                return total;
            }
            total += delivered;
        }
        panic!("network did not settle after {} rounds", MAX_ROUNDS);
    }

    /// Take what is queued for a peer without handling it.
    pub fn drain(&mut self, idx: usize) -> Vec<(PeerId, Message)> {
        let mut out = Vec::new();
        while let Ok(event) = self.inboxes[idx].try_recv() {
            if let TransportEvent::Packet { from, packet } = event {
                let msg = Message::decode(packet.msg_type, &packet.body).unwrap();
                out.push((from, msg));
            }
        }
        out
    }

    /// Neighbor ids of a peer, self excluded.
    pub fn neighbor_ids(&self, idx: usize) -> Vec<PeerId> {
        let me = self.id(idx);
        self.peers[idx]
            .list()
            .iter()
            .map(|n: &Node| n.id)
            .filter(|&id| id != me)
            .collect()
    }
}
