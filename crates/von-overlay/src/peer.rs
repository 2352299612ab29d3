//! The overlay peer state machine.
//!
//! A [`Peer`] owns its neighbor table and its Voronoi engine and keeps the
//! two in lockstep: every node in the table has exactly one site in the
//! engine. It talks to the network only through the [`Transport`] it was
//! built with, and is driven from outside by three kinds of input:
//!
//! - application calls (`join`, `move_to`, `leave`, ...),
//! - transport events, via [`Peer::handle_event`],
//! - the periodic maintenance tick, via [`Peer::tick`] / [`Peer::tick_at`].
//!
//! Nothing in here blocks or spawns. Every entry point runs to completion
//! and leaves outgoing packets with the transport.
//!
//! # Time
//!
//! Two clocks are involved. Node updates carry wall-clock milliseconds
//! ([`Node::time`]), compared across peers for last-write-wins. Pruning
//! deadlines use a local monotonic clock that only moves forward; tests
//! advance it with [`Peer::tick_at`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};
use von_geometry::{Edge, Position, Voronoi};
use von_transport::{
    Packet, PeerId, Priority, Transport, TransportEvent, ID_GATEWAY, ID_UNASSIGNED,
};

use crate::config::PeerConfig;
use crate::message::{Message, MessageType, MoveInfo};
use crate::neighbors::{NeighborState, NeighborTable, UpdateStatus};
use crate::node::{now_millis, Aoi, Endpoint, Node, Timestamp};
use crate::observer::{NoopObserver, PeerObserver};
use crate::{Error, Result};

/// Lifecycle of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PeerState {
    /// Not part of the overlay
    Absent,
    /// Waiting for an id or for the first neighbor list
    Joining,
    /// Member of the overlay
    Joined,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Joining => "joining",
            Self::Joined => "joined",
        };
        f.write_str(s)
    }
}

/// One participant of the spatial overlay.
pub struct Peer<T: Transport> {
    config: PeerConfig,
    transport: T,
    observer: Arc<dyn PeerObserver>,
    state: PeerState,

    /// Authoritative copy of my own record
    me: Node,
    meta: Option<Vec<u8>>,

    neighbors: NeighborTable,
    voro: Voronoi,

    /// Candidates learned from NODE, contacted in batch
    new_neighbors: BTreeMap<PeerId, Node>,
    /// What each neighbor is believed to know about my other neighbors
    neighbor_states: HashMap<PeerId, HashMap<PeerId, NeighborState>>,
    /// Neighbors that asked for a discovery check (boundary MOVE)
    req_nodes: BTreeSet<PeerId>,
    /// Per-neighbor drop deadline
    time_drop: HashMap<PeerId, Instant>,
    last_prune: Option<Instant>,
    /// Targets whose send failed, handled like a BYE once the current input is done
    pending_disconnects: Vec<PeerId>,

    /// Next id to hand out when acting as gateway
    next_id: Option<PeerId>,
    clock: Instant,
}

impl<T: Transport> std::fmt::Debug for Peer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.me.id)
            .field("state", &self.state)
            .field("aoi", &self.me.aoi)
            .field("neighbors", &self.neighbors.len())
            .finish()
    }
}

impl<T: Transport> Peer<T> {
    /// Create a peer over a transport, without instrumentation.
    pub fn new(transport: T, config: PeerConfig) -> Self {
        Self::with_observer(transport, config, Arc::new(NoopObserver))
    }

    /// Create a peer with an observer.
    pub fn with_observer(transport: T, config: PeerConfig, observer: Arc<dyn PeerObserver>) -> Self {
        let voro = new_voronoi(&config);
        let me = Node::new(transport.id(), transport.local_addr(), Aoi::default(), 0);
        Self {
            config,
            transport,
            observer,
            state: PeerState::Absent,
            me,
            meta: None,
            neighbors: NeighborTable::new(),
            voro,
            new_neighbors: BTreeMap::new(),
            neighbor_states: HashMap::new(),
            req_nodes: BTreeSet::new(),
            time_drop: HashMap::new(),
            last_prune: None,
            pending_disconnects: Vec::new(),
            next_id: None,
            clock: Instant::now(),
        }
    }

    /// Forget everything learned about the overlay.
    fn reset_states(&mut self) {
        self.state = PeerState::Absent;
        self.neighbors.clear();
        self.voro = new_voronoi(&self.config);
        self.new_neighbors.clear();
        self.neighbor_states.clear();
        self.req_nodes.clear();
        self.time_drop.clear();
        self.last_prune = None;
        self.pending_disconnects.clear();
    }

    fn advance_clock(&mut self, now: Instant) {
        if now > self.clock {
            self.clock = now;
        }
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// My id (`ID_UNASSIGNED` until the gateway answered).
    pub fn id(&self) -> PeerId {
        self.transport.id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Whether the join completed.
    pub fn is_joined(&self) -> bool {
        self.state == PeerState::Joined
    }

    /// Whether `id` is in the neighbor table.
    pub fn is_neighbor(&self, id: PeerId) -> bool {
        self.neighbors.contains(id)
    }

    /// A neighbor's record.
    pub fn get_neighbor(&self, id: PeerId) -> Option<&Node> {
        self.neighbors.get(id)
    }

    /// My own record.
    pub fn get_self(&self) -> &Node {
        &self.me
    }

    /// My current AOI.
    pub fn aoi(&self) -> Aoi {
        self.me.aoi
    }

    /// Snapshot of the neighbor table, self included.
    pub fn list(&self) -> Vec<Node> {
        self.neighbors.iter().cloned().collect()
    }

    /// The neighbor table.
    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    /// My enclosing neighbors, as my local diagram sees them.
    pub fn enclosing_neighbors(&self) -> Vec<PeerId> {
        self.voro.get_en(self.me.id, 1)
    }

    /// Edges of my local diagram.
    pub fn edges(&self) -> Vec<Edge> {
        self.voro.edges()
    }

    /// Read access to the geometry engine.
    pub fn voronoi(&self) -> &Voronoi {
        &self.voro
    }

    /// Address other peers reach me at.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Peer configuration.
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// The transport this peer sends through.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Drain the neighbor change log.
    pub fn take_updates(&mut self) -> Vec<(PeerId, UpdateStatus)> {
        self.neighbors.take_updates()
    }

    /// Known peer nearest to `pos`.
    pub fn closest_to(&self, pos: &Position) -> Option<PeerId> {
        self.voro.closest_to(pos)
    }

    /// Whether `pos` lies in my own cell.
    pub fn contains(&self, pos: &Position) -> bool {
        self.voro.contains(self.me.id, pos)
    }

    /// Whether my cell intersects the circle of `aoi`.
    pub fn is_overlapping(&self, aoi: &Aoi) -> bool {
        self.voro
            .region(self.me.id)
            .is_some_and(|cell| cell.intersects_circle(&aoi.center, aoi.radius))
    }

    /// Neighbors whose cells intersect the circle of `aoi`.
    pub fn overlapping_neighbors(&self, aoi: &Aoi) -> Vec<PeerId> {
        self.neighbors
            .ids()
            .filter(|&id| id != self.me.id)
            .filter(|&id| {
                self.voro
                    .region(id)
                    .is_some_and(|cell| cell.intersects_circle(&aoi.center, aoi.radius))
            })
            .collect()
    }

    /// Whether `id` is an enclosing neighbor of `center`.
    pub fn is_enclosing_neighbor(&self, id: PeerId, center: PeerId) -> bool {
        self.voro.is_enclosing(id, center)
    }

    /// Application data attached to my record.
    pub fn get_meta(&self) -> Option<&[u8]> {
        self.meta.as_deref()
    }

    // ---------------------------------------------------------------------
    // Application operations
    // ---------------------------------------------------------------------

    /// Join the overlay through the gateway at `gateway`.
    ///
    /// Without an id, the peer first asks the gateway for one. A peer told
    /// to join through its own address becomes the gateway. Completion is
    /// signalled by [`PeerObserver::on_joined`] and [`Peer::is_joined`].
    pub fn join(&mut self, gateway: SocketAddr, aoi: Aoi) {
        self.advance_clock(Instant::now());

        match self.state {
            PeerState::Joined => {
                warn!("[{}] join(): already joined", self.me.id);
                self.observer.on_joined(self.me.id);
                return;
            }
            PeerState::Joining => {
                warn!("[{}] join(): join already in progress", self.me.id);
                return;
            }
            PeerState::Absent => {}
        }

        if !aoi.is_valid() || !self.voro.bounding_box().contains(&aoi.center) {
            warn!("join(): invalid AOI {}, ignored", aoi);
            return;
        }

        self.transport.store_mapping(ID_GATEWAY, gateway);
        info!("gateway set to {}", gateway);

        self.me.aoi = aoi;
        self.state = PeerState::Joining;

        if self.id() == ID_UNASSIGNED {
            if gateway == self.transport.local_addr() {
                info!("joining through my own address, taking the gateway id");
                self.transport.set_id(ID_GATEWAY);
                self.set_inited();
            } else {
                let addr = self.transport.local_addr();
                self.deliver_to(ID_GATEWAY, &Message::PingRequest { addr }, Priority::Highest);
            }
        } else {
            self.set_inited();
        }

        self.flush_disconnects();
    }

    /// Say goodbye to every neighbor and leave the overlay.
    pub fn leave(&mut self) {
        self.advance_clock(Instant::now());

        if self.state == PeerState::Absent {
            debug!("[{}] leave(): not in the overlay", self.me.id);
            return;
        }

        let targets: Vec<_> = self.neighbors.ids().filter(|&id| id != self.me.id).collect();
        info!("[{}] leaving, notifying {} neighbors", self.me.id, targets.len());

        self.send_bye(targets);
        self.reset_states();
    }

    /// Leave if needed, then close the transport.
    pub fn shut(&mut self) {
        if self.state != PeerState::Absent {
            self.leave();
        }
        self.transport.close();
        self.state = PeerState::Absent;
    }

    /// Move my AOI (or change its radius) and tell the neighbors.
    ///
    /// The update time is `send_time` when given, otherwise the current
    /// wall clock, and always strictly later than the previous one. Returns
    /// the AOI in effect afterwards, unchanged if the request was rejected.
    pub fn move_to(&mut self, aoi: Aoi, send_time: Option<Timestamp>) -> Aoi {
        self.advance_clock(Instant::now());

        if self.state != PeerState::Joined {
            warn!("[{}] move(): not joined yet, ignored", self.me.id);
            return self.me.aoi;
        }
        if !aoi.is_valid() || !self.voro.bounding_box().contains(&aoi.center) {
            warn!("[{}] move(): invalid or out-of-bounds AOI {}, ignored", self.me.id, aoi);
            return self.me.aoi;
        }

        let reshaped = aoi.radius != self.me.aoi.radius;
        if reshaped {
            info!("[{}] AOI radius updated to {}", self.me.id, aoi.radius);
        }

        let time = send_time.unwrap_or_else(now_millis).max(self.me.time + 1);
        let mut moved = self.me.clone();
        moved.aoi = aoi;
        moved.time = time;
        if !self.update_node(&moved) {
            warn!("[{}] move(): could not place myself at {}", self.me.id, aoi.center);
            return self.me.aoi;
        }
        self.me = moved;

        // Boundary neighbors get the variant that triggers discovery
        let boundary: BTreeSet<_> = self
            .voro
            .boundary_sites(&aoi.center, aoi.radius)
            .into_iter()
            .collect();
        let (boundary_list, regular_list): (Vec<PeerId>, Vec<PeerId>) = self
            .neighbors
            .ids()
            .filter(|&id| id != self.me.id)
            .partition(|id| boundary.contains(id));

        let info = MoveInfo {
            center: aoi.center,
            radius: reshaped.then_some(aoi.radius),
            time,
        };
        self.deliver(regular_list, &Message::movement(info, false), Priority::Highest);
        self.deliver(boundary_list, &Message::movement(info, true), Priority::Highest);

        self.flush_disconnects();
        self.me.aoi
    }

    /// Attach application data to my record.
    ///
    /// It travels with HELLO and HELLO_R to newly met neighbors.
    pub fn put(&mut self, meta: Vec<u8>) {
        self.meta = Some(meta.clone());
        self.me.meta = Some(meta);
        let me = self.me.clone();
        self.neighbors.update(&me);
    }

    /// Route `request` to the acceptor of `center`, starting at `contact`.
    ///
    /// The acceptor handles `request` as if its original sender had sent it
    /// directly.
    pub fn query(&mut self, contact: PeerId, center: Position, request: Message) {
        self.advance_clock(Instant::now());
        self.send_query(contact, center, request);
        self.flush_disconnects();
    }

    /// Send application data to a neighbor.
    pub fn send(&mut self, target: PeerId, payload: Vec<u8>) -> Result<()> {
        self.advance_clock(Instant::now());

        if self.state != PeerState::Joined {
            return Err(Error::InvalidState {
                expected: "joined",
                actual: self.state.to_string(),
            });
        }
        if target == self.me.id || !self.neighbors.contains(target) {
            return Err(Error::NotNeighbor(target));
        }

        let body = Message::Data(payload).encode()?;
        self.observer.on_send(MessageType::Data, 1, body.len());
        let packet = Packet::to(target, MessageType::Data as u8, body, Priority::Low);

        match self.transport.send_pack(packet).pop() {
            Some((id, e)) => {
                self.pending_disconnects.push(id);
                self.flush_disconnects();
                Err(e.into())
            }
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Driving the peer
    // ---------------------------------------------------------------------

    /// Process one transport event.
    pub fn handle_event(&mut self, event: TransportEvent) {
        self.advance_clock(Instant::now());

        match event {
            TransportEvent::Packet { from, packet } => self.handle_packet(from, &packet),
            TransportEvent::Connected(id) => debug!("[{}] peer [{}] connected", self.me.id, id),
            TransportEvent::Disconnected(id) => {
                debug!("[{}] peer [{}] disconnected", self.me.id, id);
                self.handle_bye(id);
            }
        }

        self.flush_disconnects();
    }

    /// Run the maintenance pass now.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Run the maintenance pass as if the local clock read `now`.
    ///
    /// Contacts pending candidates, answers pending discovery requests and
    /// drops neighbors that stayed irrelevant past their grace period.
    pub fn tick_at(&mut self, now: Instant) {
        self.advance_clock(now);

        if self.state != PeerState::Joined {
            return;
        }

        self.contact_new_neighbors();
        self.check_neighbor_discovery();
        self.remove_non_overlapped();
        self.flush_disconnects();
    }

    fn handle_packet(&mut self, from: PeerId, packet: &Packet) {
        let msg = match Message::decode(packet.msg_type, &packet.body) {
            Ok(m) => m,
            Err(e) => {
                warn!("[{}] dropping packet from [{}]: {}", self.me.id, from, e);
                return;
            }
        };
        let kind = msg.kind();
        self.observer.on_receive(from, kind, packet.body.len());

        if kind != MessageType::Ping {
            if self.id() == ID_UNASSIGNED {
                debug!("no id yet, dropping {} from [{}]", kind, from);
                return;
            }
            if self.state == PeerState::Absent {
                debug!("[{}] not in the overlay, dropping {} from [{}]", self.me.id, kind, from);
                return;
            }
        }

        debug!(
            "[{}] {} from [{}], neighbor size: {}",
            self.me.id,
            kind,
            from,
            self.neighbors.len()
        );
        self.dispatch(from, msg);
    }

    fn dispatch(&mut self, from: PeerId, msg: Message) {
        match msg {
            Message::PingRequest { addr } => self.handle_ping_request(addr),
            Message::PingReply { assigned } => self.handle_ping_reply(assigned),
            Message::Query { pos, request } => self.handle_query(from, pos, *request),
            Message::Join(joiner) => self.handle_join(joiner),
            Message::Nodes(nodes) => self.handle_nodes(nodes),
            Message::Hello(node) => self.handle_hello(from, node),
            Message::HelloReply { pos, meta } => self.handle_hello_reply(from, pos, meta),
            Message::En(list) => self.handle_en(from, &list),
            Message::Move(info) | Message::MoveF(info) => self.handle_move(from, info, false),
            Message::MoveB(info) | Message::MoveFB(info) => self.handle_move(from, info, true),
            Message::Bye => self.handle_bye(from),
            Message::Data(payload) => self.handle_data(from, &payload),
        }
    }

    // ---------------------------------------------------------------------
    // Handlers
    // ---------------------------------------------------------------------

    fn handle_ping_request(&mut self, addr: SocketAddr) {
        if self.id() == ID_UNASSIGNED {
            warn!("first id request while unassigned, taking the gateway id");
            self.transport.set_id(ID_GATEWAY);
            self.me.id = ID_GATEWAY;
            self.me.endpoint = Endpoint::new(ID_GATEWAY, self.transport.local_addr());
            if self.state == PeerState::Absent {
                self.set_inited();
            }
        }

        let assigned = self.assign_new_id();
        info!("[{}] assigned id [{}] to {}", self.me.id, assigned, addr);

        self.transport.store_mapping(assigned, addr);
        self.deliver_to(assigned, &Message::PingReply { assigned }, Priority::High);
    }

    fn handle_ping_reply(&mut self, assigned: PeerId) {
        if self.id() != ID_UNASSIGNED {
            debug!("[{}] ignoring id assignment [{}]", self.me.id, assigned);
            return;
        }
        if assigned == ID_UNASSIGNED {
            warn!("gateway assigned an invalid id");
            return;
        }

        info!("got id [{}] from gateway", assigned);
        self.transport.set_id(assigned);
        if self.state == PeerState::Joining {
            self.set_inited();
        }
    }

    fn handle_query(&mut self, from: PeerId, pos: Position, request: Message) {
        let me = self.me.id;

        let Some(closest) = self.voro.closest_to(&pos) else {
            warn!("[{}] no closest node for {}, dropping query from [{}]", me, pos, from);
            return;
        };

        if closest != me && closest != from && !self.voro.contains(me, &pos) {
            debug!("[{}] forwarding query for {} to [{}]", me, pos, closest);
            let forward = Message::Query {
                pos,
                request: Box::new(request),
            };
            self.deliver_to(closest, &forward, Priority::Highest);
            return;
        }

        if matches!(request, Message::Query { .. }) {
            warn!("[{}] nested query from [{}] dropped", me, from);
            return;
        }

        debug!("[{}] accepting {} from [{}]", me, request.kind(), from);
        self.dispatch(from, request);
    }

    fn handle_join(&mut self, joiner: Node) {
        if !joiner.has_id() || joiner.endpoint.addr.port() == 0 {
            warn!("[{}] joiner {} has no valid address, ignored", self.me.id, joiner);
            return;
        }
        if joiner.id == self.me.id {
            warn!("[{}] JOIN carries my own id, ignored", self.me.id);
            return;
        }
        let id = joiner.id;
        debug!("[{}] joiner: {}", self.me.id, joiner);

        // Insert first so the joiner's enclosing neighbors can be found
        if !self.insert_node(joiner.clone()) {
            self.update_node(&joiner);
        }

        if self.neighbors.len() == 1 {
            warn!("[{}] join request while only the joiner is known", self.me.id);
            self.send_nodes(id, &[]);
            return;
        }

        let Some(joiner) = self.neighbors.get(id).cloned() else {
            warn!("[{}] could not place joiner [{}]", self.me.id, id);
            return;
        };

        let buffer = self.config.aoi_buffer;
        let list: Vec<PeerId> = self
            .neighbors
            .iter()
            .filter(|n| n.id != id && self.is_relevant(n, &joiner, buffer))
            .map(|n| n.id)
            .collect();

        debug!("[{}] notifying joiner [{}] of {} nodes", self.me.id, id, list.len());
        if list.len() <= 1 {
            debug!("[{}] few neighbors for joiner, sites: {}", self.me.id, self.voro);
        }

        self.send_nodes(id, &list);
    }

    fn handle_nodes(&mut self, nodes: Vec<Node>) {
        let received = nodes.len();
        let mut accepted = 0;

        for node in nodes {
            if !node.has_id() {
                continue;
            }
            let newer = self
                .new_neighbors
                .get(&node.id)
                .map_or(true, |known| known.time <= node.time);
            if newer {
                accepted += 1;
                self.new_neighbors.insert(node.id, node);
            }
        }
        self.observer.on_node_list(received, accepted);

        self.contact_new_neighbors();

        // The first neighbor list completes the join
        if self.state == PeerState::Joining {
            self.set_joined();
        }
    }

    fn handle_hello(&mut self, from: PeerId, node: Node) {
        if node.id != from {
            warn!("[{}] HELLO from [{}] carries id [{}], ignored", self.me.id, from, node.id);
            return;
        }
        if from == self.me.id {
            warn!("[{}] HELLO carries my own id, ignored", self.me.id);
            return;
        }

        if self.neighbors.contains(from) {
            self.update_node(&node);
        } else {
            self.insert_node(node);
        }

        let reply = Message::HelloReply {
            pos: self.me.aoi.center,
            meta: self.meta.clone(),
        };
        self.deliver_to(from, &reply, Priority::High);

        self.check_consistency(Some(from));
    }

    fn handle_hello_reply(&mut self, from: PeerId, pos: Position, meta: Option<Vec<u8>>) {
        if from == self.me.id {
            return;
        }
        let Some(current) = self.neighbors.get(from) else {
            warn!("[{}] HELLO_R from unknown neighbor [{}]", self.me.id, from);
            return;
        };

        // Time is not advanced: this is the state as of the HELLO
        let mut node = current.clone();
        node.aoi.center = pos;
        if meta.is_some() {
            node.meta = meta;
        }
        self.update_node(&node);
    }

    fn handle_en(&mut self, from: PeerId, list: &[PeerId]) {
        let Some(sender) = self.neighbors.get(from).cloned() else {
            debug!("[{}] [{}] is no longer a neighbor, ignoring EN", self.me.id, from);
            return;
        };

        let known: HashMap<PeerId, NeighborState> = list
            .iter()
            .map(|&id| (id, NeighborState::OVERLAPPED))
            .collect();

        let buffer = self.config.aoi_buffer;
        let missing: Vec<PeerId> = self
            .voro
            .get_en(self.me.id, 1)
            .into_iter()
            .filter(|&id| id != from && !known.contains_key(&id))
            .filter(|&id| {
                self.neighbors
                    .get(id)
                    .is_some_and(|n| self.is_relevant(n, &sender, buffer))
            })
            .collect();

        self.neighbor_states.insert(from, known);

        if !missing.is_empty() {
            self.send_nodes(from, &missing);
        }
    }

    fn handle_move(&mut self, from: PeerId, info: MoveInfo, boundary: bool) {
        if from == self.me.id {
            return;
        }
        let Some(current) = self.neighbors.get(from) else {
            return;
        };

        let mut node = current.clone();
        node.aoi.center = info.center;
        if let Some(radius) = info.radius {
            node.aoi.radius = radius;
        }
        node.time = info.time;

        // Stale, or the sender was dropped meanwhile
        if !self.update_node(&node) {
            return;
        }

        if boundary {
            self.req_nodes.insert(from);
        }

        self.check_neighbor_discovery();
        self.remove_non_overlapped();
    }

    fn handle_bye(&mut self, from: PeerId) {
        if from != self.me.id && self.neighbors.contains(from) {
            self.check_consistency(Some(from));
            self.delete_node(from);
            debug!(
                "[{}] removed [{}], neighbor size: {}",
                self.me.id,
                from,
                self.neighbors.len()
            );
        }
        self.transport.disconnect(from);
    }

    fn handle_data(&mut self, from: PeerId, payload: &[u8]) {
        if from == self.me.id || !self.neighbors.contains(from) {
            debug!("[{}] dropping DATA from non-neighbor [{}]", self.me.id, from);
            return;
        }
        self.observer.on_data(from, payload);
    }

    // ---------------------------------------------------------------------
    // Join steps
    // ---------------------------------------------------------------------

    /// My id is known: put myself on the map and look for my acceptor.
    fn set_inited(&mut self) {
        let id = self.id();
        self.me.id = id;
        self.me.endpoint = Endpoint::new(id, self.transport.local_addr());
        self.me.time = self.me.time.max(now_millis());
        self.me.meta = self.meta.clone();

        info!("init myself as {}", self.me);

        if !self.insert_node(self.me.clone()) {
            warn!("[{}] could not insert myself", id);
        }

        if id == ID_GATEWAY {
            self.set_joined();
        } else {
            let me = self.me.clone();
            self.send_query(ID_GATEWAY, me.aoi.center, Message::Join(me));
        }
    }

    fn set_joined(&mut self) {
        self.state = PeerState::Joined;
        info!(
            "[{}] joined with {} neighbors",
            self.me.id,
            self.neighbors.len().saturating_sub(1)
        );
        self.observer.on_joined(self.me.id);
    }

    fn assign_new_id(&mut self) -> PeerId {
        let first = self.id() + 1;
        let next = self.next_id.get_or_insert(first);
        let id = *next;
        *next += 1;
        id
    }

    fn send_query(&mut self, contact: PeerId, center: Position, request: Message) {
        debug!("[{}] query via [{}] for the acceptor of {}", self.me.id, contact, center);
        let msg = Message::Query {
            pos: center,
            request: Box::new(request),
        };
        self.deliver_to(contact, &msg, Priority::Highest);
    }

    // ---------------------------------------------------------------------
    // Neighbor management
    // ---------------------------------------------------------------------

    fn insert_node(&mut self, mut node: Node) -> bool {
        if !node.has_id() || self.neighbors.contains(node.id) {
            return false;
        }
        if !self.voro.insert(node.id, node.aoi.center) {
            warn!("[{}] cannot place [{}] at {}", self.me.id, node.id, node.aoi.center);
            return false;
        }

        let id = node.id;
        if id != self.me.id {
            self.transport.store_mapping(id, node.endpoint.addr);
        }
        node.endpoint.last_accessed = now_millis();

        self.observer.on_neighbor_inserted(&node);
        self.neighbors.insert(node);
        self.neighbor_states.insert(id, HashMap::new());
        self.time_drop.insert(id, self.clock + self.config.drop_grace);

        debug!(
            "[{}] inserted [{}], neighbor size: {} voro: {}",
            self.me.id,
            id,
            self.neighbors.len(),
            self.voro.len()
        );
        true
    }

    fn delete_node(&mut self, id: PeerId) -> bool {
        if self.neighbors.remove(id).is_none() {
            return false;
        }
        self.voro.remove(id);
        self.neighbor_states.remove(&id);
        self.time_drop.remove(&id);
        self.observer.on_neighbor_removed(id);
        true
    }

    fn update_node(&mut self, node: &Node) -> bool {
        let Some(current) = self.neighbors.get(node.id) else {
            return false;
        };
        if node.time < current.time {
            return false;
        }
        if !self.voro.update(node.id, node.aoi.center) {
            warn!("[{}] cannot move [{}] to {}", self.me.id, node.id, node.aoi.center);
            return false;
        }
        if node.id != self.me.id {
            self.transport.store_mapping(node.id, node.endpoint.addr);
        }
        self.neighbors.update(node);
        self.neighbors.touch(node.id, now_millis());
        true
    }

    fn is_aoi_neighbor(&self, id: PeerId, other: &Node, buffer: f64) -> bool {
        self.voro.overlaps(
            id,
            &other.aoi.center,
            other.aoi.radius + buffer,
            self.config.overlap_accurate,
        )
    }

    /// Enclosing, or inside either AOI (checked both ways since views differ).
    fn is_relevant(&self, a: &Node, b: &Node, buffer: f64) -> bool {
        self.voro.is_enclosing(a.id, b.id)
            || self.is_aoi_neighbor(a.id, b, buffer)
            || self.is_aoi_neighbor(b.id, a, buffer)
    }

    /// Probe NODE candidates against my diagram and greet the relevant ones.
    fn contact_new_neighbors(&mut self) {
        if self.new_neighbors.is_empty() {
            return;
        }

        let candidates = std::mem::take(&mut self.new_neighbors);
        let me = self.me.id;

        let mut probes = Vec::new();
        for node in candidates.values() {
            if node.id == me {
                continue;
            }
            if self.neighbors.contains(node.id) {
                self.update_node(node);
            } else if self.voro.insert(node.id, node.aoi.center) {
                probes.push(node.id);
            }
        }

        let self_node = self.me.clone();
        let buffer = self.config.aoi_buffer;
        let relevant: Vec<Node> = probes
            .iter()
            .filter_map(|id| candidates.get(id))
            .filter(|node| self.is_relevant(node, &self_node, buffer))
            .cloned()
            .collect();

        for &id in &probes {
            self.voro.remove(id);
        }

        for node in relevant {
            let id = node.id;
            debug!("[{}] [{}] is relevant, saying hello", me, id);
            if self.insert_node(node) {
                self.send_hello(id);
                self.send_en(id);
            }
        }

        debug!(
            "[{}] neighbors after contact: {}, voro: {}",
            me,
            self.neighbors.len(),
            self.voro.len()
        );
    }

    /// Tell boundary movers about neighbors that newly concern them.
    fn check_neighbor_discovery(&mut self) {
        if self.req_nodes.is_empty() {
            return;
        }

        let me = self.me.id;
        let requesters = std::mem::take(&mut self.req_nodes);
        let check_list: Vec<PeerId> = self.neighbors.ids().collect();
        let buffer = self.config.aoi_buffer;

        for from in requesters {
            if from == me {
                continue;
            }
            let Some(mover) = self.neighbors.get(from).cloned() else {
                continue;
            };

            let mut known_list = HashMap::new();
            let mut notify = Vec::new();

            for &id in &check_list {
                if id == me || id == from {
                    continue;
                }

                let mut state = NeighborState::REGULAR;
                if self.is_aoi_neighbor(id, &mover, buffer) {
                    state.insert(NeighborState::OVERLAPPED);
                }
                if self.voro.is_enclosing(id, from) {
                    state.insert(NeighborState::ENCLOSED);
                }
                if state.is_regular() {
                    continue;
                }

                let known = self
                    .neighbor_states
                    .get(&from)
                    .and_then(|states| states.get(&id))
                    .copied()
                    .unwrap_or_default();
                if state.is_news_since(known) {
                    notify.push(id);
                }
                known_list.insert(id, state);
            }

            self.neighbor_states.insert(from, known_list);

            if !notify.is_empty() {
                self.send_nodes(from, &notify);
            }
        }
    }

    /// Ask my enclosing neighbors to cross-check their view of me.
    fn check_consistency(&mut self, skip: Option<PeerId>) {
        for target in self.voro.get_en(self.me.id, 1) {
            if Some(target) != skip {
                self.send_en(target);
            }
        }
    }

    /// Drop neighbors that stayed irrelevant past their grace period.
    fn remove_non_overlapped(&mut self) -> usize {
        let now = self.clock;
        if let Some(last) = self.last_prune {
            if now.duration_since(last) < self.config.prune_interval {
                return 0;
            }
        }
        self.last_prune = Some(now);

        let me = self.me.clone();
        let buffer = self.config.drop_buffer();
        let deadline = now + self.config.drop_grace;

        let ids: Vec<PeerId> = self.neighbors.ids().filter(|&id| id != me.id).collect();
        let mut doomed = Vec::new();
        for id in ids {
            let relevant = self
                .neighbors
                .get(id)
                .is_some_and(|node| self.is_relevant(&me, node, buffer));
            if relevant {
                self.time_drop.insert(id, deadline);
                continue;
            }
            let drop_at = self.time_drop.get(&id).copied().unwrap_or(now);
            if now >= drop_at {
                doomed.push(id);
            }
        }

        if !doomed.is_empty() {
            debug!("[{}] dropping non-overlapped {:?}", me.id, doomed);
        }
        self.send_bye(doomed)
    }

    // ---------------------------------------------------------------------
    // Sending
    // ---------------------------------------------------------------------

    fn deliver(&mut self, targets: Vec<PeerId>, msg: &Message, priority: Priority) {
        if targets.is_empty() {
            return;
        }
        let kind = msg.kind();
        let body = match msg.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!("[{}] cannot encode {}: {}", self.me.id, kind, e);
                return;
            }
        };
        self.observer.on_send(kind, targets.len(), body.len());

        let packet = Packet::new(kind as u8, body, priority).with_targets(targets);
        for (target, e) in self.transport.send_pack(packet) {
            debug!("[{}] {} to [{}] failed: {}", self.me.id, kind, target, e);
            self.pending_disconnects.push(target);
        }
    }

    fn deliver_to(&mut self, target: PeerId, msg: &Message, priority: Priority) {
        self.deliver(vec![target], msg, priority);
    }

    fn send_nodes(&mut self, target: PeerId, ids: &[PeerId]) {
        if ids.is_empty() {
            debug!("[{}] sending an empty node list to [{}]", self.me.id, target);
        }
        let nodes: Vec<Node> = ids
            .iter()
            .filter_map(|&id| self.neighbors.get(id).cloned())
            .collect();
        self.deliver_to(target, &Message::Nodes(nodes), Priority::Normal);
    }

    fn send_hello(&mut self, target: PeerId) {
        let mut me = self.me.clone();
        me.meta = self.meta.clone();
        self.deliver_to(target, &Message::Hello(me), Priority::Highest);
    }

    /// Send `target` its enclosing neighbors as I see them.
    fn send_en(&mut self, target: PeerId) {
        let list = self.voro.get_en(target, 1);
        if !list.is_empty() {
            self.deliver_to(target, &Message::En(list), Priority::High);
        }
    }

    fn send_bye(&mut self, targets: Vec<PeerId>) -> usize {
        if targets.is_empty() {
            return 0;
        }
        debug!("[{}] BYE to {:?}", self.me.id, targets);
        self.deliver(targets.clone(), &Message::Bye, Priority::Highest);
        targets.into_iter().filter(|&id| self.delete_node(id)).count()
    }

    /// Treat every failed send target as gone.
    fn flush_disconnects(&mut self) {
        while let Some(id) = self.pending_disconnects.pop() {
            if id == self.me.id {
                continue;
            }
            debug!("[{}] [{}] unreachable, treating as disconnected", self.me.id, id);
            self.handle_bye(id);
        }
    }
}

fn new_voronoi(config: &PeerConfig) -> Voronoi {
    match config.rng_seed {
        Some(seed) => Voronoi::with_seed(config.voronoi.clone(), seed),
        None => Voronoi::new(config.voronoi.clone()),
    }
}
