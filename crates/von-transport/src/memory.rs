//! In-process transport for simulations and tests
//!
//! A [`MemoryNetwork`] is a shared switchboard keyed by socket address.
//! Every bound [`MemoryTransport`] owns an unbounded channel; sending looks
//! up the target's address in the sender's own mapping table and pushes
//! the packet into the receiver's channel. Delivery per sender/receiver
//! pair is FIFO.
//!
//! Nothing here needs a running runtime: events can be drained with
//! `try_recv` from synchronous code.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::transport::{Transport, TransportError, TransportEvent};
use crate::types::{Packet, PeerId, ID_UNASSIGNED};

/// First port handed out for `port == 0` binds
const FIRST_EPHEMERAL_PORT: u16 = 20_000;

#[derive(Debug)]
struct Switchboard {
    endpoints: HashMap<SocketAddr, UnboundedSender<TransportEvent>>,
    next_port: u16,
    delivered: u64,
}

/// Shared in-memory network
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Switchboard>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Switchboard {
                endpoints: HashMap::new(),
                next_port: FIRST_EPHEMERAL_PORT,
                delivered: 0,
            })),
        }
    }

    fn board(&self) -> MutexGuard<'_, Switchboard> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a new endpoint.
    ///
    /// Port 0 picks a free port on 127.0.0.1. Binding an address already in
    /// use fails.
    pub fn bind(
        &self,
        addr: SocketAddr,
        id: PeerId,
    ) -> Result<(MemoryTransport, UnboundedReceiver<TransportEvent>), TransportError> {
        let mut board = self.board();

        let addr = if addr.port() == 0 {
            loop {
                let candidate = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), board.next_port);
                board.next_port = board.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
                if !board.endpoints.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            addr
        };

        if board.endpoints.contains_key(&addr) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("{} already bound", addr),
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        board.endpoints.insert(addr, tx);
        tracing::debug!("memory transport bound to {}", addr);

        let transport = MemoryTransport {
            id,
            addr,
            mappings: HashMap::new(),
            network: self.clone(),
            closed: false,
        };
        Ok((transport, rx))
    }

    /// Detach an address as if its host crashed
    pub fn unbind(&self, addr: &SocketAddr) -> bool {
        self.board().endpoints.remove(addr).is_some()
    }

    /// Number of packets delivered so far
    pub fn delivered(&self) -> u64 {
        self.board().delivered
    }

    /// Number of bound endpoints
    pub fn len(&self) -> usize {
        self.board().endpoints.len()
    }

    /// No endpoints bound
    pub fn is_empty(&self) -> bool {
        self.board().endpoints.is_empty()
    }

    fn deliver(&self, to: SocketAddr, event: TransportEvent) -> Result<(), TransportError> {
        let mut board = self.board();
        let tx = board
            .endpoints
            .get(&to)
            .ok_or(TransportError::Unreachable(to))?;
        if tx.send(event).is_err() {
            // Receiver dropped without unbinding
            board.endpoints.remove(&to);
            return Err(TransportError::Unreachable(to));
        }
        board.delivered += 1;
        Ok(())
    }
}

/// One endpoint on a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryTransport {
    id: PeerId,
    addr: SocketAddr,
    mappings: HashMap<PeerId, SocketAddr>,
    network: MemoryNetwork,
    closed: bool,
}

impl Transport for MemoryTransport {
    fn id(&self) -> PeerId {
        self.id
    }

    fn set_id(&mut self, id: PeerId) {
        self.id = id;
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn store_mapping(&mut self, id: PeerId, addr: SocketAddr) {
        if id != ID_UNASSIGNED {
            self.mappings.insert(id, addr);
        }
    }

    fn address_of(&self, id: PeerId) -> Option<SocketAddr> {
        if id == self.id && id != ID_UNASSIGNED {
            return Some(self.addr);
        }
        self.mappings.get(&id).copied()
    }

    fn send_to(&mut self, target: PeerId, packet: &Packet) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let to = self
            .address_of(target)
            .ok_or(TransportError::UnknownTarget(target))?;

        let mut packet = packet.clone();
        packet.targets = vec![target];
        self.network.deliver(
            to,
            TransportEvent::Packet {
                from: packet.src,
                packet,
            },
        )
    }

    fn disconnect(&mut self, id: PeerId) -> bool {
        self.mappings.remove(&id).is_some()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.network.unbind(&self.addr);
            self.mappings.clear();
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    fn any() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_bind_assigns_distinct_ports() {
        let net = MemoryNetwork::new();
        let (a, _ra) = net.bind(any(), 1).unwrap();
        let (b, _rb) = net.bind(any(), 2).unwrap();
        assert_ne!(a.local_addr(), b.local_addr());
        assert_eq!(net.len(), 2);

        assert!(net.bind(a.local_addr(), 3).is_err());
    }

    #[test]
    fn test_send_stamps_source() {
        let net = MemoryNetwork::new();
        let (mut a, _ra) = net.bind(any(), 1).unwrap();
        let (b, mut rb) = net.bind(any(), 2).unwrap();
        a.store_mapping(2, b.local_addr());

        let failed = a.send_pack(Packet::to(2, 4, bytes::Bytes::from_static(b"hi"), Priority::High));
        assert!(failed.is_empty());

        match rb.try_recv().unwrap() {
            TransportEvent::Packet { from, packet } => {
                assert_eq!(from, 1);
                assert_eq!(packet.src, 1);
                assert_eq!(packet.msg_type, 4);
                assert_eq!(&packet.body[..], b"hi");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(net.delivered(), 1);
    }

    #[test]
    fn test_receiver_can_await_delivery() {
        let net = MemoryNetwork::new();
        let (mut a, _ra) = net.bind(any(), 1).unwrap();
        let (b, mut rb) = net.bind(any(), 2).unwrap();
        a.store_mapping(2, b.local_addr());

        a.send_message(2, 7, bytes::Bytes::from_static(b"x"), Priority::Low, false)
            .unwrap();

        let event = tokio_test::block_on(rb.recv()).unwrap();
        assert!(matches!(event, TransportEvent::Packet { from: 1, .. }));
    }

    #[test]
    fn test_unknown_and_closed_targets_fail() {
        let net = MemoryNetwork::new();
        let (mut a, _ra) = net.bind(any(), 1).unwrap();
        let (mut b, _rb) = net.bind(any(), 2).unwrap();

        let failed = a.send_pack(Packet::to(2, 0, bytes::Bytes::new(), Priority::Normal));
        assert!(matches!(failed.as_slice(), [(2, TransportError::UnknownTarget(2))]));

        a.store_mapping(2, b.local_addr());
        b.close();
        let failed = a.send_pack(Packet::to(2, 0, bytes::Bytes::new(), Priority::Normal));
        assert!(matches!(failed.as_slice(), [(2, TransportError::Unreachable(_))]));
    }

    #[test]
    fn test_multi_target_delivery_is_split() {
        let net = MemoryNetwork::new();
        let (mut a, _ra) = net.bind(any(), 1).unwrap();
        let (b, mut rb) = net.bind(any(), 2).unwrap();
        let (c, mut rc) = net.bind(any(), 3).unwrap();
        a.store_mapping(2, b.local_addr());
        a.store_mapping(3, c.local_addr());

        let pack = Packet::new(1, bytes::Bytes::new(), Priority::Highest).with_targets(vec![2, 3, 9]);
        let failed = a.send_pack(pack);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, 9);

        for rx in [&mut rb, &mut rc] {
            match rx.try_recv().unwrap() {
                TransportEvent::Packet { packet, .. } => assert_eq!(packet.targets.len(), 1),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_disconnect_forgets_mapping() {
        let net = MemoryNetwork::new();
        let (mut a, _ra) = net.bind(any(), 1).unwrap();
        a.store_mapping(5, "127.0.0.1:5555".parse().unwrap());
        assert!(a.disconnect(5));
        assert!(!a.disconnect(5));
        assert_eq!(a.address_of(5), None);
    }

    #[test]
    fn test_drop_unbinds() {
        let net = MemoryNetwork::new();
        {
            let (_a, _ra) = net.bind(any(), 1).unwrap();
            assert_eq!(net.len(), 1);
        }
        assert!(net.is_empty());
    }
}
