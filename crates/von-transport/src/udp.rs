//! UDP transport: one bincode-encoded [`Packet`] per datagram
//!
//! The socket is created with socket2 so buffer sizes and address reuse can
//! be set before binding, then handed to tokio. A background task decodes
//! inbound datagrams into [`TransportEvent`]s and learns the source address
//! of every sender id it hears from.
//!
//! Sends never await. A datagram goes out with `try_send_to` when the socket
//! is writable; otherwise it is queued to a send task that waits for the
//! socket. Once anything is queued, later datagrams queue behind it so
//! order is kept. UDP gives no delivery guarantee; the `reliable` flag of a
//! packet is carried but not enforced.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{Transport, TransportError, TransportEvent};
use crate::types::{Packet, PeerId, ID_UNASSIGNED, MAX_DATAGRAM};

type Mappings = Arc<Mutex<HashMap<PeerId, SocketAddr>>>;
type Outbound = (Vec<u8>, SocketAddr);

/// UDP transport configuration
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Address to bind to
    pub bind: SocketAddr,
    /// Address announced to other peers, if different from the bound one
    pub advertise: Option<SocketAddr>,
    /// Send buffer size in bytes
    pub sndbuf: usize,
    /// Receive buffer size in bytes
    pub rcvbuf: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_PORT)),
            advertise: None,
            sndbuf: 1024 * 1024, // 1MB
            rcvbuf: 1024 * 1024, // 1MB
        }
    }
}

/// Transport over a single UDP socket
#[derive(Debug)]
pub struct UdpTransport {
    id: PeerId,
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    mappings: Mappings,
    outbound: UnboundedSender<Outbound>,
    backlog: Arc<AtomicUsize>,
    recv_task: Option<JoinHandle<()>>,
    send_task: Option<JoinHandle<()>>,
}

impl UdpTransport {
    /// Bind the socket and start receiving.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bind(
        cfg: UdpConfig,
        id: PeerId,
    ) -> Result<(Self, UnboundedReceiver<TransportEvent>), TransportError> {
        let domain = if cfg.bind.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        // Set buffer sizes before binding
        socket.set_send_buffer_size(cfg.sndbuf)?;
        socket.set_recv_buffer_size(cfg.rcvbuf)?;
        socket.set_reuse_address(true)?;

        socket.bind(&cfg.bind.into())?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);

        let bound = socket.local_addr()?;
        let local = cfg.advertise.unwrap_or(bound);

        info!(
            "UDP transport bound to {} (advertised {}, sndbuf={}, rcvbuf={})",
            bound, local, cfg.sndbuf, cfg.rcvbuf
        );

        let mappings: Mappings = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let recv_task = tokio::spawn(recv_loop(socket.clone(), mappings.clone(), tx));

        let backlog = Arc::new(AtomicUsize::new(0));
        let (outbound, queued) = mpsc::unbounded_channel();
        let send_task = tokio::spawn(send_loop(socket.clone(), queued, backlog.clone()));

        Ok((
            Self {
                id,
                socket,
                local,
                mappings,
                outbound,
                backlog,
                recv_task: Some(recv_task),
                send_task: Some(send_task),
            },
            rx,
        ))
    }

    /// Address the socket is actually bound to
    pub fn bound_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    fn mappings(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, SocketAddr>> {
        self.mappings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, mappings: Mappings, tx: UnboundedSender<TransportEvent>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, from_addr) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            // ICMP port unreachable surfaces here on some platforms
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused) => {
                debug!("UDP recv: {}", e);
                continue;
            }
            Err(e) => {
                warn!("UDP recv failed, stopping: {}", e);
                break;
            }
        };

        let packet = match Packet::from_bytes(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping malformed datagram from {}: {}", from_addr, e);
                continue;
            }
        };

        if packet.src != ID_UNASSIGNED {
            mappings
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(packet.src, from_addr);
        }

        let event = TransportEvent::Packet {
            from: packet.src,
            packet,
        };
        if tx.send(event).is_err() {
            debug!("UDP receiver dropped, stopping");
            break;
        }
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    mut queued: UnboundedReceiver<Outbound>,
    backlog: Arc<AtomicUsize>,
) {
    while let Some((buf, addr)) = queued.recv().await {
        if let Err(e) = socket.send_to(&buf, addr).await {
            debug!("queued UDP send to {} failed: {}", addr, e);
        }
        backlog.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Transport for UdpTransport {
    fn id(&self) -> PeerId {
        self.id
    }

    fn set_id(&mut self, id: PeerId) {
        self.id = id;
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn store_mapping(&mut self, id: PeerId, addr: SocketAddr) {
        if id != ID_UNASSIGNED {
            self.mappings().insert(id, addr);
        }
    }

    fn address_of(&self, id: PeerId) -> Option<SocketAddr> {
        if id == self.id && id != ID_UNASSIGNED {
            return Some(self.local);
        }
        self.mappings().get(&id).copied()
    }

    fn send_to(&mut self, target: PeerId, packet: &Packet) -> Result<(), TransportError> {
        if self.recv_task.is_none() {
            return Err(TransportError::Closed);
        }
        let addr = self
            .address_of(target)
            .ok_or(TransportError::UnknownTarget(target))?;

        let mut packet = packet.clone();
        packet.targets = vec![target];
        let buf = packet.to_bytes()?;
        if buf.len() > MAX_DATAGRAM {
            return Err(TransportError::TooLarge(buf.len()));
        }

        if self.backlog.load(Ordering::Acquire) == 0 {
            match self.socket.try_send_to(&buf, addr) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    debug!("UDP socket busy, queueing datagram for {}", addr);
                }
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    return Err(TransportError::Unreachable(addr));
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.backlog.fetch_add(1, Ordering::AcqRel);
        if self.outbound.send((buf, addr)).is_err() {
            self.backlog.fetch_sub(1, Ordering::AcqRel);
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn disconnect(&mut self, id: PeerId) -> bool {
        self.mappings().remove(&id).is_some()
    }

    fn close(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
            if let Some(sender) = self.send_task.take() {
                sender.abort();
            }
            self.mappings().clear();
            debug!("UDP transport {} closed", self.local);
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
