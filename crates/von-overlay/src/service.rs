//! Async driver for a [`Peer`].
//!
//! [`PeerService`] owns the peer and runs it on one task: transport events,
//! application commands and the maintenance tick are all handled in a
//! single `select!` loop, so the peer itself needs no locking.
//! Applications talk to it through a cloneable [`PeerHandle`].

use std::net::SocketAddr;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use von_transport::{PeerId, Transport, TransportEvent};

use crate::node::{Aoi, Node};
use crate::peer::{Peer, PeerState};
use crate::{Error, Result};

/// Capacity of the command channel
const COMMAND_BUFFER: usize = 64;

/// Requests from a [`PeerHandle`] to the service task
#[derive(Debug)]
enum Command {
    Join {
        gateway: SocketAddr,
        aoi: Aoi,
        reply: oneshot::Sender<Result<PeerId>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    Move {
        aoi: Aoi,
        reply: oneshot::Sender<Aoi>,
    },
    List {
        reply: oneshot::Sender<Vec<Node>>,
    },
    Send {
        target: PeerId,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Put {
        meta: Vec<u8>,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<PeerStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Summary of a peer, for logs and status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerStatus {
    /// Peer id
    pub id: PeerId,
    /// Lifecycle state
    pub state: PeerState,
    /// Current AOI
    pub aoi: Aoi,
    /// Neighbors, self excluded
    pub neighbors: usize,
    /// Enclosing neighbors
    pub enclosing: Vec<PeerId>,
}

impl PeerStatus {
    fn of<T: Transport>(peer: &Peer<T>) -> Self {
        let own = usize::from(peer.is_neighbor(peer.id()));
        Self {
            id: peer.id(),
            state: peer.state(),
            aoi: peer.aoi(),
            neighbors: peer.neighbors().len() - own,
            enclosing: peer.enclosing_neighbors(),
        }
    }
}

/// Runs a [`Peer`] on a tokio task.
pub struct PeerService<T: Transport> {
    peer: Peer<T>,
    events: UnboundedReceiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    pending_joins: Vec<oneshot::Sender<Result<PeerId>>>,
}

impl<T: Transport> PeerService<T> {
    /// Wrap a peer and the event stream of its transport.
    pub fn new(peer: Peer<T>, events: UnboundedReceiver<TransportEvent>) -> (Self, PeerHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let service = Self {
            peer,
            events,
            commands: rx,
            pending_joins: Vec::new(),
        };
        (service, PeerHandle { tx })
    }

    /// Run until shut down, or until every handle and the transport are gone.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.peer.config().tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.peer.handle_event(event),
                    None => {
                        info!("[{}] transport closed, stopping peer service", self.peer.id());
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.peer.shut();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("[{}] all handles dropped, shutting down", self.peer.id());
                        self.peer.shut();
                        break;
                    }
                },
                _ = tick.tick() => self.peer.tick(),
            }

            self.resolve_joins();
        }

        for reply in self.pending_joins.drain(..) {
            let _ = reply.send(Err(Error::ServiceClosed));
        }
        info!("[{}] peer service stopped", self.peer.id());
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join { gateway, aoi, reply } => {
                if !self.peer.is_joined() {
                    self.peer.join(gateway, aoi);
                }
                if self.peer.state() == PeerState::Absent {
                    let _ = reply.send(Err(Error::InvalidState {
                        expected: "joining",
                        actual: self.peer.state().to_string(),
                    }));
                } else {
                    self.pending_joins.push(reply);
                }
            }
            Command::Leave { reply } => {
                self.peer.leave();
                let _ = reply.send(());
            }
            Command::Move { aoi, reply } => {
                let _ = reply.send(self.peer.move_to(aoi, None));
            }
            Command::List { reply } => {
                let _ = reply.send(self.peer.list());
            }
            Command::Send {
                target,
                payload,
                reply,
            } => {
                let _ = reply.send(self.peer.send(target, payload));
            }
            Command::Put { meta, reply } => {
                self.peer.put(meta);
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(PeerStatus::of(&self.peer));
            }
            Command::Shutdown { reply } => {
                self.peer.shut();
                let _ = reply.send(());
            }
        }
    }

    /// Answer join waiters once the outcome is known.
    fn resolve_joins(&mut self) {
        if self.pending_joins.is_empty() {
            return;
        }
        let state = self.peer.state();
        if state == PeerState::Joining {
            return;
        }
        let id = self.peer.id();
        for reply in self.pending_joins.drain(..) {
            let outcome = match state {
                PeerState::Joined => Ok(id),
                _ => Err(Error::InvalidState {
                    expected: "joined",
                    actual: state.to_string(),
                }),
            };
            let _ = reply.send(outcome);
        }
    }
}

/// Cloneable async front end of a [`PeerService`].
#[derive(Debug, Clone)]
pub struct PeerHandle {
    tx: mpsc::Sender<Command>,
}

impl PeerHandle {
    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::ServiceClosed)?;
        rx.await.map_err(|_| Error::ServiceClosed)
    }

    /// Join through `gateway`; resolves with my id once joined.
    pub async fn join(&self, gateway: SocketAddr, aoi: Aoi) -> Result<PeerId> {
        self.request(|reply| Command::Join { gateway, aoi, reply })
            .await?
    }

    /// Leave the overlay.
    pub async fn leave(&self) -> Result<()> {
        self.request(|reply| Command::Leave { reply }).await
    }

    /// Move my AOI; returns the AOI in effect afterwards.
    pub async fn move_to(&self, aoi: Aoi) -> Result<Aoi> {
        self.request(|reply| Command::Move { aoi, reply }).await
    }

    /// Snapshot of the neighbor table, self included.
    pub async fn list(&self) -> Result<Vec<Node>> {
        self.request(|reply| Command::List { reply }).await
    }

    /// Send application data to a neighbor.
    pub async fn send(&self, target: PeerId, payload: Vec<u8>) -> Result<()> {
        self.request(|reply| Command::Send {
            target,
            payload,
            reply,
        })
        .await?
    }

    /// Attach application data to my record.
    pub async fn put(&self, meta: Vec<u8>) -> Result<()> {
        self.request(|reply| Command::Put { meta, reply }).await
    }

    /// Current status summary.
    pub async fn status(&self) -> Result<PeerStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Leave, close the transport and stop the service.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use von_geometry::Position;
    use von_transport::{MemoryNetwork, ID_GATEWAY, ID_UNASSIGNED};

    fn spawn(net: &MemoryNetwork) -> (PeerHandle, SocketAddr, tokio::task::JoinHandle<()>) {
        let (transport, events) = net
            .bind("127.0.0.1:0".parse().unwrap(), ID_UNASSIGNED)
            .unwrap();
        let addr = transport.local_addr();
        let peer = Peer::new(transport, PeerConfig::default());
        let (service, handle) = PeerService::new(peer, events);
        (handle, addr, tokio::spawn(service.run()))
    }

    #[tokio::test]
    async fn gateway_joins_itself() {
        let net = MemoryNetwork::new();
        let (handle, addr, task) = spawn(&net);

        let id = handle
            .join(addr, Aoi::new(Position::new(10.0, 10.0), 5.0))
            .await
            .unwrap();
        assert_eq!(id, ID_GATEWAY);

        let status = handle.status().await.unwrap();
        assert_eq!(status.state, PeerState::Joined);
        assert_eq!(status.neighbors, 0);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(handle.status().await, Err(Error::ServiceClosed)));
    }

    #[tokio::test]
    async fn two_peers_meet_and_exchange_data() {
        let net = MemoryNetwork::new();
        let (gw, gw_addr, gw_task) = spawn(&net);
        let (peer, _, peer_task) = spawn(&net);

        gw.join(gw_addr, Aoi::new(Position::new(100.0, 100.0), 200.0))
            .await
            .unwrap();
        let id = peer
            .join(gw_addr, Aoi::new(Position::new(150.0, 120.0), 200.0))
            .await
            .unwrap();
        assert_eq!(id, 2);

        let listed: Vec<PeerId> = peer.list().await.unwrap().iter().map(|n| n.id).collect();
        assert_eq!(listed, vec![1, 2]);

        peer.send(ID_GATEWAY, b"hi".to_vec()).await.unwrap();
        assert!(matches!(
            peer.send(42, b"lost".to_vec()).await,
            Err(Error::NotNeighbor(42))
        ));

        let moved = peer
            .move_to(Aoi::new(Position::new(160.0, 130.0), 200.0))
            .await
            .unwrap();
        assert_eq!(moved.center, Position::new(160.0, 130.0));

        peer.shutdown().await.unwrap();
        gw.shutdown().await.unwrap();
        peer_task.await.unwrap();
        gw_task.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_join_is_rejected() {
        let net = MemoryNetwork::new();
        let (handle, addr, task) = spawn(&net);

        let result = handle
            .join(addr, Aoi::new(Position::new(10.0, 10.0), -1.0))
            .await;
        assert!(matches!(result, Err(Error::InvalidState { .. })));

        drop(handle);
        task.await.unwrap();
    }
}
