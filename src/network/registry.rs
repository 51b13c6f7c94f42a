use crate::network::protocol::Frame;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Inbound,
    Outbound,
}

/// Registry-side handle to one live connection. Holding it keeps the
/// connection's writer task alive; dropping the last clone closes the
/// socket's write half.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub id: Uuid,
    pub addr: SocketAddr,
    pub role: Role,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl PeerHandle {
    pub fn new(
        id: Uuid,
        addr: SocketAddr,
        role: Role,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            id,
            addr,
            role,
            outbound,
        }
    }

    /// Queue a frame for this peer's writer task. Returns false once the
    /// writer has shut down.
    pub fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

/// The set of live peer connections. All access is serialized behind a
/// single lock, so a broadcast never observes a connection between its
/// close and its removal.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    peers: Mutex<HashMap<Uuid, PeerHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection. No-op returning false if the id is already
    /// registered.
    pub async fn add(&self, handle: PeerHandle) -> bool {
        let mut peers = self.peers.lock().await;
        if peers.contains_key(&handle.id) {
            warn!(peer = %handle.id, "connection already registered");
            return false;
        }
        debug!(peer = %handle.id, addr = %handle.addr, role = ?handle.role, "peer registered");
        peers.insert(handle.id, handle);
        true
    }

    /// Remove a connection. Idempotent.
    pub async fn remove(&self, id: Uuid) -> bool {
        let removed = self.peers.lock().await.remove(&id).is_some();
        if removed {
            debug!(peer = %id, "peer removed");
        }
        removed
    }

    /// Deliver `frame` to every registered connection except `excluding`.
    /// Best-effort: a peer whose writer is gone is dropped here and the
    /// fan-out continues. Returns how many peers the frame was queued for.
    pub async fn broadcast(&self, frame: Frame, excluding: Uuid) -> usize {
        let mut peers = self.peers.lock().await;
        let mut dead = Vec::new();
        let mut delivered = 0;

        for (id, peer) in peers.iter() {
            if *id == excluding {
                continue;
            }
            if peer.send(frame.clone()) {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }

        for id in dead {
            warn!(peer = %id, "dropping peer with closed outbound channel");
            peers.remove(&id);
        }

        delivered
    }

    /// Number of live connections.
    pub async fn count(&self) -> usize {
        self.peers.lock().await.len()
    }
}
