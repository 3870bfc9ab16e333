//! In-process signaling backend.
//!
//! Rooms live in a shared registry; links are pairs of crossed byte
//! channels that open instantly. Used by the test suites and for running
//! multiple sessions inside one process without a signaling server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::MeshError;
use crate::mesh::{MeshConn, Signaling, SignalingSession};

type ConnSender = mpsc::UnboundedSender<Arc<dyn MeshConn>>;

#[derive(Default)]
struct Room {
    /// Peer id -> inbound-link inbox.
    peers: HashMap<String, ConnSender>,
    heartbeats: u64,
}

#[derive(Default)]
struct Registry {
    rooms: HashMap<String, Room>,
}

/// A process-local signaling backend.
#[derive(Clone, Default)]
pub struct MemSignaling {
    registry: Arc<Mutex<Registry>>,
}

impl MemSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total heartbeats the room has seen.
    pub fn heartbeat_count(&self, room: &str) -> u64 {
        self.lock()
            .rooms
            .get(room)
            .map(|r| r.heartbeats)
            .unwrap_or(0)
    }

    /// Drop a peer from the directory without touching its open links —
    /// simulates a peer that stopped heartbeating.
    pub fn remove_peer(&self, room: &str, peer_id: &str) {
        if let Some(room) = self.lock().rooms.get_mut(room) {
            room.peers.remove(peer_id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Signaling for MemSignaling {
    async fn create_room(&self, room: &str) -> Result<(), MeshError> {
        self.lock().rooms.entry(room.to_string()).or_default();
        Ok(())
    }

    async fn join(&self, peer_id: &str, room: &str) -> Result<Arc<dyn SignalingSession>, MeshError> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        {
            let mut registry = self.lock();
            let room = registry.rooms.entry(room.to_string()).or_default();
            if room.peers.contains_key(peer_id) {
                return Err(MeshError::Signaling(format!(
                    "peer id {peer_id:?} is already taken"
                )));
            }
            room.peers.insert(peer_id.to_string(), inbox_tx);
        }
        Ok(Arc::new(MemSession {
            id: peer_id.to_string(),
            room: room.to_string(),
            registry: Arc::clone(&self.registry),
            inbox: tokio::sync::Mutex::new(inbox_rx),
        }))
    }
}

struct MemSession {
    id: String,
    room: String,
    registry: Arc<Mutex<Registry>>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<dyn MeshConn>>>,
}

impl MemSession {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SignalingSession for MemSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_peers(&self) -> Result<Vec<String>, MeshError> {
        let registry = self.lock();
        let room = registry
            .rooms
            .get(&self.room)
            .ok_or_else(|| MeshError::Directory(format!("room {:?} is gone", self.room)))?;
        let mut peers: Vec<String> = room.peers.keys().cloned().collect();
        peers.sort();
        Ok(peers)
    }

    async fn connect(&self, peer_id: &str) -> Result<Arc<dyn MeshConn>, MeshError> {
        let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
        let (to_us_tx, to_us_rx) = mpsc::unbounded_channel();

        let ours = Arc::new(MemConn {
            peer: peer_id.to_string(),
            tx: Mutex::new(Some(to_peer_tx)),
            rx: tokio::sync::Mutex::new(to_us_rx),
        });
        let theirs: Arc<dyn MeshConn> = Arc::new(MemConn {
            peer: self.id.clone(),
            tx: Mutex::new(Some(to_us_tx)),
            rx: tokio::sync::Mutex::new(to_peer_rx),
        });

        let registry = self.lock();
        let inbox = registry
            .rooms
            .get(&self.room)
            .and_then(|room| room.peers.get(peer_id))
            .ok_or_else(|| MeshError::Signaling(format!("no such peer {peer_id:?}")))?;
        inbox
            .send(theirs)
            .map_err(|_| MeshError::Signaling(format!("peer {peer_id:?} stopped accepting")))?;
        Ok(ours)
    }

    async fn heartbeat(&self) {
        if let Some(room) = self.lock().rooms.get_mut(&self.room) {
            room.heartbeats += 1;
        }
    }

    async fn accept(&self) -> Option<Arc<dyn MeshConn>> {
        self.inbox.lock().await.recv().await
    }

    async fn disconnect(&self) {
        if let Some(room) = self.lock().rooms.get_mut(&self.room) {
            room.peers.remove(&self.id);
        }
    }
}

/// One half of an in-memory link pair.
struct MemConn {
    peer: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

#[async_trait]
impl MeshConn for MemConn {
    fn peer_id(&self) -> &str {
        &self.peer
    }

    async fn ready(&self) -> Result<(), MeshError> {
        // In-memory links open as soon as both halves exist.
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), MeshError> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match tx {
            Some(tx) => tx.send(payload).map_err(|_| MeshError::LinkClosed {
                peer: self.peer.clone(),
            }),
            None => Err(MeshError::LinkClosed {
                peer: self.peer.clone(),
            }),
        }
    }

    async fn recv(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }

    fn close(&self) {
        // Dropping our sender ends the peer's recv stream.
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}
