//! Peer mesh: signaling capability traits, the [`Participant`], and the
//! directory reconciliation loop.
//!
//! The core never depends on a concrete signaling/transport implementation.
//! It talks to three capability traits: [`Signaling`] (room setup and
//! identity establishment), [`SignalingSession`] (one live identity: peer
//! directory queries, outbound link dialing, inbound link acceptance,
//! heartbeats), and [`MeshConn`] (one best-effort data link to one peer).
//!
//! Links are unreliable by design: per-link delivery order is preserved,
//! nothing is guaranteed across links, and there is no retry layer here.

pub mod mem;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::MeshError;

/// Default period for directory reconciliation and heartbeats.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// One best-effort data link to one peer.
#[async_trait]
pub trait MeshConn: Send + Sync + 'static {
    /// Id of the peer on the far side.
    fn peer_id(&self) -> &str;

    /// Resolves once the link has finished opening (Connecting -> Open).
    async fn ready(&self) -> Result<(), MeshError>;

    /// Send one payload. Best-effort; an error means this link only.
    async fn send(&self, payload: Bytes) -> Result<(), MeshError>;

    /// Next inbound payload, in per-link order. `None` once closed.
    async fn recv(&self) -> Option<Bytes>;

    /// Close the link. Idempotent.
    fn close(&self);
}

/// A live signaling identity inside one room.
#[async_trait]
pub trait SignalingSession: Send + Sync + 'static {
    /// Our own peer id as the directory knows it.
    fn id(&self) -> &str;

    /// Current peer directory, in directory order. May include our own id.
    async fn list_peers(&self) -> Result<Vec<String>, MeshError>;

    /// Dial a non-reliable link to `peer_id`.
    async fn connect(&self, peer_id: &str) -> Result<Arc<dyn MeshConn>, MeshError>;

    /// Tell the directory we are alive.
    async fn heartbeat(&self);

    /// Next inbound link, or `None` once the session is gone.
    async fn accept(&self) -> Option<Arc<dyn MeshConn>>;

    /// Drop the identity from the directory. Idempotent.
    async fn disconnect(&self);
}

/// A signaling backend capable of room setup and identity establishment.
#[async_trait]
pub trait Signaling: Send + Sync + 'static {
    /// Create (or ensure) a room on the backend.
    async fn create_room(&self, room: &str) -> Result<(), MeshError>;

    /// Establish an identity scoped to `room`.
    async fn join(&self, peer_id: &str, room: &str) -> Result<Arc<dyn SignalingSession>, MeshError>;
}

/// Events a participant's mesh produces.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A link finished opening. Suppressed for links that were already in
    /// the directory at join time.
    PeerConnected { peer: String },
    /// A link closed (remote side or reconciliation) and was removed.
    PeerDisconnected { peer: String },
    /// One inbound payload from one link.
    Data { peer: String, payload: Bytes },
    /// The signaling backend reported a failure; links are unaffected.
    SignalingError { message: String },
}

/// Mesh tunables.
#[derive(Debug, Clone, Copy)]
pub struct MeshConfig {
    /// Directory reconciliation / heartbeat period.
    pub reconcile_interval: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: RECONCILE_INTERVAL,
        }
    }
}

struct Link {
    conn: Arc<dyn MeshConn>,
    pump: AbortHandle,
}

struct Inner {
    session: Arc<dyn SignalingSession>,
    links: HashMap<String, Link>,
}

/// State shared between the participant handle and its background tasks.
/// `inner` becomes `None` on teardown; every late callback checks that
/// first and no-ops instead of reviving torn-down state.
struct Shared {
    id: String,
    inner: Mutex<Option<Inner>>,
    events: mpsc::UnboundedSender<MeshEvent>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Inner>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_torn_down(&self) -> bool {
        self.lock().is_none()
    }

    /// Adopt a link into the set and start pumping it. `announce` controls
    /// whether the open is reported (discovery-time links are not — the
    /// roster snapshot at join already covers them).
    fn adopt(self: &Arc<Self>, conn: Arc<dyn MeshConn>, announce: bool) {
        let peer = conn.peer_id().to_string();
        let mut guard = self.lock();
        let Some(inner) = guard.as_mut() else {
            conn.close();
            return;
        };
        if inner.links.contains_key(&peer) {
            // Link set is keyed uniquely by peer id; a second link to the
            // same peer (e.g. simultaneous dial-out and dial-in) is dropped.
            debug!(%peer, "closing duplicate mesh link");
            conn.close();
            return;
        }

        let weak = Arc::downgrade(self);
        let pump_conn = Arc::clone(&conn);
        let pump_peer = peer.clone();
        let pump = tokio::spawn(async move {
            pump_link(weak, pump_conn, pump_peer, announce).await;
        })
        .abort_handle();

        inner.links.insert(peer, Link { conn, pump });
    }

    /// Drop a link from the set, closing it. `emit` controls whether the
    /// disconnect is reported (teardown tears everything silently).
    fn remove_link(&self, peer: &str, emit: bool) {
        let mut guard = self.lock();
        let Some(inner) = guard.as_mut() else {
            return;
        };
        if let Some(link) = inner.links.remove(peer) {
            link.pump.abort();
            link.conn.close();
            if emit {
                let _ = self.events.send(MeshEvent::PeerDisconnected {
                    peer: peer.to_string(),
                });
            }
        }
    }

    /// One reconciliation pass: heartbeat, then align links with the
    /// directory. Idempotent — an unchanged directory causes no churn.
    async fn reconcile(self: &Arc<Self>) -> Result<(), MeshError> {
        let session = {
            let guard = self.lock();
            let Some(inner) = guard.as_ref() else {
                return Ok(());
            };
            Arc::clone(&inner.session)
        };

        session.heartbeat().await;
        let directory = session.list_peers().await?;

        let (missing, stale) = {
            let guard = self.lock();
            let Some(inner) = guard.as_ref() else {
                return Ok(());
            };
            let missing: Vec<String> = directory
                .iter()
                .filter(|peer| **peer != self.id && !inner.links.contains_key(*peer))
                .cloned()
                .collect();
            let stale: Vec<String> = inner
                .links
                .keys()
                .filter(|peer| !directory.contains(peer))
                .cloned()
                .collect();
            (missing, stale)
        };

        for peer in missing {
            match session.connect(&peer).await {
                Ok(conn) => {
                    info!(%peer, "opening mesh link to new directory peer");
                    self.adopt(conn, true);
                }
                Err(e) => warn!(%peer, "failed to dial peer: {e}"),
            }
        }
        for peer in stale {
            info!(%peer, "closing mesh link to vanished peer");
            self.remove_link(&peer, true);
        }
        Ok(())
    }
}

/// Per-link pump: wait for open, then forward inbound payloads until the
/// link closes, then unlink it. Every step re-checks that the participant
/// is still alive.
async fn pump_link(weak: Weak<Shared>, conn: Arc<dyn MeshConn>, peer: String, announce: bool) {
    if conn.ready().await.is_err() {
        if let Some(shared) = weak.upgrade() {
            shared.remove_link(&peer, false);
        }
        return;
    }
    if announce {
        let Some(shared) = weak.upgrade() else { return };
        if shared.is_torn_down() {
            return;
        }
        let _ = shared.events.send(MeshEvent::PeerConnected { peer: peer.clone() });
    }

    while let Some(payload) = conn.recv().await {
        let Some(shared) = weak.upgrade() else { return };
        if shared.is_torn_down() {
            return;
        }
        let _ = shared.events.send(MeshEvent::Data {
            peer: peer.clone(),
            payload,
        });
    }

    // Closed from the remote side.
    if let Some(shared) = weak.upgrade() {
        shared.remove_link(&peer, true);
    }
}

/// The local session identity: one signaling session plus its set of mesh
/// links, keyed uniquely by peer id. Created by [`MeshManager::join`];
/// destroyed by [`Participant::teardown`].
pub struct Participant {
    shared: Arc<Shared>,
    events: Mutex<Option<mpsc::UnboundedReceiver<MeshEvent>>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl Participant {
    /// Our own peer id.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Snapshot of currently linked peer ids, sorted.
    pub fn peer_ids(&self) -> Vec<String> {
        let guard = self.shared.lock();
        let mut peers: Vec<String> = guard
            .as_ref()
            .map(|inner| inner.links.keys().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Take the mesh event stream. Yields `None` on a second call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MeshEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Fan a payload out to every open link. Per-link send failures are
    /// logged and never abort the other links.
    pub async fn send_to_all(&self, payload: &Bytes) {
        let conns: Vec<Arc<dyn MeshConn>> = {
            let guard = self.shared.lock();
            let Some(inner) = guard.as_ref() else { return };
            inner.links.values().map(|l| Arc::clone(&l.conn)).collect()
        };
        for conn in conns {
            if let Err(e) = conn.send(payload.clone()).await {
                warn!(peer = conn.peer_id(), "mesh send failed: {e}");
            }
        }
    }

    /// Run one reconciliation pass immediately (the periodic tick runs the
    /// same pass).
    pub async fn reconcile_now(&self) -> Result<(), MeshError> {
        self.shared.reconcile().await
    }

    /// Whether this participant has been torn down.
    pub fn is_torn_down(&self) -> bool {
        self.shared.is_torn_down()
    }

    /// Close every link, disconnect the signaling identity, and release all
    /// resources. Idempotent; pending callbacks become no-ops.
    pub async fn teardown(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }

        let inner = {
            let mut guard = self.shared.lock();
            guard.take()
        };
        let Some(inner) = inner else { return };

        for (_, link) in inner.links {
            link.pump.abort();
            link.conn.close();
        }
        inner.session.disconnect().await;
        info!(id = %self.shared.id, "participant torn down");
    }
}

/// Builds participants: joins the room, links up the existing directory,
/// and starts the accept loop and the periodic reconciliation tick.
pub struct MeshManager {
    config: MeshConfig,
}

impl MeshManager {
    pub fn new(config: MeshConfig) -> Self {
        Self { config }
    }

    /// Join `room` as `peer_id`.
    ///
    /// Fails without leaking links if the identity cannot be established or
    /// the directory cannot be read; existing peers' links may still be
    /// opening when this returns.
    pub async fn join(
        &self,
        signaling: &dyn Signaling,
        peer_id: &str,
        room: &str,
    ) -> Result<Participant, MeshError> {
        let session = signaling.join(peer_id, room).await?;
        let directory = match session.list_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                session.disconnect().await;
                return Err(e);
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id: session.id().to_string(),
            inner: Mutex::new(Some(Inner {
                session: Arc::clone(&session),
                links: HashMap::new(),
            })),
            events: events_tx,
        });

        // Links to peers already present are opened now; their open events
        // are suppressed to avoid duplicate "connected" notifications.
        for peer in directory.iter().filter(|p| p.as_str() != session.id()) {
            match session.connect(peer).await {
                Ok(conn) => shared.adopt(conn, false),
                Err(e) => warn!(%peer, "failed to dial existing peer: {e}"),
            }
        }

        let accept_weak = Arc::downgrade(&shared);
        let accept_session = Arc::clone(&session);
        let accept = tokio::spawn(async move {
            while let Some(conn) = accept_session.accept().await {
                let Some(shared) = accept_weak.upgrade() else { break };
                shared.adopt(conn, true);
            }
        })
        .abort_handle();

        let tick_weak = Arc::downgrade(&shared);
        let period = self.config.reconcile_interval;
        let tick = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The zeroth tick fires immediately; join has just done this work.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = tick_weak.upgrade() else { break };
                if let Err(e) = shared.reconcile().await {
                    warn!("reconciliation failed: {e}");
                    let _ = shared.events.send(MeshEvent::SignalingError {
                        message: e.to_string(),
                    });
                }
            }
        })
        .abort_handle();

        info!(id = session.id(), room, "joined mesh");
        Ok(Participant {
            shared,
            events: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(vec![accept, tick]),
        })
    }
}
