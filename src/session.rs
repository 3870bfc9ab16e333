//! Session orchestrator: one participant, two UDP legs, and the routing
//! between them.
//!
//! Data flow:
//!
//! ```text
//! capture -> remote UDP ingress -> every open mesh link
//!                               -> local UDP egress, tagged "<own id>:"
//! mesh link inbound             -> local UDP egress, tagged "<peer id>:"
//! ```
//!
//! The tag is a raw-byte transport envelope, distinct from the codec's
//! address encoding; payloads are relayed as opaque bytes.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{info, warn};

use crate::error::{MeshError, TransportError};
use crate::mesh::{MeshConfig, MeshEvent, MeshManager, Participant, Signaling, RECONCILE_INTERVAL};
use crate::transport::health::{HealthMonitor, LinkState};
use crate::transport::{UdpSink, UdpSource};

/// Default silence window before a link is declared unresponsive.
pub const NO_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which UDP leg a connection update concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// The playback leg we send tagged payloads to.
    Local,
    /// The capture leg we receive raw payloads from.
    Remote,
}

/// Updates a session surfaces to its embedder.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A UDP leg changed status.
    Connection { link: LinkKind, state: LinkState },
    /// A mesh link opened; `peers` is the roster snapshot afterwards.
    PeerJoined { peer: String, peers: Vec<String> },
    /// A mesh link closed; `peers` is the roster snapshot afterwards.
    PeerLeft { peer: String, peers: Vec<String> },
    /// The signaling backend reported a failure.
    MeshFailure { message: String },
}

/// Session tunables. Defaults preserve the fixed 10-second windows.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub no_response_timeout: Duration,
    pub reconcile_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            no_response_timeout: NO_RESPONSE_TIMEOUT,
            reconcile_interval: RECONCILE_INTERVAL,
        }
    }
}

impl SessionConfig {
    /// Read overrides from `BUNRAKU_NO_RESPONSE_TIMEOUT_SECS` and
    /// `BUNRAKU_RECONCILE_INTERVAL_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_secs("BUNRAKU_NO_RESPONSE_TIMEOUT_SECS") {
            config.no_response_timeout = secs;
        }
        if let Some(secs) = env_secs("BUNRAKU_RECONCILE_INTERVAL_SECS") {
            config.reconcile_interval = secs;
        }
        config
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}

/// Prefix a payload with the transport envelope `"<peer_id>:"`.
pub fn envelope(peer_id: &str, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(peer_id.len() + 1 + payload.len());
    buf.put_slice(peer_id.as_bytes());
    buf.put_u8(b':');
    buf.put_slice(payload);
    buf.freeze()
}

struct SessionInner {
    /// Capture leg: bound source plus its forward task.
    remote: Option<(UdpSource, AbortHandle)>,
    /// Playback leg.
    local: Option<UdpSink>,
}

/// One live relay session. Created by [`Session::join`]; destroyed by
/// [`Session::teardown`].
pub struct Session {
    participant: Arc<Participant>,
    remote_health: Arc<HealthMonitor>,
    local_health: Arc<HealthMonitor>,
    inner: Arc<Mutex<SessionInner>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Session {
    /// Join `room` as `peer_id` and start routing mesh traffic. The UDP
    /// legs start disconnected; use [`connect_remote`]/[`connect_local`].
    ///
    /// [`connect_remote`]: Session::connect_remote
    /// [`connect_local`]: Session::connect_local
    pub async fn join(
        signaling: &dyn Signaling,
        peer_id: &str,
        room: &str,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), MeshError> {
        let manager = MeshManager::new(MeshConfig {
            reconcile_interval: config.reconcile_interval,
        });
        let participant = Arc::new(manager.join(signaling, peer_id, room).await?);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (remote_health, remote_states) = HealthMonitor::new(Some(config.no_response_timeout));
        let (local_health, local_states) = HealthMonitor::new(None);
        let remote_health = Arc::new(remote_health);
        let local_health = Arc::new(local_health);
        let inner = Arc::new(Mutex::new(SessionInner {
            remote: None,
            local: None,
        }));

        let mut tasks = Vec::new();
        for (link, mut states) in [
            (LinkKind::Remote, remote_states),
            (LinkKind::Local, local_states),
        ] {
            let events = events_tx.clone();
            tasks.push(
                tokio::spawn(async move {
                    while let Some(state) = states.recv().await {
                        let _ = events.send(SessionEvent::Connection { link, state });
                    }
                })
                .abort_handle(),
            );
        }

        // Mesh event pump: inbound payloads to the local leg, roster
        // changes to the embedder.
        let mesh_participant = Arc::clone(&participant);
        let mesh_inner = Arc::clone(&inner);
        let mesh_local_health = Arc::clone(&local_health);
        let events = events_tx.clone();
        let mut mesh_events = match participant.take_events() {
            Some(rx) => rx,
            None => {
                participant.teardown().await;
                return Err(MeshError::Signaling(
                    "participant event stream already taken".to_string(),
                ));
            }
        };
        tasks.push(
            tokio::spawn(async move {
                while let Some(event) = mesh_events.recv().await {
                    match event {
                        MeshEvent::Data { peer, payload } => {
                            if mesh_local_health.state() == LinkState::Disconnected {
                                continue;
                            }
                            let sink = lock_inner(&mesh_inner).local.clone();
                            if let Some(sink) = sink {
                                if let Err(e) = sink.send(&envelope(&peer, &payload)).await {
                                    warn!(%peer, "local egress failed: {e}");
                                }
                            }
                        }
                        MeshEvent::PeerConnected { peer } => {
                            let _ = events.send(SessionEvent::PeerJoined {
                                peer,
                                peers: mesh_participant.peer_ids(),
                            });
                        }
                        MeshEvent::PeerDisconnected { peer } => {
                            let _ = events.send(SessionEvent::PeerLeft {
                                peer,
                                peers: mesh_participant.peer_ids(),
                            });
                        }
                        MeshEvent::SignalingError { message } => {
                            let _ = events.send(SessionEvent::MeshFailure { message });
                        }
                    }
                }
            })
            .abort_handle(),
        );

        Ok((
            Self {
                participant,
                remote_health,
                local_health,
                inner,
                tasks: Mutex::new(tasks),
            },
            events_rx,
        ))
    }

    /// Our own peer id.
    pub fn id(&self) -> &str {
        self.participant.id()
    }

    /// The mesh participant (roster queries, manual reconciliation).
    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Status of one UDP leg.
    pub fn link_state(&self, link: LinkKind) -> LinkState {
        match link {
            LinkKind::Local => self.local_health.state(),
            LinkKind::Remote => self.remote_health.state(),
        }
    }

    /// Where the capture leg is currently bound, if connected.
    pub fn remote_ingress_addr(&self) -> Option<SocketAddr> {
        let inner = lock_inner(&self.inner);
        inner
            .remote
            .as_ref()
            .and_then(|(source, _)| source.local_addr().ok())
    }

    /// Bind the capture leg and start fanning its datagrams out.
    pub async fn connect_remote(&self, addr: SocketAddr) -> Result<(), TransportError> {
        let (source, mut ingress) = UdpSource::bind(addr).await?;
        info!(%addr, "remote udp leg connected");

        let participant = Arc::clone(&self.participant);
        let remote_health = Arc::clone(&self.remote_health);
        let local_health = Arc::clone(&self.local_health);
        let inner = Arc::clone(&self.inner);
        let own_id = self.participant.id().to_string();
        let forward = tokio::spawn(async move {
            while let Some(datagram) = ingress.recv().await {
                if remote_health.state() == LinkState::Disconnected {
                    continue;
                }
                participant.send_to_all(&datagram).await;
                if local_health.state() != LinkState::Disconnected {
                    let sink = lock_inner(&inner).local.clone();
                    if let Some(sink) = sink {
                        if let Err(e) = sink.send(&envelope(&own_id, &datagram)).await {
                            warn!("local egress failed: {e}");
                        }
                    }
                }
                remote_health.receipt();
            }
        })
        .abort_handle();

        let previous = lock_inner(&self.inner).remote.replace((source, forward));
        if let Some((old_source, old_task)) = previous {
            old_source.close();
            old_task.abort();
        }
        self.remote_health.connect();
        Ok(())
    }

    /// Close the capture leg. The health monitor's watchdog is cancelled
    /// synchronously so no late timer can revive the link.
    pub fn disconnect_remote(&self) {
        let leg = lock_inner(&self.inner).remote.take();
        if leg.is_none() && self.remote_health.state() == LinkState::Disconnected {
            return;
        }
        if let Some((source, forward)) = leg {
            source.close();
            forward.abort();
        }
        self.remote_health.disconnect();
        info!("remote udp leg disconnected");
    }

    /// Open the playback leg toward `addr`.
    pub async fn connect_local(&self, addr: SocketAddr) -> Result<(), TransportError> {
        let sink = UdpSink::connect(addr).await?;
        info!(%addr, "local udp leg connected");
        let previous = lock_inner(&self.inner).local.replace(sink);
        if let Some(old) = previous {
            old.close();
        }
        self.local_health.connect();
        Ok(())
    }

    /// Close the playback leg.
    pub fn disconnect_local(&self) {
        let sink = lock_inner(&self.inner).local.take();
        if sink.is_none() && self.local_health.state() == LinkState::Disconnected {
            return;
        }
        if let Some(sink) = sink {
            sink.close();
        }
        self.local_health.disconnect();
        info!("local udp leg disconnected");
    }

    /// Disconnect both legs and tear down the participant. Idempotent.
    pub async fn teardown(&self) {
        self.disconnect_remote();
        self.disconnect_local();
        self.participant.teardown().await;
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}

fn lock_inner(inner: &Arc<Mutex<SessionInner>>) -> MutexGuard<'_, SessionInner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::mem::MemSignaling;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("expected a session event")
            .expect("event stream should stay open")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn udp_legs_report_status_transitions() {
        let signaling = MemSignaling::new();
        let (session, mut events) =
            Session::join(&signaling, "solo", "room", SessionConfig::default())
                .await
                .unwrap();

        assert_eq!(session.link_state(LinkKind::Remote), LinkState::Disconnected);

        session.connect_remote(loopback()).await.unwrap();
        assert_eq!(session.link_state(LinkKind::Remote), LinkState::Connected);
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Connection {
                link: LinkKind::Remote,
                state: LinkState::Connected
            }
        ));

        session.disconnect_remote();
        assert_eq!(session.link_state(LinkKind::Remote), LinkState::Disconnected);
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Connection {
                link: LinkKind::Remote,
                state: LinkState::Disconnected
            }
        ));

        session.teardown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bind_failure_leaves_session_usable() {
        let signaling = MemSignaling::new();
        let (session, _events) =
            Session::join(&signaling, "solo", "room", SessionConfig::default())
                .await
                .unwrap();

        let (taken, _ingress) = UdpSource::bind(loopback()).await.unwrap();
        let err = session
            .connect_remote(taken.local_addr().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Bind { .. }));
        assert_eq!(session.link_state(LinkKind::Remote), LinkState::Disconnected);

        // A later connect on a free port still works.
        session.connect_remote(loopback()).await.unwrap();
        assert_eq!(session.link_state(LinkKind::Remote), LinkState::Connected);

        session.teardown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn teardown_is_idempotent() {
        let signaling = MemSignaling::new();
        let (session, _events) =
            Session::join(&signaling, "solo", "room", SessionConfig::default())
                .await
                .unwrap();

        session.connect_remote(loopback()).await.unwrap();
        session.teardown().await;
        assert!(session.participant().is_torn_down());
        session.teardown().await;
    }

    #[test]
    fn envelope_prefixes_peer_id() {
        let tagged = envelope("alice", b"0 Hips 1.00 ||");
        assert_eq!(tagged.as_ref(), b"alice:0 Hips 1.00 ||");
    }

    #[test]
    fn config_defaults_preserve_ten_second_windows() {
        let config = SessionConfig::default();
        assert_eq!(config.no_response_timeout, Duration::from_secs(10));
        assert_eq!(config.reconcile_interval, Duration::from_secs(10));
    }
}
