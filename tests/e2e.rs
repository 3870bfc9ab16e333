//! E2E regression suite for the relay pipeline.
//!
//! Uses the in-memory signaling backend with real loopback UDP sockets to
//! exercise the full path:
//!
//! - Capture feed → remote UDP ingress → mesh links → peer's local egress
//! - Capture feed → remote UDP ingress → own local egress (tagged loopback)
//! - Peer departure → roster events on the surviving session
//!
//! Run: `cargo test --test e2e`

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use bunraku::codec::{self, EncodeOptions, WireMessage};
use bunraku::mesh::mem::MemSignaling;
use bunraku::session::{Session, SessionConfig, SessionEvent};
use bunraku::Skeleton;

// ── Shared helpers ───────────────────────────────────────────────────

/// Opt-in log output: `RUST_LOG=bunraku=debug cargo test --test e2e`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// A stand-in for a local playback tool: a plain UDP socket that collects
/// whatever a session's local leg emits.
async fn playback_socket() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind(loopback()).await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

async fn recv_datagram(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 64 * 1024];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a datagram")
        .unwrap();
    buf.truncate(len);
    buf
}

/// Wait for a specific session event, discarding unrelated ones.
async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    mut matches: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("event stream closed early");
        if matches(&event) {
            return event;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn capture_feed_reaches_every_playback_socket() {
    init_tracing();
    let signaling = MemSignaling::new();

    // Alice is already in the room with a playback tool attached.
    let (alice, mut alice_events) =
        Session::join(&signaling, "alice", "stage", SessionConfig::default())
            .await
            .unwrap();
    let (alice_playback, alice_playback_addr) = playback_socket().await;
    alice.connect_local(alice_playback_addr).await.unwrap();

    // Bob joins with a capture feed and his own playback tool.
    let (bob, _bob_events) = Session::join(&signaling, "bob", "stage", SessionConfig::default())
        .await
        .unwrap();
    let (bob_playback, bob_playback_addr) = playback_socket().await;
    bob.connect_local(bob_playback_addr).await.unwrap();
    bob.connect_remote(loopback()).await.unwrap();
    let ingress = bob.remote_ingress_addr().unwrap();

    // Do not feed until alice's link to bob is actually open.
    wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::PeerJoined { peer, .. } if peer == "bob")
    })
    .await;

    let feed = UdpSocket::bind(loopback()).await.unwrap();
    let line = b"0 Hips 1.00 2.00 3.00 0.10 0.20 0.30 ||";
    feed.send_to(line, ingress).await.unwrap();

    // Alice's playback tool sees the payload tagged with the sender's id,
    // and so does bob's own.
    let mut expected = b"bob:".to_vec();
    expected.extend_from_slice(line);
    assert_eq!(recv_datagram(&alice_playback).await, expected);
    assert_eq!(recv_datagram(&bob_playback).await, expected);

    bob.teardown().await;
    alice.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn encoded_wire_messages_survive_the_relay() {
    init_tracing();
    let signaling = MemSignaling::new();

    let (alice, mut alice_events) =
        Session::join(&signaling, "alice", "stage", SessionConfig::default())
            .await
            .unwrap();
    let (alice_playback, alice_playback_addr) = playback_socket().await;
    alice.connect_local(alice_playback_addr).await.unwrap();

    let (bob, _bob_events) = Session::join(&signaling, "bob", "stage", SessionConfig::default())
        .await
        .unwrap();
    bob.connect_remote(loopback()).await.unwrap();
    let ingress = bob.remote_ingress_addr().unwrap();

    wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::PeerJoined { peer, .. } if peer == "bob")
    })
    .await;

    // The capture rig streams one skeleton of a single transform.
    let skeleton = Skeleton::new(vec!["Hips".to_string()]).unwrap();
    let block = "0 Hips 1.00 2.00 3.00 0.10 0.20 0.30 ||";
    let options = EncodeOptions {
        address_prefix: Some("stage"),
        ..EncodeOptions::default()
    };
    let messages = codec::encode_frames(block, &skeleton, &options).unwrap();
    assert_eq!(messages.len(), 1);

    let feed = UdpSocket::bind(loopback()).await.unwrap();
    feed.send_to(&messages[0].to_bytes(), ingress).await.unwrap();

    // Alice strips the transport envelope, then decodes the binary body.
    let received = recv_datagram(&alice_playback).await;
    let body = received
        .strip_prefix(b"bob:".as_slice())
        .expect("payload should carry the sender tag");
    let message = WireMessage::from_bytes(body).unwrap();
    let decoded = codec::decode_frames(&message, &skeleton).unwrap();
    assert_eq!(decoded.address_prefix.as_deref(), Some("stage"));
    assert_eq!(decoded.records, vec![block.to_string()]);

    bob.teardown().await;
    alice.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_departure_updates_the_roster() {
    init_tracing();
    let signaling = MemSignaling::new();

    let (alice, mut alice_events) =
        Session::join(&signaling, "alice", "stage", SessionConfig::default())
            .await
            .unwrap();
    let (bob, _bob_events) = Session::join(&signaling, "bob", "stage", SessionConfig::default())
        .await
        .unwrap();

    wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::PeerJoined { peer, .. } if peer == "bob")
    })
    .await;
    assert_eq!(alice.participant().peer_ids(), vec!["bob".to_string()]);

    bob.teardown().await;

    let left = wait_for(&mut alice_events, |e| {
        matches!(e, SessionEvent::PeerLeft { peer, .. } if peer == "bob")
    })
    .await;
    if let SessionEvent::PeerLeft { peers, .. } = left {
        assert!(peers.is_empty());
    }
    assert!(alice.participant().peer_ids().is_empty());

    alice.teardown().await;
}
