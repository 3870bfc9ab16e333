//! UDP bridge: push-based datagram ingress and a datagram egress sink.
//!
//! Each half owns its own socket, one direction of one link:
//! - [`UdpSource`] binds an address and surfaces received datagrams as a
//!   channel, in receipt order.
//! - [`UdpSink`] opens an ephemeral socket and sends datagrams to a fixed
//!   target.
//!
//! Lifecycle is explicit. Closing a source terminates its ingress channel;
//! sending on a closed sink is a no-op, not an error — callers are expected
//! to check link status before sending. No delivery guarantee exists across
//! a close/reopen boundary.

pub mod health;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::TransportError;

/// Largest datagram the bridge will deliver.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Ingress channel depth before the recv task applies backpressure.
const INGRESS_BUFFER: usize = 256;

/// Receiving half of the bridge: a bound socket whose datagrams are pushed
/// into an ingress channel by a background task.
pub struct UdpSource {
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

impl UdpSource {
    /// Bind `addr` and start receiving.
    ///
    /// Bind failure surfaces synchronously; it is not retried.
    pub async fn bind(addr: SocketAddr) -> Result<(Self, mpsc::Receiver<Bytes>), TransportError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let socket = Arc::new(socket);
        debug!(%addr, "udp source bound");

        let (tx, rx) = mpsc::channel(INGRESS_BUFFER);
        let recv_socket = Arc::clone(&socket);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, _)) => {
                        if tx.send(Bytes::copy_from_slice(&buf[..len])).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("udp receive failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok((Self { socket, task }, rx))
    }

    /// Address the socket is actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    /// Stop receiving and release the socket. Idempotent; the ingress
    /// channel terminates once the recv task is gone.
    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for UdpSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sending half of the bridge: an ephemeral socket aimed at one target.
///
/// Cheaply cloneable; all clones share the socket and the closed state.
#[derive(Clone)]
pub struct UdpSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    target: SocketAddr,
}

impl UdpSink {
    /// Open a socket that sends datagrams to `target`.
    pub async fn connect(target: SocketAddr) -> Result<Self, TransportError> {
        let bind_addr: SocketAddr = if target.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: bind_addr,
                source,
            })?;
        socket.connect(target).await.map_err(TransportError::Io)?;
        debug!(%target, "udp sink opened");

        Ok(Self {
            inner: Arc::new(SinkInner {
                socket: Mutex::new(Some(Arc::new(socket))),
                target,
            }),
        })
    }

    /// Send one datagram. A no-op `Ok` once the sink is closed.
    pub async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let socket = self
            .inner
            .socket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match socket {
            Some(socket) => {
                socket.send(payload).await.map_err(TransportError::Io)?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// The target this sink sends to.
    pub fn target(&self) -> SocketAddr {
        self.inner.target
    }

    /// Release the socket. Idempotent; later sends become no-ops.
    pub fn close(&self) {
        self.inner
            .socket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Whether `close` has been called on any clone of this sink.
    pub fn is_closed(&self) -> bool {
        self.inner
            .socket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn datagrams_arrive_in_receipt_order() {
        let (source, mut ingress) = UdpSource::bind(loopback()).await.unwrap();
        let addr = source.local_addr().unwrap();

        let sink = UdpSink::connect(addr).await.unwrap();
        for i in 0..5u8 {
            sink.send(&[i]).await.unwrap();
        }

        for i in 0..5u8 {
            let datagram = tokio::time::timeout(Duration::from_secs(2), ingress.recv())
                .await
                .expect("datagram should arrive")
                .expect("ingress should stay open");
            assert_eq!(datagram.as_ref(), &[i]);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_terminates_ingress() {
        let (source, mut ingress) = UdpSource::bind(loopback()).await.unwrap();
        source.close();

        let end = tokio::time::timeout(Duration::from_secs(2), ingress.recv())
            .await
            .expect("ingress should terminate");
        assert!(end.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_after_close_is_noop() {
        let (source, _ingress) = UdpSource::bind(loopback()).await.unwrap();
        let sink = UdpSink::connect(source.local_addr().unwrap()).await.unwrap();

        sink.close();
        assert!(sink.is_closed());
        sink.send(b"dropped").await.unwrap();

        // Closing again is also fine.
        sink.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bind_conflict_is_reported() {
        let (source, _ingress) = UdpSource::bind(loopback()).await.unwrap();
        let addr = source.local_addr().unwrap();

        let err = UdpSource::bind(addr).await.err().expect("second bind should fail");
        assert!(matches!(err, TransportError::Bind { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cloned_sinks_share_closed_state() {
        let (source, _ingress) = UdpSource::bind(loopback()).await.unwrap();
        let sink = UdpSink::connect(source.local_addr().unwrap()).await.unwrap();
        let clone = sink.clone();

        sink.close();
        assert!(clone.is_closed());
        clone.send(b"dropped").await.unwrap();
    }
}
