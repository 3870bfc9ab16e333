//! Per-link connection health state machine.
//!
//! Tracks when a link last produced data and arms a silence watchdog:
//!
//! ```text
//! Disconnected -> Connected <-> NoResponse
//! ```
//!
//! The watchdog fires at most once per silence window — it is rearmed only
//! by the next receipt or an explicit reconnect, never by itself. Disconnect
//! cancels the watchdog synchronously, so a timer that was already scheduled
//! observes the bumped epoch and becomes a no-op instead of resurrecting a
//! torn-down link.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Status of one logical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkState {
    Disconnected,
    Connected,
    NoResponse,
}

struct Inner {
    state: LinkState,
    last_received: Option<Instant>,
    /// Bumped on every rearm/disconnect; a watchdog fire with a stale epoch
    /// is a leftover from before and must do nothing.
    epoch: u64,
    watchdog: Option<AbortHandle>,
}

/// Health tracker for one link. Status transitions are emitted on the
/// channel returned by [`HealthMonitor::new`].
pub struct HealthMonitor {
    inner: Arc<Mutex<Inner>>,
    timeout: Option<Duration>,
    events: mpsc::UnboundedSender<LinkState>,
}

impl HealthMonitor {
    /// Create a monitor. `timeout` is the silence window after which the
    /// link is declared `NoResponse`; `None` makes the monitor passive
    /// (egress-only links have nothing to time out on).
    pub fn new(timeout: Option<Duration>) -> (Self, mpsc::UnboundedReceiver<LinkState>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            inner: Arc::new(Mutex::new(Inner {
                state: LinkState::Disconnected,
                last_received: None,
                epoch: 0,
                watchdog: None,
            })),
            timeout,
            events: tx,
        };
        (monitor, rx)
    }

    /// Current status.
    pub fn state(&self) -> LinkState {
        self.lock().state
    }

    /// When the link last produced data, if it ever has.
    pub fn last_received(&self) -> Option<Instant> {
        self.lock().last_received
    }

    /// The link came up: mark connected and arm the watchdog.
    pub fn connect(&self) {
        let mut inner = self.lock();
        inner.state = LinkState::Connected;
        inner.last_received = Some(Instant::now());
        self.arm(&mut inner);
        let _ = self.events.send(LinkState::Connected);
    }

    /// Data arrived on the link. Ignored while disconnected; clears a
    /// `NoResponse` status and rearms the silence window.
    pub fn receipt(&self) {
        let mut inner = self.lock();
        if inner.state == LinkState::Disconnected {
            return;
        }
        let recovered = inner.state == LinkState::NoResponse;
        inner.state = LinkState::Connected;
        inner.last_received = Some(Instant::now());
        self.arm(&mut inner);
        if recovered {
            debug!("link recovered from silence");
            let _ = self.events.send(LinkState::Connected);
        }
    }

    /// The link was torn down. Cancels any pending watchdog synchronously.
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        if let Some(watchdog) = inner.watchdog.take() {
            watchdog.abort();
        }
        inner.epoch += 1;
        inner.state = LinkState::Disconnected;
        inner.last_received = None;
        let _ = self.events.send(LinkState::Disconnected);
    }

    /// Arm (or rearm) the silence watchdog. Caller holds the lock.
    fn arm(&self, inner: &mut MutexGuard<'_, Inner>) {
        if let Some(watchdog) = inner.watchdog.take() {
            watchdog.abort();
        }
        let Some(timeout) = self.timeout else {
            return;
        };

        inner.epoch += 1;
        let armed_epoch = inner.epoch;
        let shared = Arc::clone(&self.inner);
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            sleep(timeout).await;
            let mut inner = shared.lock().unwrap_or_else(|e| e.into_inner());
            if inner.epoch != armed_epoch || inner.state != LinkState::Connected {
                return;
            }
            inner.state = LinkState::NoResponse;
            inner.watchdog = None;
            debug!("link went silent");
            let _ = events.send(LinkState::NoResponse);
        })
        .abort_handle();
        inner.watchdog = Some(handle);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        let mut inner = self.lock();
        if let Some(watchdog) = inner.watchdog.take() {
            watchdog.abort();
        }
    }
}
