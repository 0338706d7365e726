//! Relay controller.
//!
//! Owns the roster, the optional listening socket and the two worker
//! threads:
//!
//! ```text
//!   device ──► device loop ──► roster.broadcast ──► every peer
//!
//!   peer ──► peer loop ──┬──► device                  (device bound)
//!                        └──► roster.broadcast ──► every other peer
//!                                                     (forwarder mode)
//! ```
//!
//! Both loops wait with a bounded timeout and check the cancellation token
//! after every wait, so `stop()` returns within about one wait interval.

use std::net::TcpStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::config::RelayConfig;
use crate::device::VirtualDevice;
use crate::error::{RelayError, Result};
use crate::listener::ListeningSocket;
use crate::metrics::Metrics;
use crate::roster::{Peer, PeerId, Roster, RosterFull};

mod device_loop;
mod peer_loop;

use peer_loop::PeerLoop;

// ============================================================================
// Shared State
// ============================================================================

/// State shared with the worker threads.
pub(crate) struct Shared {
    pub(crate) roster: Roster,
    pub(crate) metrics: Metrics,
    pub(crate) cancel: CancelToken,
    /// Bounded wait for both loops
    pub(crate) wait: Duration,
    /// Receive buffer size; caps frame lengths accepted from peers
    pub(crate) buffer_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Running,
    Stopped,
}

struct Lifecycle {
    state: State,
    listener: Option<Arc<ListeningSocket>>,
    device_loop: Option<JoinHandle<()>>,
    peer_loop: Option<JoinHandle<()>>,
}

// ============================================================================
// Relay
// ============================================================================

/// Bridges an optional virtual device to a bounded set of TCP peers.
///
/// A relay is started once. Dropping it stops it.
pub struct Relay {
    config: RelayConfig,
    device: Option<Arc<dyn VirtualDevice>>,
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl Relay {
    /// Create a relay without a device. Frames from one peer are relayed to
    /// all other peers.
    pub fn new(config: RelayConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Create a relay bridging `device` to its peers.
    pub fn with_device(config: RelayConfig, device: Arc<dyn VirtualDevice>) -> Result<Self> {
        Self::build(config, Some(device))
    }

    fn build(config: RelayConfig, device: Option<Arc<dyn VirtualDevice>>) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            roster: Roster::new(config.max_peers),
            metrics: Metrics::new(),
            cancel: CancelToken::new(),
            wait: config.wait_interval(),
            buffer_size: config.buffer_size,
        });

        Ok(Relay {
            config,
            device,
            shared,
            lifecycle: Mutex::new(Lifecycle {
                state: State::Created,
                listener: None,
                device_loop: None,
                peer_loop: None,
            }),
        })
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    /// Add an already connected peer, typically an outbound connection made
    /// before `start()`. Subject to the same capacity as accepted peers.
    pub fn add_peer(&self, stream: TcpStream) -> std::result::Result<PeerId, RosterFull> {
        let id = self.shared.roster.add(stream)?;
        Metrics::add(&self.shared.metrics.peers_admitted_total, 1);
        Ok(id)
    }

    /// Start the worker loops.
    ///
    /// With `listen` set, binds the listening socket first; a bind failure
    /// is returned and nothing is started. Returns the bound port (useful
    /// when `port` is 0).
    pub fn start(&self, port: u16, listen: bool) -> Result<Option<u16>> {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.state != State::Created {
            return Err(RelayError::AlreadyStarted);
        }

        let listener = if listen {
            let socket = ListeningSocket::bind(port, self.config.use_ipv6, self.config.public)?;
            Some(Arc::new(socket))
        } else {
            None
        };
        let local_port = listener.as_ref().map(|l| l.port());

        let peer_loop = PeerLoop::new(
            Arc::clone(&self.shared),
            listener.clone(),
            self.device.clone(),
        )?;

        let device_handle = match &self.device {
            Some(device) => {
                let device = Arc::clone(device);
                let shared = Arc::clone(&self.shared);
                Some(
                    thread::Builder::new()
                        .name("tap-relay-device".to_string())
                        .spawn(move || device_loop::run(device, shared))?,
                )
            }
            None => None,
        };

        let peer_handle = match thread::Builder::new()
            .name("tap-relay-peers".to_string())
            .spawn(move || peer_loop.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.cancel.cancel();
                if let Some(handle) = device_handle {
                    let _ = handle.join();
                }
                lifecycle.state = State::Stopped;
                return Err(e.into());
            }
        };

        lifecycle.state = State::Running;
        lifecycle.listener = listener;
        lifecycle.device_loop = device_handle;
        lifecycle.peer_loop = Some(peer_handle);

        log::info!(
            "Relay started ({}, {}, max {} peers)",
            match local_port {
                Some(port) => format!("listening on port {}", port),
                None => "not listening".to_string(),
            },
            if self.device.is_some() {
                "device attached"
            } else {
                "forwarder mode"
            },
            self.config.max_peers
        );

        Ok(local_port)
    }

    /// Stop the worker loops, wait for them, then close the listener and
    /// every peer. Later calls return immediately.
    pub fn stop(&self) {
        let (device_loop, peer_loop, listener) = {
            let mut lifecycle = self.lock_lifecycle();
            if lifecycle.state == State::Stopped {
                return;
            }
            lifecycle.state = State::Stopped;
            self.shared.cancel.cancel();
            (
                lifecycle.device_loop.take(),
                lifecycle.peer_loop.take(),
                lifecycle.listener.take(),
            )
        };

        for (name, handle) in [("device", device_loop), ("peer", peer_loop)] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    log::error!("The {} loop panicked", name);
                }
            }
        }

        if let Some(mut listener) = listener {
            match Arc::get_mut(&mut listener) {
                Some(socket) => socket.destroy(),
                None => log::warn!("Listener still shared after shutdown"),
            }
        }

        let closed = self.shared.roster.clear();
        log::info!("Relay stopped ({} peers closed)", closed);
    }

    /// Number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.shared.roster.count()
    }

    /// Current peers in roster order.
    pub fn peers(&self) -> Vec<Peer> {
        self.shared.roster.snapshot()
    }

    /// True once `stop()` was called or a fatal device error cancelled the
    /// relay.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// True when both worker loops have ended (or the relay is stopped).
    pub fn is_finished(&self) -> bool {
        let lifecycle = self.lock_lifecycle();
        match lifecycle.state {
            State::Created => false,
            State::Stopped => true,
            State::Running => [&lifecycle.device_loop, &lifecycle.peer_loop]
                .iter()
                .all(|handle| handle.as_ref().map_or(true, |h| h.is_finished())),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    /// Prometheus text rendering of the metrics.
    pub fn render_metrics(&self) -> String {
        self.shared.metrics.render(self.shared.roster.count())
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.stop();
    }
}
