//! Peer multiplex loop.
//!
//! One `mio::Poll` watches the listening socket and every roster member.
//! Peer sockets stay blocking; readiness only tells the loop which peers
//! have a frame to read. Registrations are refreshed from a roster snapshot
//! on every pass, which also re-arms the edge-triggered sources that were
//! not drained completely on the previous pass.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::TcpStream;
use std::ops::ControlFlow;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use super::Shared;
use crate::device::VirtualDevice;
use crate::framing::read_frame;
use crate::listener::ListeningSocket;
use crate::metrics::Metrics;
use crate::roster::{Peer, PeerId};

// ============================================================================
// Constants
// ============================================================================

const LISTENER_TOKEN: Token = Token(0);

/// Peer ids start at 1, so peer tokens never collide with the listener's
fn peer_token(id: PeerId) -> Token {
    Token(id.as_u64() as usize)
}

// ============================================================================
// Peer Loop
// ============================================================================

pub(super) struct PeerLoop {
    poll: Poll,
    events: Events,
    shared: Arc<Shared>,
    listener: Option<Arc<ListeningSocket>>,
    device: Option<Arc<dyn VirtualDevice>>,
    /// Peers registered with `poll`. Holding a clone keeps the fd open
    /// until it has been deregistered.
    registered: HashMap<Token, Peer>,
    listener_registered: bool,
    buf: Vec<u8>,
}

impl PeerLoop {
    pub(super) fn new(
        shared: Arc<Shared>,
        listener: Option<Arc<ListeningSocket>>,
        device: Option<Arc<dyn VirtualDevice>>,
    ) -> io::Result<Self> {
        let buf = vec![0u8; shared.buffer_size];
        Ok(PeerLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(128),
            shared,
            listener,
            device,
            registered: HashMap::new(),
            listener_registered: false,
            buf,
        })
    }

    pub(super) fn run(mut self) {
        log::info!("Starting peer loop");

        if let Err(e) = self.run_inner() {
            log::error!("Peer loop failed: {}", e);
        }

        log::info!("Stopping peer loop");
    }

    fn run_inner(&mut self) -> io::Result<()> {
        while !self.shared.cancel.is_cancelled() {
            let members = self.shared.roster.snapshot();
            let accepting =
                self.listener.is_some() && members.len() < self.shared.roster.capacity();

            if !accepting && members.is_empty() {
                log::info!("No listener and no peers left");
                return Ok(());
            }

            self.sync_registrations(&members, accepting)?;

            match self.poll.poll(&mut self.events, Some(self.shared.wait)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            if self.shared.cancel.is_cancelled() {
                break;
            }

            let ready: HashSet<Token> = self.events.iter().map(|event| event.token()).collect();
            if ready.is_empty() {
                continue;
            }

            for peer in &members {
                if !ready.contains(&peer_token(peer.id())) {
                    continue;
                }
                if let ControlFlow::Break(()) = self.read_from_peer(peer) {
                    return Ok(());
                }
            }

            if accepting && ready.contains(&LISTENER_TOKEN) {
                self.accept_one()?;
            }
        }

        Ok(())
    }

    // ========================================================================
    // Registration
    // ========================================================================

    fn sync_registrations(&mut self, members: &[Peer], accepting: bool) -> io::Result<()> {
        let registry = self.poll.registry();

        if let Some(fd) = self.listener.as_ref().and_then(|l| l.raw_fd()) {
            let mut source = SourceFd(&fd);
            match (accepting, self.listener_registered) {
                (true, false) => {
                    registry.register(&mut source, LISTENER_TOKEN, Interest::READABLE)?;
                    self.listener_registered = true;
                }
                (true, true) => {
                    registry.reregister(&mut source, LISTENER_TOKEN, Interest::READABLE)?;
                }
                (false, true) => {
                    log::debug!("Roster full, not accepting");
                    registry.deregister(&mut source)?;
                    self.listener_registered = false;
                }
                (false, false) => {}
            }
        }

        let current: HashSet<Token> = members.iter().map(|p| peer_token(p.id())).collect();
        let departed: Vec<Token> = self
            .registered
            .keys()
            .filter(|token| !current.contains(token))
            .copied()
            .collect();
        for token in departed {
            if let Some(peer) = self.registered.remove(&token) {
                let fd = peer.stream().as_raw_fd();
                if let Err(e) = registry.deregister(&mut SourceFd(&fd)) {
                    log::debug!("Failed to deregister {}: {}", peer, e);
                }
            }
        }

        let mut failed = Vec::new();
        for peer in members {
            let token = peer_token(peer.id());
            let fd = peer.stream().as_raw_fd();
            let result = if self.registered.contains_key(&token) {
                registry.reregister(&mut SourceFd(&fd), token, Interest::READABLE)
            } else {
                registry
                    .register(&mut SourceFd(&fd), token, Interest::READABLE)
                    .map(|()| {
                        self.registered.insert(token, peer.clone());
                    })
            };
            if let Err(e) = result {
                log::warn!("Failed to watch {}: {}", peer, e);
                failed.push(peer.id());
            }
        }

        for id in failed {
            self.drop_peer(id);
        }

        Ok(())
    }

    // ========================================================================
    // Peer Traffic
    // ========================================================================

    /// Read one frame from `peer` and route it. Breaks when the relay has
    /// been cancelled because the device cannot be written.
    fn read_from_peer(&mut self, peer: &Peer) -> ControlFlow<()> {
        let mut stream: &TcpStream = peer.stream();
        let len = match read_frame(&mut stream, &mut self.buf) {
            Ok(len) => len,
            Err(e) => {
                log::info!("Dropping {}: {}", peer, e);
                self.drop_peer(peer.id());
                return ControlFlow::Continue(());
            }
        };

        log::trace!("Read {} bytes from {}", len, peer);
        let frame = &self.buf[..len];

        match &self.device {
            Some(_) if frame.is_empty() => {
                log::trace!("Ignoring empty frame from {}", peer);
            }
            Some(device) => match device.write_frame(frame) {
                Ok(written) if written > 0 => {
                    Metrics::add(&self.shared.metrics.device_frames_out_total, 1);
                    Metrics::add(&self.shared.metrics.device_bytes_out_total, written as u64);
                }
                result => {
                    match result {
                        Err(e) => log::error!("Device write failed: {}", e),
                        Ok(_) => log::error!("Device write failed: device closed"),
                    }
                    self.shared.cancel.cancel();
                    return ControlFlow::Break(());
                }
            },
            None => match self.shared.roster.broadcast(frame, Some(peer.id())) {
                Ok(outcome) => {
                    log::trace!("Relayed {} bytes to {} peers", len, outcome.delivered);
                    Metrics::add(&self.shared.metrics.peer_frames_relayed_total, 1);
                    Metrics::add(
                        &self.shared.metrics.peers_dropped_total,
                        outcome.dropped.len() as u64,
                    );
                }
                Err(e) => log::warn!("Dropping frame from {}: {}", peer, e),
            },
        }

        ControlFlow::Continue(())
    }

    fn drop_peer(&self, id: PeerId) {
        if self.shared.roster.remove(id) {
            Metrics::add(&self.shared.metrics.peers_dropped_total, 1);
        }
    }

    // ========================================================================
    // Accept
    // ========================================================================

    /// Accept one pending connection and try to admit it. Transient accept
    /// failures are logged; anything else ends the loop.
    fn accept_one(&self) -> io::Result<()> {
        let Some(listener) = &self.listener else {
            return Ok(());
        };

        match listener.accept() {
            Ok((stream, addr)) => {
                match self.shared.roster.add(stream) {
                    Ok(id) => {
                        Metrics::add(&self.shared.metrics.peers_admitted_total, 1);
                        log::info!("Accepted {} from {}", id, addr);
                    }
                    Err(full) => {
                        Metrics::add(&self.shared.metrics.peers_rejected_total, 1);
                        log::debug!("Rejected connection from {}: {}", addr, full);
                    }
                }
                Ok(())
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::ConnectionAborted
                ) =>
            {
                log::debug!("Accept interrupted: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
