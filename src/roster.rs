//! Bounded roster of connected peers.
//!
//! The roster is shared by both worker loops behind a single mutex. Every
//! operation takes the lock for its whole duration and releases it before
//! returning; no index or guard escapes, so callers identify peers by
//! [`PeerId`] rather than by position.
//!
//! Members stay densely packed in `[0, count)`: removing one shifts every
//! later member down by one position.

use std::fmt;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::error::FrameError;
use crate::framing::encode_frame;

// ============================================================================
// Peer
// ============================================================================

/// Stable identity of a roster member, assigned on admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// A connected peer. Clones share the same socket.
#[derive(Debug, Clone)]
pub struct Peer {
    id: PeerId,
    addr: Option<SocketAddr>,
    stream: Arc<TcpStream>,
}

impl Peer {
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Remote address, if the socket could report one at admission
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Shut the connection down so the remote end sees it closed even while
    /// other clones of this handle are still alive.
    fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "{} ({})", self.id, addr),
            None => write!(f, "{}", self.id),
        }
    }
}

// ============================================================================
// Roster
// ============================================================================

/// Admission was refused because the roster is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("roster full ({capacity} peers)")]
pub struct RosterFull {
    pub capacity: usize,
}

/// Result of fanning one frame out to the roster.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Broadcast {
    /// Members that received the whole frame
    pub delivered: usize,
    /// Members removed because a write to them failed
    pub dropped: Vec<PeerId>,
}

struct Members {
    peers: Vec<Peer>,
    next_id: u64,
}

/// Thread-safe, capacity-bounded set of peer connections.
pub struct Roster {
    capacity: usize,
    members: Mutex<Members>,
}

impl Roster {
    /// Create an empty roster admitting at most `capacity` peers.
    pub fn new(capacity: usize) -> Self {
        Roster {
            capacity,
            members: Mutex::new(Members {
                peers: Vec::with_capacity(capacity),
                next_id: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Members> {
        // A panic mid-operation cannot leave the Vec half-updated
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admit a connected stream. Never blocks and never queues; when the
    /// roster is full the stream is dropped, which closes it.
    pub fn add(&self, stream: TcpStream) -> Result<PeerId, RosterFull> {
        let addr = stream.peer_addr().ok();

        let mut members = self.lock();
        if members.peers.len() >= self.capacity {
            return Err(RosterFull {
                capacity: self.capacity,
            });
        }

        let id = PeerId(members.next_id);
        members.next_id += 1;
        members.peers.push(Peer {
            id,
            addr,
            stream: Arc::new(stream),
        });

        log::debug!(
            "Added {} ({}/{} peers)",
            id,
            members.peers.len(),
            self.capacity
        );
        Ok(id)
    }

    /// Remove the member at `index`, shifting later members down.
    pub fn remove_at(&self, index: usize) -> Option<Peer> {
        let mut members = self.lock();
        if index >= members.peers.len() {
            return None;
        }
        let peer = members.peers.remove(index);
        peer.close();
        log::debug!("Removed {} ({} peers left)", peer, members.peers.len());
        Some(peer)
    }

    /// Remove a member by identity. Returns false if it was already gone.
    pub fn remove(&self, id: PeerId) -> bool {
        let mut members = self.lock();
        match members.peers.iter().position(|p| p.id == id) {
            Some(index) => {
                let peer = members.peers.remove(index);
                peer.close();
                log::debug!("Removed {} ({} peers left)", peer, members.peers.len());
                true
            }
            None => false,
        }
    }

    /// Remove and close every member. Returns how many there were.
    pub fn clear(&self) -> usize {
        let mut members = self.lock();
        let count = members.peers.len();
        for peer in members.peers.drain(..) {
            peer.close();
        }
        count
    }

    pub fn count(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.capacity
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.lock().peers.iter().any(|p| p.id == id)
    }

    /// Copy of the current members in index order.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.lock().peers.clone()
    }

    /// Write one frame to every member except `except`, in index order,
    /// holding the lock for the whole pass.
    ///
    /// A member whose write fails is removed once the pass is complete; the
    /// remaining members still receive the frame.
    pub fn broadcast(&self, payload: &[u8], except: Option<PeerId>) -> Result<Broadcast, FrameError> {
        let wire = encode_frame(payload)?;
        let mut outcome = Broadcast::default();

        let mut members = self.lock();
        for peer in members.peers.iter() {
            if Some(peer.id) == except {
                continue;
            }

            let mut stream: &TcpStream = &peer.stream;
            match stream.write_all(&wire) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    log::debug!("Write to {} failed: {}", peer, e);
                    outcome.dropped.push(peer.id);
                }
            }
        }

        if !outcome.dropped.is_empty() {
            members.peers.retain(|p| {
                if outcome.dropped.contains(&p.id) {
                    p.close();
                    false
                } else {
                    true
                }
            });
            log::debug!(
                "Dropped {} peer(s) during broadcast ({} left)",
                outcome.dropped.len(),
                members.peers.len()
            );
        }

        Ok(outcome)
    }
}
