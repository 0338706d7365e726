//! TAP frame relay
//!
//! Bridges a virtual Ethernet device to a bounded set of TCP peers:
//! - Frames read from the device are sent to every connected peer
//! - Frames received from a peer are written to the device
//! - Without a device, frames from one peer are relayed to all others
//!
//! Frames travel over TCP as a 2-byte big-endian length followed by the
//! payload (see [`framing`]).

pub mod cancel;
pub mod config;
pub mod device;
pub mod error;
pub mod framing;
pub mod listener;
pub mod metrics;
pub mod relay;
pub mod roster;

pub use cancel::CancelToken;
pub use config::RelayConfig;
pub use device::{MemoryDevice, VirtualDevice};
pub use error::{FrameError, RelayError, Result};
pub use listener::ListeningSocket;
pub use metrics::Metrics;
pub use relay::Relay;
pub use roster::{Broadcast, Peer, PeerId, Roster, RosterFull};
