//! Error types for the relay.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the relay's error type.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors surfaced to callers of the relay.
///
/// Peer-local failures never show up here; they are handled inside the
/// worker loops by dropping the offending peer.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listening socket could not be bound or put into listen state.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("relay already started")]
    AlreadyStarted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// The virtual device could not be opened or used.
    #[error("device error: {0}")]
    Device(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from the length-prefixed wire codec.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the connection (EOF or a zero-length transfer).
    #[error("connection closed")]
    Closed,

    /// Declared or requested frame length exceeds what can be handled.
    #[error("frame too large: {len} bytes (max {capacity})")]
    TooLarge { len: usize, capacity: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Map an I/O error from a blocking transfer, folding short transfers
    /// into [`FrameError::Closed`].
    pub(crate) fn from_transfer(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero => FrameError::Closed,
            _ => FrameError::Io(err),
        }
    }
}
