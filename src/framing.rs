//! Length-prefixed framing for link-layer frames on a TCP stream.
//!
//! # Format
//!
//! ```text
//! +--------+--------+------------------------+
//! | Length (2 bytes)| Payload (Length bytes) |
//! | (big-endian)    |                        |
//! +--------+--------+------------------------+
//! ```
//!
//! There is no handshake, acknowledgement or heartbeat. A peer is alive as
//! long as reads and writes on it succeed.

use std::io::{Read, Write};

use crate::error::FrameError;

// ============================================================================
// Constants
// ============================================================================

/// Length of the frame header (2 bytes for length)
pub const HEADER_LEN: usize = 2;

/// Largest payload the header can describe
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Default receive buffer size; longer frames from peers are rejected
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

// ============================================================================
// Encoding
// ============================================================================

/// Encode a payload with its 2-byte length prefix.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            capacity: MAX_FRAME_LEN,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);

    Ok(buf)
}

// ============================================================================
// Stream-based I/O
// ============================================================================

/// Write one frame to a writer, blocking until all of it is sent.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let encoded = encode_frame(payload)?;
    writer
        .write_all(&encoded)
        .map_err(FrameError::from_transfer)
}

/// Read one frame into `buf`, returning the payload length.
///
/// The capacity is `buf.len()`. A declared length above it is a protocol
/// error; the payload is not consumed and the stream must be dropped.
pub fn read_frame<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(FrameError::from_transfer)?;

    let len = u16::from_be_bytes(header) as usize;
    if len > buf.len() {
        return Err(FrameError::TooLarge {
            len,
            capacity: buf.len(),
        });
    }

    reader
        .read_exact(&mut buf[..len])
        .map_err(FrameError::from_transfer)?;

    Ok(len)
}
