//! Virtual network device seam.
//!
//! The relay never configures the interface itself (addresses, MTU, link
//! state). It only needs to read whole frames, write whole frames and wait
//! for readability with a timeout.

use std::io;
use std::time::Duration;

mod memory;
#[cfg(target_os = "linux")]
pub mod tap;

pub use memory::MemoryDevice;

/// A frame-oriented duplex device, shared by both worker loops.
///
/// Each call moves exactly one frame. Implementations must allow a read on
/// one thread concurrently with a write on another.
pub trait VirtualDevice: Send + Sync {
    /// Read one frame into `buf`, returning its length. `Ok(0)` means the
    /// device is gone.
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one frame, returning the number of bytes accepted.
    fn write_frame(&self, frame: &[u8]) -> io::Result<usize>;

    /// Wait up to `timeout` for a frame to become readable.
    fn wait_readable(&self, timeout: Duration) -> bool;
}
