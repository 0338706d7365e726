//! In-process device backed by frame queues.
//!
//! Frames injected with [`MemoryDevice::inject`] are what the relay reads;
//! frames the relay writes are collected for inspection.

use std::collections::VecDeque;
use std::io;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::VirtualDevice;

#[derive(Default)]
struct Queues {
    inbound: VecDeque<Vec<u8>>,
    outbound: Vec<Vec<u8>>,
    closed: bool,
    fail_writes: bool,
}

/// Loopback-style device for forwarding without a kernel interface.
#[derive(Default)]
pub struct MemoryDevice {
    queues: Mutex<Queues>,
    readable: Condvar,
    written: Condvar,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a frame for the relay to read.
    pub fn inject(&self, frame: impl Into<Vec<u8>>) {
        self.lock().inbound.push_back(frame.into());
        self.readable.notify_all();
    }

    /// Mark the device as gone. Queued frames are still delivered, then
    /// reads return `Ok(0)`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_all();
    }

    /// Make every later write fail.
    pub fn fail_writes(&self) {
        self.lock().fail_writes = true;
    }

    /// Frames written by the relay so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().outbound.clone()
    }

    /// Wait until at least `count` frames have been written or `timeout`
    /// passes, then return everything written so far.
    pub fn wait_written(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut queues = self.lock();
        while queues.outbound.len() < count {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            queues = self
                .written
                .wait_timeout(queues, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        queues.outbound.clone()
    }
}

impl VirtualDevice for MemoryDevice {
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut queues = self.lock();
        match queues.inbound.pop_front() {
            Some(frame) => {
                // Oversized frames are truncated, like a short read on a TAP fd
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(len)
            }
            None if queues.closed => Ok(0),
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
        let mut queues = self.lock();
        if queues.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device write failed"));
        }
        queues.outbound.push(frame.to_vec());
        drop(queues);
        self.written.notify_all();
        Ok(frame.len())
    }

    fn wait_readable(&self, timeout: Duration) -> bool {
        let queues = self.lock();
        let (queues, _) = self
            .readable
            .wait_timeout_while(queues, timeout, |q| q.inbound.is_empty() && !q.closed)
            .unwrap_or_else(PoisonError::into_inner);
        !queues.inbound.is_empty() || queues.closed
    }
}
