//! Device reader loop: device frames out to every peer.

use std::io;
use std::sync::Arc;

use super::Shared;
use crate::device::VirtualDevice;
use crate::metrics::Metrics;

/// Wait for the device, drain ready frames and broadcast each one.
///
/// Ends on cancellation or when the device reports EOF or an error. The
/// peer loop keeps running either way.
pub(super) fn run(device: Arc<dyn VirtualDevice>, shared: Arc<Shared>) {
    log::info!("Starting device reader loop");

    let mut buf = vec![0u8; shared.buffer_size];

    'outer: while !shared.cancel.is_cancelled() {
        while device.wait_readable(shared.wait) {
            let len = match device.read_frame(&mut buf) {
                Ok(0) => {
                    log::warn!("Device closed");
                    break 'outer;
                }
                Ok(len) => len,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    break;
                }
                Err(e) => {
                    log::error!("Device read failed: {}", e);
                    break 'outer;
                }
            };

            log::trace!("Read {} bytes from the device", len);
            Metrics::add(&shared.metrics.device_frames_in_total, 1);
            Metrics::add(&shared.metrics.device_bytes_in_total, len as u64);

            match shared.roster.broadcast(&buf[..len], None) {
                Ok(outcome) => {
                    log::trace!("Wrote {} bytes to {} peers", len, outcome.delivered);
                    Metrics::add(
                        &shared.metrics.peers_dropped_total,
                        outcome.dropped.len() as u64,
                    );
                }
                Err(e) => log::warn!("Dropping device frame: {}", e),
            }

            if shared.cancel.is_cancelled() {
                break 'outer;
            }
        }
    }

    log::info!("Stopping device reader loop");
}
