//! Lightweight Prometheus-compatible metrics for the relay.
//!
//! Uses atomic counters for lock-free instrumentation from both worker
//! loops. Renders metrics in Prometheus text exposition format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Relay counters.
pub struct Metrics {
    /// Peers admitted to the roster, accepted or pre-seeded (counter)
    pub peers_admitted_total: AtomicU64,
    /// Connections dropped because the roster was full (counter)
    pub peers_rejected_total: AtomicU64,
    /// Peers removed after a read/write failure or protocol error (counter)
    pub peers_dropped_total: AtomicU64,
    /// Frames read from the device and broadcast (counter)
    pub device_frames_in_total: AtomicU64,
    /// Bytes read from the device (counter)
    pub device_bytes_in_total: AtomicU64,
    /// Frames written to the device (counter)
    pub device_frames_out_total: AtomicU64,
    /// Bytes written to the device (counter)
    pub device_bytes_out_total: AtomicU64,
    /// Frames relayed between peers in forwarder mode (counter)
    pub peer_frames_relayed_total: AtomicU64,
    /// Relay start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            peers_admitted_total: AtomicU64::new(0),
            peers_rejected_total: AtomicU64::new(0),
            peers_dropped_total: AtomicU64::new(0),
            device_frames_in_total: AtomicU64::new(0),
            device_bytes_in_total: AtomicU64::new(0),
            device_frames_out_total: AtomicU64::new(0),
            device_bytes_out_total: AtomicU64::new(0),
            peer_frames_relayed_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format. `active_peers`
    /// is the current roster size, sampled by the caller.
    pub fn render(&self, active_peers: usize) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP tap_relay_active_peers Current number of connected peers\n\
             # TYPE tap_relay_active_peers gauge\n\
             tap_relay_active_peers {}\n\
             # HELP tap_relay_peers_admitted_total Total peers admitted to the roster\n\
             # TYPE tap_relay_peers_admitted_total counter\n\
             tap_relay_peers_admitted_total {}\n\
             # HELP tap_relay_peers_rejected_total Total connections dropped with the roster full\n\
             # TYPE tap_relay_peers_rejected_total counter\n\
             tap_relay_peers_rejected_total {}\n\
             # HELP tap_relay_peers_dropped_total Total peers removed after an I/O or protocol error\n\
             # TYPE tap_relay_peers_dropped_total counter\n\
             tap_relay_peers_dropped_total {}\n\
             # HELP tap_relay_device_frames_in_total Total frames read from the device\n\
             # TYPE tap_relay_device_frames_in_total counter\n\
             tap_relay_device_frames_in_total {}\n\
             # HELP tap_relay_device_bytes_in_total Total bytes read from the device\n\
             # TYPE tap_relay_device_bytes_in_total counter\n\
             tap_relay_device_bytes_in_total {}\n\
             # HELP tap_relay_device_frames_out_total Total frames written to the device\n\
             # TYPE tap_relay_device_frames_out_total counter\n\
             tap_relay_device_frames_out_total {}\n\
             # HELP tap_relay_device_bytes_out_total Total bytes written to the device\n\
             # TYPE tap_relay_device_bytes_out_total counter\n\
             tap_relay_device_bytes_out_total {}\n\
             # HELP tap_relay_peer_frames_relayed_total Total frames relayed between peers\n\
             # TYPE tap_relay_peer_frames_relayed_total counter\n\
             tap_relay_peer_frames_relayed_total {}\n\
             # HELP tap_relay_uptime_seconds Relay uptime in seconds\n\
             # TYPE tap_relay_uptime_seconds gauge\n\
             tap_relay_uptime_seconds {}\n",
            active_peers,
            self.peers_admitted_total.load(Ordering::Relaxed),
            self.peers_rejected_total.load(Ordering::Relaxed),
            self.peers_dropped_total.load(Ordering::Relaxed),
            self.device_frames_in_total.load(Ordering::Relaxed),
            self.device_bytes_in_total.load(Ordering::Relaxed),
            self.device_frames_out_total.load(Ordering::Relaxed),
            self.device_bytes_out_total.load(Ordering::Relaxed),
            self.peer_frames_relayed_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_default_zero() {
        let m = Metrics::new();
        assert_eq!(m.peers_admitted_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.peers_rejected_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.peers_dropped_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.device_frames_in_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.device_frames_out_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.peer_frames_relayed_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_metrics_render_counters() {
        let m = Metrics::new();
        Metrics::add(&m.peers_admitted_total, 3);
        Metrics::add(&m.device_bytes_in_total, 1514);
        Metrics::add(&m.peer_frames_relayed_total, 7);

        let output = m.render(2);
        assert!(output.contains("tap_relay_active_peers 2\n"));
        assert!(output.contains("tap_relay_peers_admitted_total 3\n"));
        assert!(output.contains("tap_relay_device_bytes_in_total 1514\n"));
        assert!(output.contains("tap_relay_peer_frames_relayed_total 7\n"));
        assert!(output.contains("tap_relay_uptime_seconds 0\n"));
    }

    #[test]
    fn test_metrics_render_prometheus_format() {
        let output = Metrics::new().render(0);
        for line in output.lines() {
            if let Some(rest) = line.strip_prefix("# TYPE ") {
                let kind = rest.rsplit(' ').next().unwrap();
                assert!(kind == "gauge" || kind == "counter", "bad TYPE line: {}", line);
            } else if !line.starts_with("# HELP ") {
                let value = line.rsplit(' ').next().unwrap();
                assert!(value.parse::<u64>().is_ok(), "bad sample line: {}", line);
            }
        }
        assert_eq!(output.matches("# TYPE ").count(), 10);
    }
}
