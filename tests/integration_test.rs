//! Integration tests for the relay
//!
//! These drive a running relay over real loopback TCP connections, with an
//! in-memory device standing in for the TAP interface.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tap_relay::framing::{read_frame, write_frame};
use tap_relay::{MemoryDevice, Relay, RelayConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_config() -> RelayConfig {
    RelayConfig::default().with_wait_ms(10).with_public(false)
}

/// Poll `condition` until it holds or the timeout passes
fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
}

/// Connect and wait until the relay has admitted the connection
fn connect_admitted(relay: &Relay, port: u16) -> TcpStream {
    let expected = relay.peer_count() + 1;
    let stream = connect(port);
    assert!(wait_for(|| relay.peer_count() == expected), "peer not admitted");
    stream
}

fn recv(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = [0u8; 4096];
    let len = read_frame(stream, &mut buf).unwrap();
    buf[..len].to_vec()
}

/// Assert nothing arrives on `stream` for a short while
fn assert_silent(stream: &mut TcpStream) {
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
        other => panic!("expected no data, got {:?}", other),
    }
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
}

/// Assert the relay closed its side of `stream`
fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Err(e) if e.kind() != ErrorKind::WouldBlock && e.kind() != ErrorKind::TimedOut => {}
        other => panic!("expected closed connection, got {:?}", other),
    }
}

// ============================================================================
// Device Mode
// ============================================================================

#[test]
fn test_capacity_two_scenario() {
    init_logging();
    let device = Arc::new(MemoryDevice::new());
    let relay = Relay::with_device(test_config().with_max_peers(2), device.clone()).unwrap();
    let port = relay.start(0, true).unwrap().unwrap();

    let mut a = connect_admitted(&relay, port);
    let mut b = connect_admitted(&relay, port);

    // The third connection is never admitted
    let _c = connect(port);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(relay.peer_count(), 2);

    device.inject(vec![0xAA, 0xBB]);

    for remote in [&mut a, &mut b] {
        let mut wire = [0u8; 4];
        remote.read_exact(&mut wire).unwrap();
        assert_eq!(wire, [0x00, 0x02, 0xAA, 0xBB]);
    }

    relay.stop();
}

#[test]
fn test_peer_frames_reach_device() {
    init_logging();
    let device = Arc::new(MemoryDevice::new());
    let relay = Relay::with_device(test_config(), device.clone()).unwrap();
    let port = relay.start(0, true).unwrap().unwrap();

    let mut a = connect_admitted(&relay, port);
    let mut b = connect_admitted(&relay, port);

    write_frame(&mut a, b"from a").unwrap();
    write_frame(&mut a, b"again").unwrap();
    write_frame(&mut b, b"from b").unwrap();

    let written = device.wait_written(3, TIMEOUT);
    assert_eq!(written.len(), 3);
    assert!(written.contains(&b"from b".to_vec()));

    // Frames from one peer keep their order
    let from_a: Vec<_> = written.iter().filter(|f| f.as_slice() != b"from b").collect();
    assert_eq!(from_a, vec![&b"from a".to_vec(), &b"again".to_vec()]);

    // With a device bound, peers never see each other's frames
    assert_silent(&mut b);

    relay.stop();
}

#[test]
fn test_over_length_frame_drops_only_sender() {
    init_logging();
    let device = Arc::new(MemoryDevice::new());
    let relay =
        Relay::with_device(test_config().with_buffer_size(16), device.clone()).unwrap();
    let port = relay.start(0, true).unwrap().unwrap();

    let mut a = connect_admitted(&relay, port);
    let mut b = connect_admitted(&relay, port);

    let mut wire = vec![0x00, 0x20];
    wire.extend_from_slice(&[0x55; 32]);
    a.write_all(&wire).unwrap();

    assert!(wait_for(|| relay.peer_count() == 1));
    assert_closed(&mut a);
    assert!(device.written().is_empty());

    device.inject(b"still here".to_vec());
    assert_eq!(recv(&mut b), b"still here");

    relay.stop();
}

#[test]
fn test_failed_peer_removed_others_still_served() {
    init_logging();
    let device = Arc::new(MemoryDevice::new());
    let relay = Relay::with_device(test_config(), device.clone()).unwrap();
    let port = relay.start(0, true).unwrap().unwrap();

    let a = connect_admitted(&relay, port);
    let mut b = connect_admitted(&relay, port);

    drop(a);
    assert!(wait_for(|| relay.peer_count() == 1));

    device.inject(b"tick".to_vec());
    assert_eq!(recv(&mut b), b"tick");
    assert!(relay.metrics().peers_dropped_total.load(Ordering::Relaxed) >= 1);

    relay.stop();
}

#[test]
fn test_device_write_failure_cancels_relay() {
    init_logging();
    let device = Arc::new(MemoryDevice::new());
    let relay = Relay::with_device(test_config(), device.clone()).unwrap();
    let port = relay.start(0, true).unwrap().unwrap();

    let mut a = connect_admitted(&relay, port);
    device.fail_writes();
    write_frame(&mut a, b"doomed").unwrap();

    assert!(wait_for(|| relay.is_cancelled()));
    assert!(wait_for(|| relay.is_finished()));

    relay.stop();
    assert_closed(&mut a);
}

#[test]
fn test_device_eof_ends_only_device_loop() {
    init_logging();
    let device = Arc::new(MemoryDevice::new());
    let relay = Relay::with_device(test_config(), device.clone()).unwrap();
    let port = relay.start(0, true).unwrap().unwrap();

    device.close();
    thread::sleep(Duration::from_millis(100));
    assert!(!relay.is_cancelled());
    assert!(!relay.is_finished());

    // The peer side keeps working
    let mut a = connect_admitted(&relay, port);
    write_frame(&mut a, b"after eof").unwrap();
    assert_eq!(device.wait_written(1, TIMEOUT), vec![b"after eof".to_vec()]);

    relay.stop();
}

#[test]
fn test_outbound_peer_without_listener() {
    init_logging();
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let outbound = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    let (mut remote, _) = server.accept().unwrap();
    remote
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    let device = Arc::new(MemoryDevice::new());
    let relay = Relay::with_device(test_config(), device.clone()).unwrap();
    relay.add_peer(outbound).unwrap();
    assert_eq!(relay.start(0, false).unwrap(), None);

    device.inject(b"to server".to_vec());
    assert_eq!(recv(&mut remote), b"to server");

    write_frame(&mut remote, b"from server").unwrap();
    assert_eq!(
        device.wait_written(1, TIMEOUT),
        vec![b"from server".to_vec()]
    );

    // Losing the only peer leaves nothing to monitor
    drop(remote);
    assert!(wait_for(|| relay.peer_count() == 0));
    assert!(!relay.is_cancelled());

    relay.stop();
}

#[test]
fn test_pre_seeded_peer_counts_against_capacity() {
    init_logging();
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let outbound = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    let (_remote, _) = server.accept().unwrap();

    let relay = Relay::with_device(
        test_config().with_max_peers(1),
        Arc::new(MemoryDevice::new()),
    )
    .unwrap();
    relay.add_peer(outbound).unwrap();
    let port = relay.start(0, true).unwrap().unwrap();

    let _late = connect(port);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(relay.peer_count(), 1);

    relay.stop();
}

// ============================================================================
// Forwarder Mode
// ============================================================================

#[test]
fn test_forwarder_relays_to_others_only() {
    init_logging();
    let relay = Relay::new(test_config()).unwrap();
    let port = relay.start(0, true).unwrap().unwrap();

    let mut a = connect_admitted(&relay, port);
    let mut b = connect_admitted(&relay, port);
    let mut c = connect_admitted(&relay, port);

    write_frame(&mut a, b"ping").unwrap();
    assert_eq!(recv(&mut b), b"ping");
    assert_eq!(recv(&mut c), b"ping");
    assert_silent(&mut a);

    write_frame(&mut b, b"pong").unwrap();
    assert_eq!(recv(&mut a), b"pong");
    assert_eq!(recv(&mut c), b"pong");
    assert_silent(&mut b);

    assert!(wait_for(|| {
        relay
            .metrics()
            .peer_frames_relayed_total
            .load(Ordering::Relaxed)
            == 2
    }));

    relay.stop();
}

#[test]
fn test_forwarder_empty_frame() {
    init_logging();
    let relay = Relay::new(test_config()).unwrap();
    let port = relay.start(0, true).unwrap().unwrap();

    let mut a = connect_admitted(&relay, port);
    let mut b = connect_admitted(&relay, port);

    write_frame(&mut a, b"").unwrap();
    let mut wire = [0u8; 2];
    b.read_exact(&mut wire).unwrap();
    assert_eq!(wire, [0x00, 0x00]);

    relay.stop();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_stop_closes_peers_and_listener() {
    init_logging();
    let relay = Relay::with_device(test_config(), Arc::new(MemoryDevice::new())).unwrap();
    let port = relay.start(0, true).unwrap().unwrap();
    let mut a = connect_admitted(&relay, port);

    let started = Instant::now();
    relay.stop();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(relay.peer_count(), 0);
    assert_closed(&mut a);
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());

    // Second stop is a no-op
    relay.stop();
    assert!(relay.is_finished());
}

#[test]
fn test_concurrent_stop() {
    init_logging();
    let relay = Arc::new(
        Relay::with_device(test_config(), Arc::new(MemoryDevice::new())).unwrap(),
    );
    relay.start(0, true).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let relay = Arc::clone(&relay);
            thread::spawn(move || relay.stop())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(relay.is_finished());
}

#[test]
fn test_metrics_track_traffic() {
    init_logging();
    let device = Arc::new(MemoryDevice::new());
    let relay = Relay::with_device(test_config(), device.clone()).unwrap();
    let port = relay.start(0, true).unwrap().unwrap();

    let mut a = connect_admitted(&relay, port);
    device.inject(vec![1, 2, 3]);
    assert_eq!(recv(&mut a), vec![1, 2, 3]);

    write_frame(&mut a, &[9; 10]).unwrap();
    device.wait_written(1, TIMEOUT);

    let metrics = relay.metrics();
    assert!(wait_for(|| metrics.device_frames_out_total.load(Ordering::Relaxed) == 1));
    assert_eq!(metrics.peers_admitted_total.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.device_frames_in_total.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.device_bytes_in_total.load(Ordering::Relaxed), 3);
    assert_eq!(metrics.device_bytes_out_total.load(Ordering::Relaxed), 10);

    let rendered = relay.render_metrics();
    assert!(rendered.contains("tap_relay_active_peers 1\n"));
    assert!(rendered.contains("tap_relay_device_frames_in_total 1\n"));

    relay.stop();
}
