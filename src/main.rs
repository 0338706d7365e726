//! TAP Relay
//!
//! Runs the relay in one of three modes:
//! - `server`: attach a TAP device and accept peers
//! - `client`: attach a TAP device and connect out to a server
//! - `forwarder`: no device, relay frames between accepted peers

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag;

use tap_relay::{Relay, RelayConfig, RelayError, VirtualDevice};

// ============================================================================
// Command Line
// ============================================================================

#[derive(Parser)]
#[command(name = "tap-relay")]
#[command(version)]
#[command(about = "Relay Ethernet frames between a TAP device and TCP peers")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Maximum number of connected peers
    #[arg(long, global = true)]
    max_peers: Option<usize>,

    /// Wait interval for both loops, in milliseconds
    #[arg(long, global = true)]
    wait_ms: Option<u64>,

    /// Listen on IPv6 instead of IPv4
    #[arg(long, global = true)]
    ipv6: bool,

    /// Listen on loopback only
    #[arg(long, global = true)]
    loopback: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach a TAP device and accept peers on PORT
    Server {
        port: u16,
        /// TAP interface name (kernel-chosen when omitted)
        #[arg(long, default_value = "")]
        tap: String,
    },
    /// Attach a TAP device and connect to a server at HOST:PORT
    Client {
        /// Connect over IPv4
        #[arg(short = '4', conflicts_with = "inet6")]
        inet4: bool,
        /// Connect over IPv6 (default)
        #[arg(short = '6')]
        inet6: bool,
        host: String,
        port: u16,
        /// TAP interface name (kernel-chosen when omitted)
        #[arg(long, default_value = "")]
        tap: String,
    },
    /// Relay frames between peers accepted on PORT, without a device
    Forwarder { port: u16 },
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    log::info!("TAP relay starting...");
    log::info!("  Max peers: {}", config.max_peers);
    log::info!("  Wait:      {} ms", config.wait_ms);
    log::info!("  Buffer:    {} bytes", config.buffer_size);

    let relay = match &cli.command {
        Commands::Server { port, tap } => {
            let relay = Relay::with_device(config, open_device(tap)?)?;
            relay.start(*port, true)?;
            relay
        }
        Commands::Client {
            inet4,
            host,
            port,
            tap,
            ..
        } => {
            let relay = Relay::with_device(config, open_device(tap)?)?;
            let stream = connect(host, *port, !inet4)?;
            relay.add_peer(stream)?;
            relay.start(0, false)?;
            relay
        }
        Commands::Forwarder { port } => {
            let relay = Relay::new(config)?;
            relay.start(*port, true)?;
            relay
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, Arc::clone(&shutdown))?;
    flag::register(SIGTERM, Arc::clone(&shutdown))?;

    let tick = relay.config().wait_interval().max(Duration::from_millis(100));
    while !shutdown.load(Ordering::Relaxed) && !relay.is_finished() {
        std::thread::sleep(tick);
    }

    if shutdown.load(Ordering::Relaxed) {
        log::info!("Shutdown requested");
    } else {
        log::info!("Relay loops ended");
    }

    relay.stop();
    log::info!("Final metrics:\n{}", relay.render_metrics());

    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Defaults, then the config file, then command line flags.
fn load_config(cli: &Cli) -> Result<RelayConfig, RelayError> {
    let mut config = match &cli.config {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };

    if let Some(max_peers) = cli.max_peers {
        config = config.with_max_peers(max_peers);
    }
    if let Some(wait_ms) = cli.wait_ms {
        config = config.with_wait_ms(wait_ms);
    }
    if cli.ipv6 {
        config = config.with_ipv6(true);
    }
    if cli.loopback {
        config = config.with_public(false);
    }

    config.validate()?;
    Ok(config)
}

#[cfg(target_os = "linux")]
fn open_device(name: &str) -> Result<Arc<dyn VirtualDevice>, RelayError> {
    let device = tap_relay::device::tap::TapDevice::open(name)?;
    log::info!("Using TAP device {}", device.name());
    Ok(Arc::new(device))
}

#[cfg(not(target_os = "linux"))]
fn open_device(_name: &str) -> Result<Arc<dyn VirtualDevice>, RelayError> {
    Err(RelayError::Device(
        "TAP devices are only supported on Linux".to_string(),
    ))
}

/// Connect to the first resolved address of the requested family.
fn connect(host: &str, port: u16, use_ipv6: bool) -> Result<TcpStream, Box<dyn std::error::Error>> {
    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()?
        .filter(|addr| addr.is_ipv6() == use_ipv6)
        .collect();

    if candidates.is_empty() {
        return Err(format!(
            "no {} address found for {}",
            if use_ipv6 { "IPv6" } else { "IPv4" },
            host
        )
        .into());
    }

    let mut last_error = None;
    for addr in candidates {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                log::info!("Connected to {}", addr);
                return Ok(stream);
            }
            Err(e) => {
                log::warn!("Connection to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) => Err(e.into()),
        None => Err(format!("could not connect to {}", host).into()),
    }
}
