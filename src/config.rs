//! Relay configuration.
//!
//! Values come from defaults, optionally overlaid by a JSON file, then by
//! command line flags. The configuration is fixed once a relay is built.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{RelayError, Result};
use crate::framing::{DEFAULT_BUFFER_SIZE, MAX_FRAME_LEN};

/// Default peer capacity
pub const DEFAULT_MAX_PEERS: usize = 5;

/// Default bounded wait for both worker loops, in milliseconds
pub const DEFAULT_WAIT_MS: u64 = 50;

/// Relay settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Roster capacity; connections beyond it are not admitted
    pub max_peers: usize,
    /// Bounded wait for device readability and socket readiness. Also the
    /// upper bound on shutdown latency.
    pub wait_ms: u64,
    /// Receive buffer size; caps accepted frame lengths
    pub buffer_size: usize,
    /// Listen on IPv6 instead of IPv4 (needs the `ipv6` feature)
    pub use_ipv6: bool,
    /// Listen on the wildcard address instead of loopback
    pub public: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            wait_ms: DEFAULT_WAIT_MS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            use_ipv6: false,
            public: true,
        }
    }
}

impl RelayConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RelayConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| RelayError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Set the roster capacity.
    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Set the bounded wait interval in milliseconds.
    pub fn with_wait_ms(mut self, wait_ms: u64) -> Self {
        self.wait_ms = wait_ms;
        self
    }

    /// Set the receive buffer size.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_ipv6(mut self, use_ipv6: bool) -> Self {
        self.use_ipv6 = use_ipv6;
        self
    }

    pub fn with_public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_peers == 0 {
            return Err(RelayError::InvalidConfig(
                "max_peers must be at least 1".to_string(),
            ));
        }
        if self.wait_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "wait_ms must be at least 1".to_string(),
            ));
        }
        if self.buffer_size == 0 || self.buffer_size > MAX_FRAME_LEN {
            return Err(RelayError::InvalidConfig(format!(
                "buffer_size must be between 1 and {}",
                MAX_FRAME_LEN
            )));
        }
        Ok(())
    }

    /// The bounded wait as a [`Duration`].
    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}
