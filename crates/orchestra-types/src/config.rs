//! Orchestration configuration types.
//!
//! Every field has a default so a partial (or missing) `config.toml` still
//! yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Top-level configuration shared by servers, clients and listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Address servers and listeners bind to. Loopback by default.
    pub bind_address: IpAddr,
    /// Port to bind or dial. `0` binds an ephemeral port.
    pub port: u16,
    /// Largest frame payload accepted off the wire, in bytes.
    pub max_frame_size: u32,
    /// How long an accepting side waits for the peer's handshake.
    pub handshake_timeout_ms: u64,
    /// Default tracing filter for the `orchestra` binary.
    pub log_level: String,
    /// Compare-and-set retry policy for state updates.
    pub cas: CasConfig,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            max_frame_size: 16 * 1024 * 1024,
            handshake_timeout_ms: 5_000,
            log_level: "info".to_string(),
            cas: CasConfig::default(),
        }
    }
}

impl OrchestrationConfig {
    /// Socket address to bind (servers, listeners) or dial (clients).
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Retry policy for a state update whose compare-and-set was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CasConfig {
    /// Attempts before the update fails (including the first).
    pub max_attempts: u32,
    /// Backoff before the second attempt, in milliseconds.
    pub min_delay_ms: u64,
    /// Backoff ceiling, in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 = none, 1.0 = up to double the delay).
    pub jitter: f64,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            min_delay_ms: 1,
            max_delay_ms: 250,
            jitter: 0.2,
        }
    }
}
