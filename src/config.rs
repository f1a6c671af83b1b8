//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment` (spec.md §6).
//! Extends the teacher's `figment`-layering pattern (`Serialized::defaults`
//! + `Toml::file` + `Env::prefixed`) with the five recognized options and
//! the TLS/listen-mode settings needed to actually run a node.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Top-level struct holding all runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub identity_path: PathBuf,

    /// Address to bind the comm instance's QUIC listener to. `bind_port =
    /// 0` means "ephemeral port"; a negative value isn't representable on
    /// `SocketAddr` directly, so external-server attachment is modeled by
    /// `listen: ListenModeConfig::External` instead (spec.md §6).
    pub bind_addr: SocketAddr,
    pub listen: ListenModeConfig,

    /// Maximum time to establish a transport connection (spec.md §6).
    pub dial_timeout_ms: u64,
    /// Maximum time to receive the handshake reply (spec.md §6).
    pub conn_timeout_ms: u64,
    /// Accept peers without verifying transport-cert binding (spec.md §6).
    pub skip_handshake: bool,
    /// Bound on the per-connection channel staging decoded envelopes
    /// between the stream reader and the message handler; a slow handler
    /// applies backpressure to the reader rather than growing memory
    /// unboundedly (spec.md §6).
    pub recv_buffer: usize,
    /// Per-connection outbound queue length before overflow (spec.md §6).
    pub send_buffer: usize,

    pub tls: Option<TlsConfig>,
}

/// Whether to bind our own listener or attach to one owned elsewhere
/// (spec.md §6 — server port "0 means ephemeral, negative means no
/// server, attach to an externally-owned server").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenModeConfig {
    Ephemeral,
    Bind,
    External,
}

/// Transport security settings: where this node's self-signed leaf
/// certificate and key live on disk (spec.md §6, §7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Config {
    /// Loads configuration from `config.toml` and `GOSSIP_`-prefixed
    /// environment variables, layered over this struct's defaults.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("GOSSIP_"))
            .extract()
    }

    pub fn dial_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn conn_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.conn_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity_path: PathBuf::from("identity.key"),
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 0),
            listen: ListenModeConfig::Ephemeral,
            dial_timeout_ms: 3_000,
            conn_timeout_ms: 2_000,
            skip_handshake: false,
            recv_buffer: 20,
            send_buffer: 20,
            tls: Some(TlsConfig {
                cert_path: PathBuf::from("certs/node.cert"),
                key_path: PathBuf::from("certs/node.key"),
            }),
        }
    }
}
