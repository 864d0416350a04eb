//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (first of `breaker.toml`,
//!   `/etc/breaker/breaker.toml`, `~/.config/breaker/breaker.toml`)
//! - Environment variables (`BREAKER_*`, nested keys joined by `__`, e.g.
//!   `BREAKER_HUB__MAX_READ_LIMIT=1024`), which win over the file

use anyhow::{Context, Result};
use breaker_core::{FrameKind, HubConfig, KeepaliveConfig, SlowConsumerPolicy};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Files searched by [`Config::load`], in order.
pub const CONFIG_PATHS: [&str; 3] = [
    "breaker.toml",
    "/etc/breaker/breaker.toml",
    "~/.config/breaker/breaker.toml",
];

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "BREAKER";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// HTTP endpoint configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Hub settings.
    #[serde(default)]
    pub hub: HubSettings,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Path accepting `POST`ed payloads to broadcast.
    #[serde(default = "default_broadcast_path")]
    pub broadcast_path: String,
}

/// Hub settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_read_limit")]
    pub max_read_limit: usize,

    /// Broadcast queue depth.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Per-client outbound queue depth.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Frame kind for outbound messages.
    #[serde(default)]
    pub frame_kind: FrameKind,

    /// What to do when a client's queue is full.
    #[serde(default)]
    pub slow_consumer: SlowConsumerPolicy,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Read deadline in milliseconds, refreshed by every pong.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Write deadline in milliseconds.
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// How often hub statistics are sampled into gauges, in milliseconds.
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_broadcast_path() -> String {
    "/broadcast".to_string()
}

fn default_max_read_limit() -> usize {
    breaker_core::config::DEFAULT_MAX_READ_LIMIT
}

fn default_broadcast_capacity() -> usize {
    breaker_core::config::DEFAULT_BROADCAST_CAPACITY
}

fn default_outbound_capacity() -> usize {
    breaker_core::config::DEFAULT_OUTBOUND_CAPACITY
}

fn default_ping_interval() -> u64 {
    50_000 // 50 seconds
}

fn default_pong_wait() -> u64 {
    60_000 // 60 seconds
}

fn default_write_wait() -> u64 {
    15_000 // 15 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_sample_interval() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            hub: HubSettings::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            broadcast_path: default_broadcast_path(),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            max_read_limit: default_max_read_limit(),
            broadcast_capacity: default_broadcast_capacity(),
            outbound_capacity: default_outbound_capacity(),
            frame_kind: FrameKind::default(),
            slow_consumer: SlowConsumerPolicy::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            pong_wait_ms: default_pong_wait(),
            write_wait_ms: default_write_wait(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            sample_interval_ms: default_sample_interval(),
        }
    }
}

fn environment() -> ::config::Environment {
    ::config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl Config {
    /// Load configuration from the first config file found, with
    /// environment overrides applied on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// an override has the wrong type.
    pub fn load() -> Result<Self> {
        let path = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        Self::build(path.as_deref(), environment())
    }

    /// Load configuration from a specific file, with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(Some(path.as_ref()), environment())
    }

    fn build(path: Option<&Path>, env: ::config::Environment) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder
                .add_source(::config::File::from(path).format(::config::FileFormat::Toml));
        }

        let merged = builder
            .add_source(env)
            .build()
            .with_context(|| match path {
                Some(path) => format!("Failed to read config file: {}", path.display()),
                None => "Failed to read configuration".to_string(),
            })?;

        merged
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Build the hub configuration. The error handler is left at its default
    /// for the caller to replace.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_read_limit: self.hub.max_read_limit,
            broadcast_capacity: self.hub.broadcast_capacity,
            outbound_capacity: self.hub.outbound_capacity,
            keepalive: KeepaliveConfig {
                ping_interval: Duration::from_millis(self.heartbeat.ping_interval_ms),
                pong_wait: Duration::from_millis(self.heartbeat.pong_wait_ms),
                write_wait: Duration::from_millis(self.heartbeat.write_wait_ms),
            },
            frame_kind: self.hub.frame_kind,
            slow_consumer: self.hub.slow_consumer,
            ..HubConfig::default()
        }
    }
}
