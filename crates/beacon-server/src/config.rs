//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (BEACON_*)
//! - TOML configuration file

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Mesh identity.
    #[serde(default)]
    pub mesh: MeshConfig,

    /// Authentication grant handed to every accepted client.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Keep-alive configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Periodic diagnostics.
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Mesh identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// This node's identity on the mesh. Required.
    #[serde(default = "default_node_id")]
    pub node_id: String,
}

/// Development authenticator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// The appID granted to accepted clients.
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Credential forwarded to the realm's mesh connection.
    #[serde(default = "default_credential")]
    pub credential: String,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket signalling endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Enable WebTransport (needs the `webtransport` build feature).
    #[serde(default)]
    pub webtransport: bool,

    /// TLS certificate chain for WebTransport (PEM).
    #[serde(default)]
    pub cert_file: String,

    /// TLS private key for WebTransport (PEM).
    #[serde(default)]
    pub key_file: String,
}

/// Keep-alive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between server-initiated pings in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Periodic diagnostics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Enable the periodic connections report.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Append-only file the per-app connection counts are written to.
    #[serde(default = "default_conns_log_path")]
    pub conns_log_path: String,

    /// Reporting interval in milliseconds.
    #[serde(default = "default_diagnostics_interval")]
    pub interval_ms: u64,
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
}

// Default value functions
fn default_host() -> String {
    std::env::var("BEACON_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("BEACON_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8443)
}

fn default_node_id() -> String {
    std::env::var("BEACON_MESH_ID").unwrap_or_default()
}

fn default_app_id() -> String {
    std::env::var("BEACON_APP_ID").unwrap_or_else(|_| "demo".to_string())
}

fn default_credential() -> String {
    std::env::var("BEACON_CREDENTIAL").unwrap_or_default()
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/v1".to_string()
}

fn default_ping_interval() -> u64 {
    10_000 // 10 seconds
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_conns_log_path() -> String {
    "/tmp/conns.log".to_string()
}

fn default_diagnostics_interval() -> u64 {
    60_000 // 1 minute
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mesh: MeshConfig::default(),
            auth: AuthConfig::default(),
            transport: TransportConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            limits: LimitsConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            credential: default_credential(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            webtransport: false,
            cert_file: String::new(),
            key_file: String::new(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            conns_log_path: default_conns_log_path(),
            interval_ms: default_diagnostics_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "beacond.toml",
            "/etc/beacond/beacond.toml",
            "~/.config/beacond/beacond.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Reject configurations the node cannot start with.
    ///
    /// # Errors
    ///
    /// Returns an error when the mesh node id is missing, or when
    /// WebTransport is enabled without TLS material.
    pub fn validate(&self) -> Result<()> {
        if self.mesh.node_id.is_empty() {
            bail!("mesh node id is required (set BEACON_MESH_ID or [mesh] node_id)");
        }
        if self.transport.webtransport
            && (self.transport.cert_file.is_empty() || self.transport.key_file.is_empty())
        {
            bail!("webtransport requires [transport] cert_file and key_file");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Invalid host:port")
    }

    /// Keep-alive ping interval.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.ping_interval_ms)
    }
}
