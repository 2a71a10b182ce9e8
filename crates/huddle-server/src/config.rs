//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - TOML configuration file (`--config`, `HUDDLE_CONFIG`, or a default path)
//! - Environment variables (`HUDDLE_PORT`, `HUDDLE_LIMITS__MAX_CONNECTIONS`, ...)

use anyhow::{Context, Result};
use huddle_core::directory::DEFAULT_CODE_LENGTH;
use huddle_core::member::DEFAULT_OUTBOUND_CAPACITY;
use huddle_protocol::codec::DEFAULT_MAX_MESSAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "HUDDLE";

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_VAR: &str = "HUDDLE_CONFIG";

/// Config files tried in order when no path is given.
const CONFIG_PATHS: [&str; 3] = [
    "huddle.toml",
    "/etc/huddle/huddle.toml",
    "~/.config/huddle/huddle.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Room directory configuration.
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path prefix of the WebSocket endpoint; room code and display name
    /// follow as two more segments.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent WebSocket connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Messages buffered per member before it is evicted as too slow.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

/// Where room codes are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryBackend {
    /// SQLite database file.
    Sqlite,
    /// Process memory; rooms vanish on restart.
    Memory,
}

/// Room directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Storage backend.
    #[serde(default = "default_backend")]
    pub backend: DirectoryBackend,

    /// SQLite database path (`~` is expanded).
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Digits per generated room code.
    #[serde(default = "default_code_length")]
    pub code_length: usize,
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

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_outbound_queue_capacity() -> usize {
    DEFAULT_OUTBOUND_CAPACITY
}

fn default_backend() -> DirectoryBackend {
    DirectoryBackend::Sqlite
}

fn default_database_path() -> String {
    "huddle.db".to_string()
}

fn default_code_length() -> usize {
    DEFAULT_CODE_LENGTH
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            directory: DirectoryConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            database_path: default_database_path(),
            code_length: default_code_length(),
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
    /// Load configuration from the first config file found, then apply
    /// environment overrides.
    ///
    /// `explicit` takes precedence over `HUDDLE_CONFIG`, which takes
    /// precedence over the default search paths.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Self::locate(),
        };
        Self::layered(path.as_deref(), ENV_PREFIX)
    }

    /// Find a config file.
    fn locate() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
            return Some(PathBuf::from(shellexpand::tilde(&path).as_ref()));
        }

        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Merge defaults, an optional TOML file, and `<env_prefix>_*` variables.
    fn layered(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Render the effective configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }
}
