//! Configuration structs with defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tether_sync::LockPolicy;

use crate::error::ConfigError;

/// Host name used when none (or an empty one) is configured.
pub const DEFAULT_HOST_NAME: &str = "localhost";
/// Port used when none (or an empty one) is configured.
pub const DEFAULT_PORT: &str = "7777";
/// Largest payload accepted in either direction unless configured otherwise.
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1_048_576;

const CONFIG_FILE: &str = "config.ron";

/// Top-level tether configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Outbound connection settings.
    pub client: ClientConfig,
    /// Per-socket transport options.
    pub socket: SocketConfig,
    /// Echo server settings.
    pub server: ServerConfig,
    /// Logging settings.
    pub log: LogConfig,
}

/// Outbound connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Host name or address literal to resolve.
    pub host_name: String,
    /// Port, as a decimal string.
    pub port: String,
    /// Locking strategy for the send and general locks.
    pub lock_policy: LockPolicy,
    /// Largest frame payload in bytes.
    ///
    /// Each connection buffers a whole frame before handing it on, so keep
    /// this in the low megabytes when peers are untrusted.
    pub max_payload_size: u32,
}

/// Transport-level options applied to each connected socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive probes.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe, in seconds.
    pub keepalive_idle_secs: u64,
    /// Interval between keepalive probes, in seconds.
    pub keepalive_interval_secs: u64,
    /// Unanswered probes before the peer is declared dead.
    pub keepalive_retries: u32,
    /// Per-candidate dial timeout in milliseconds (0 = OS default).
    pub connect_timeout_ms: u64,
    /// Blocking write timeout in milliseconds (0 = none).
    pub write_timeout_ms: u64,
}

/// Echo server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_address: String,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive (e.g. "info", "debug,tether_net=trace").
    pub level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host_name: DEFAULT_HOST_NAME.to_string(),
            port: DEFAULT_PORT.to_string(),
            lock_policy: LockPolicy::Exclusive,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle_secs: 60,
            keepalive_interval_secs: 10,
            keepalive_retries: 3,
            connect_timeout_ms: 0,
            write_timeout_ms: 0,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("127.0.0.1:{DEFAULT_PORT}"),
            max_connections: 256,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Per-user configuration directory (`<config_dir>/tether`).
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("tether"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load `config.ron` from `config_dir`, writing a default one if absent.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save as `config.ron` inside `config_dir`, creating the directory.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::WriteError {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::WriteError {
            path: config_path,
            source,
        })
    }

    /// Re-read `config.ron`; `Some` only when it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE))?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        ron::from_str(&contents).map_err(ConfigError::ParseError)
    }
}
