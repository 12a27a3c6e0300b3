//! ObjectLoader Configuration Management
//!
//! Provides configuration loading with support for:
//! - Global config: `~/.objectloader/config.toml`
//! - Local config: `.objectloader/config.toml` (in workspace)
//! - CLI overrides via `ConfigOverrides`
//!
//! Configuration is merged in order: global → local → CLI overrides.

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Root configuration for ObjectLoader.
///
/// Represents the fully merged configuration from all sources.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct LoaderConfig {
    /// Object server connection
    pub server: ServerConfig,

    /// Download batching
    pub download: DownloadConfig,

    /// Persistent cache
    pub cache: CacheConfig,

    /// Request deduplication
    pub deferment: DefermentConfig,

    /// Worker thread transport
    pub transport: TransportConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Object server connection settings.
///
/// # Example TOML
///
/// ```toml
/// [server]
/// url = "https://app.speckle.systems"
/// stream = "3073b96e86"
/// token_env = "OBJECTLOADER_TOKEN"
///
/// [server.headers]
/// X-Client = "objectloader"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Server base URL
    pub url: String,

    /// Stream (project) the objects belong to
    pub stream: Option<String>,

    /// Environment variable holding the bearer token
    pub token_env: Option<String>,

    /// Extra request headers
    pub headers: BTreeMap<String, String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum retry attempts for transient failures
    pub max_retries: u32,

    /// Request rate limit (None = unlimited)
    pub requests_per_second: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            stream: None,
            token_env: Some("OBJECTLOADER_TOKEN".to_string()),
            headers: BTreeMap::new(),
            timeout_secs: 30,
            max_retries: 3,
            requests_per_second: None,
        }
    }
}

/// Download batching settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    /// Most ids sent in one batch request
    pub batch_max_size: usize,

    /// Longest a partial batch waits before it is sent (ms)
    pub batch_max_wait_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            batch_max_size: 5000,
            batch_max_wait_ms: 200,
        }
    }
}

/// Persistent cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Use the SQLite cache at all
    pub enabled: bool,

    /// Database file (default: `~/.objectloader/cache.db`)
    pub path: Option<PathBuf>,

    /// Most objects committed per transaction
    pub batch_max_size: usize,

    /// Longest pending writes wait before a commit (ms)
    pub batch_max_wait_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            batch_max_size: 1000,
            batch_max_wait_ms: 1000,
        }
    }
}

/// Request deduplication settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DefermentConfig {
    /// Share one download between concurrent requests for an id
    pub enabled: bool,

    /// Longest an unanswered request stays pending (seconds)
    pub ttl_secs: u64,

    /// Most pending requests tracked at once
    pub max_size: usize,
}

impl Default for DefermentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 60,
            max_size: 100_000,
        }
    }
}

/// Worker thread transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Run downloads on a worker thread
    pub worker: bool,

    /// Request ring size in bytes
    pub main_to_worker_capacity_bytes: usize,

    /// Result ring size in bytes
    pub worker_to_main_capacity_bytes: usize,

    /// What happens when a request does not fit the ring
    pub overflow_policy: OverflowMode,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            worker: false,
            main_to_worker_capacity_bytes: 64 * 1024,
            worker_to_main_capacity_bytes: 4 * 1024 * 1024,
            overflow_policy: OverflowMode::default(),
        }
    }
}

/// Ring overflow handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverflowMode {
    /// Wait for the worker to drain (default)
    #[default]
    Block,
    /// Fail the request immediately
    Reject,
}

impl std::fmt::Display for OverflowMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

impl std::str::FromStr for OverflowMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "reject" => Ok(Self::Reject),
            _ => Err(ConfigError::invalid_value(
                "transport.overflow_policy",
                format!("unknown policy '{}'. Valid values: block, reject", s),
            )),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// CLI overrides for configuration values.
///
/// Used to apply command-line arguments over file-based config.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub server_url: Option<String>,
    pub stream: Option<String>,
    pub cache_path: Option<PathBuf>,

    /// `--no-cache`
    pub disable_cache: bool,

    /// `--worker`
    pub worker: bool,

    pub log_level: Option<String>,
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl LoaderConfig {
    /// Apply CLI overrides to this configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref url) = overrides.server_url {
            self.server.url = url.clone();
        }

        if let Some(ref stream) = overrides.stream {
            self.server.stream = Some(stream.clone());
        }

        if let Some(ref path) = overrides.cache_path {
            self.cache.path = Some(path.clone());
        }

        if overrides.disable_cache {
            self.cache.enabled = false;
        }

        if overrides.worker {
            self.transport.worker = true;
        }

        if let Some(ref level) = overrides.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Validate the configuration.
    ///
    /// Server settings are only checked when `require_server` is set, since
    /// commands that never talk to a server can run without them.
    pub fn validate(&self, require_server: bool) -> Result<(), ConfigError> {
        if require_server {
            if self.server.url.trim().is_empty() {
                return Err(ConfigError::invalid_value("server.url", "a server URL is required"));
            }
            if self.server.stream.as_deref().map_or(true, |s| s.trim().is_empty()) {
                return Err(ConfigError::invalid_value("server.stream", "a stream id is required"));
            }
        }
        if self.server.requests_per_second == Some(0) {
            return Err(ConfigError::invalid_value(
                "server.requests_per_second",
                "must be at least 1",
            ));
        }
        if self.download.batch_max_size == 0 {
            return Err(ConfigError::invalid_value("download.batch_max_size", "must be at least 1"));
        }
        if self.cache.batch_max_size == 0 {
            return Err(ConfigError::invalid_value("cache.batch_max_size", "must be at least 1"));
        }
        if self.deferment.max_size == 0 {
            return Err(ConfigError::invalid_value("deferment.max_size", "must be at least 1"));
        }
        // A ring must hold at least one length prefix plus a byte
        for (key, capacity) in [
            (
                "transport.main_to_worker_capacity_bytes",
                self.transport.main_to_worker_capacity_bytes,
            ),
            (
                "transport.worker_to_main_capacity_bytes",
                self.transport.worker_to_main_capacity_bytes,
            ),
        ] {
            if capacity <= 4 {
                return Err(ConfigError::invalid_value(key, "must be larger than 4 bytes"));
            }
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::invalid_value(
                "logging.level",
                format!("unknown level '{}'", self.logging.level),
            ));
        }
        Ok(())
    }

    /// Effective cache database path.
    ///
    /// Relative paths resolve against `workspace_root`; with no path
    /// configured the file lives under `~/.objectloader`. `None` when caching
    /// is off or no home directory exists.
    pub fn cache_path(&self, workspace_root: &Path) -> Option<PathBuf> {
        if !self.cache.enabled {
            return None;
        }
        match &self.cache.path {
            Some(path) if path.is_absolute() => Some(path.clone()),
            Some(path) => Some(workspace_root.join(path)),
            None => dirs::home_dir().map(|h| h.join(".objectloader").join("cache.db")),
        }
    }
}
