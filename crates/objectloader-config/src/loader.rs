//! Configuration loader with inheritance support.
//!
//! Loads configuration from multiple sources and merges them:
//! 1. Global config: `~/.objectloader/config.toml`
//! 2. Local config: `.objectloader/config.toml` (in workspace)
//! 3. CLI overrides
//!
//! Later sources override earlier ones.

use crate::error::ConfigError;
use crate::{
    CacheConfig, ConfigOverrides, DefermentConfig, DownloadConfig, LoaderConfig, LoggingConfig,
    ServerConfig, TransportConfig,
};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration directory name, both global and per workspace.
const CONFIG_DIR: &str = ".objectloader";

/// Configuration loader with caching and inheritance support.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Global config directory (e.g., `~/.objectloader`)
    global_config_dir: Option<PathBuf>,

    /// Cached global config
    global_config: Option<LoaderConfig>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a new configuration loader.
    ///
    /// Automatically detects the global config directory (`~/.objectloader`).
    pub fn new() -> Self {
        Self {
            global_config_dir: dirs::home_dir().map(|h| h.join(CONFIG_DIR)),
            global_config: None,
        }
    }

    /// Create a loader with a custom global config directory.
    pub fn with_global_dir(global_dir: impl Into<PathBuf>) -> Self {
        Self {
            global_config_dir: Some(global_dir.into()),
            global_config: None,
        }
    }

    pub fn global_config_path(&self) -> Option<PathBuf> {
        self.global_config_dir
            .as_ref()
            .map(|d| d.join(CONFIG_FILE_NAME))
    }

    pub fn local_config_path(&self, workspace_root: &Path) -> PathBuf {
        workspace_root.join(CONFIG_DIR).join(CONFIG_FILE_NAME)
    }

    /// Load configuration for a workspace with optional CLI overrides.
    ///
    /// Merges config in order: global → local → overrides.
    pub fn load(
        &mut self,
        workspace_root: &Path,
        overrides: Option<&ConfigOverrides>,
    ) -> Result<LoaderConfig, ConfigError> {
        let mut config = LoaderConfig::default();

        if let Some(global_config) = self.load_global()? {
            config = merge_configs(config, global_config);
        }

        if let Some(local_config) = self.load_local(workspace_root)? {
            config = merge_configs(config, local_config);
        }

        if let Some(ovr) = overrides {
            config.apply_overrides(ovr);
        }

        Ok(config)
    }

    /// Load a single explicit file over the defaults, then apply overrides.
    ///
    /// Used for `--config <path>`; neither global nor local files are read.
    pub fn load_file(
        &self,
        path: &Path,
        overrides: Option<&ConfigOverrides>,
    ) -> Result<LoaderConfig, ConfigError> {
        debug!("Loading config from {:?}", path);
        let mut config = merge_configs(LoaderConfig::default(), load_config_file(path)?);
        if let Some(ovr) = overrides {
            config.apply_overrides(ovr);
        }
        Ok(config)
    }

    /// Load only the global configuration.
    pub fn load_global(&mut self) -> Result<Option<LoaderConfig>, ConfigError> {
        if let Some(ref config) = self.global_config {
            return Ok(Some(config.clone()));
        }

        let Some(global_path) = self.global_config_path() else {
            debug!("No home directory found, skipping global config");
            return Ok(None);
        };

        if !global_path.exists() {
            trace!("Global config not found at {:?}", global_path);
            return Ok(None);
        }

        debug!("Loading global config from {:?}", global_path);
        let config = load_config_file(&global_path)?;
        self.global_config = Some(config.clone());

        Ok(Some(config))
    }

    /// Load only the local configuration for a workspace.
    pub fn load_local(&self, workspace_root: &Path) -> Result<Option<LoaderConfig>, ConfigError> {
        let local_path = self.local_config_path(workspace_root);

        if !local_path.exists() {
            trace!("Local config not found at {:?}", local_path);
            return Ok(None);
        }

        debug!("Loading local config from {:?}", local_path);
        load_config_file(&local_path).map(Some)
    }

    /// Save configuration to the local config file for a workspace.
    pub fn save_local(
        &self,
        workspace_root: &Path,
        config: &LoaderConfig,
    ) -> Result<(), ConfigError> {
        save_config_file(&self.local_config_path(workspace_root), config)
    }

    /// Initialize global configuration directory.
    ///
    /// Creates `~/.objectloader/config.toml` with default configuration.
    pub fn init_global(&self) -> Result<PathBuf, ConfigError> {
        let Some(ref global_dir) = self.global_config_dir else {
            return Err(ConfigError::NoHomeDir);
        };
        init_config_file(&global_dir.join(CONFIG_FILE_NAME))
    }

    /// Initialize local configuration for a workspace.
    ///
    /// Creates `.objectloader/config.toml` with default configuration. An
    /// existing file is left untouched.
    pub fn init_local(&self, workspace_root: &Path) -> Result<PathBuf, ConfigError> {
        init_config_file(&self.local_config_path(workspace_root))
    }

    /// Forget the cached global configuration.
    pub fn clear_cache(&mut self) {
        self.global_config = None;
    }
}

fn init_config_file(path: &Path) -> Result<PathBuf, ConfigError> {
    if !path.exists() {
        save_config_file(path, &LoaderConfig::default())?;
    }
    Ok(path.to_path_buf())
}

fn load_config_file(path: &Path) -> Result<LoaderConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;

    toml::from_str(&content).map_err(|e| ConfigError::parse_toml(path, e))
}

fn save_config_file(path: &Path, config: &LoaderConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
        }
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))
}

/// Keep `overlay` unless it still holds the default, in which case `base` wins
fn pick<T: PartialEq>(base: T, overlay: T, default: T) -> T {
    if overlay != default {
        overlay
    } else {
        base
    }
}

/// Merge two configurations, with `overlay` taking precedence.
///
/// This performs a field-by-field merge, allowing partial configs.
fn merge_configs(base: LoaderConfig, overlay: LoaderConfig) -> LoaderConfig {
    LoaderConfig {
        server: merge_server(base.server, overlay.server),
        download: merge_download(base.download, overlay.download),
        cache: merge_cache(base.cache, overlay.cache),
        deferment: merge_deferment(base.deferment, overlay.deferment),
        transport: merge_transport(base.transport, overlay.transport),
        logging: merge_logging(base.logging, overlay.logging),
    }
}

fn merge_server(base: ServerConfig, overlay: ServerConfig) -> ServerConfig {
    let defaults = ServerConfig::default();
    ServerConfig {
        url: pick(base.url, overlay.url, defaults.url),
        stream: overlay.stream.or(base.stream),
        token_env: pick(base.token_env, overlay.token_env, defaults.token_env),
        // Headers accumulate; overlay wins per name
        headers: {
            let mut headers = base.headers;
            headers.extend(overlay.headers);
            headers
        },
        timeout_secs: pick(base.timeout_secs, overlay.timeout_secs, defaults.timeout_secs),
        max_retries: pick(base.max_retries, overlay.max_retries, defaults.max_retries),
        requests_per_second: overlay.requests_per_second.or(base.requests_per_second),
    }
}

fn merge_download(base: DownloadConfig, overlay: DownloadConfig) -> DownloadConfig {
    let defaults = DownloadConfig::default();
    DownloadConfig {
        batch_max_size: pick(base.batch_max_size, overlay.batch_max_size, defaults.batch_max_size),
        batch_max_wait_ms: pick(
            base.batch_max_wait_ms,
            overlay.batch_max_wait_ms,
            defaults.batch_max_wait_ms,
        ),
    }
}

fn merge_cache(base: CacheConfig, overlay: CacheConfig) -> CacheConfig {
    let defaults = CacheConfig::default();
    CacheConfig {
        enabled: pick(base.enabled, overlay.enabled, defaults.enabled),
        path: overlay.path.or(base.path),
        batch_max_size: pick(base.batch_max_size, overlay.batch_max_size, defaults.batch_max_size),
        batch_max_wait_ms: pick(
            base.batch_max_wait_ms,
            overlay.batch_max_wait_ms,
            defaults.batch_max_wait_ms,
        ),
    }
}

fn merge_deferment(base: DefermentConfig, overlay: DefermentConfig) -> DefermentConfig {
    let defaults = DefermentConfig::default();
    DefermentConfig {
        enabled: pick(base.enabled, overlay.enabled, defaults.enabled),
        ttl_secs: pick(base.ttl_secs, overlay.ttl_secs, defaults.ttl_secs),
        max_size: pick(base.max_size, overlay.max_size, defaults.max_size),
    }
}

fn merge_transport(base: TransportConfig, overlay: TransportConfig) -> TransportConfig {
    let defaults = TransportConfig::default();
    TransportConfig {
        worker: pick(base.worker, overlay.worker, defaults.worker),
        main_to_worker_capacity_bytes: pick(
            base.main_to_worker_capacity_bytes,
            overlay.main_to_worker_capacity_bytes,
            defaults.main_to_worker_capacity_bytes,
        ),
        worker_to_main_capacity_bytes: pick(
            base.worker_to_main_capacity_bytes,
            overlay.worker_to_main_capacity_bytes,
            defaults.worker_to_main_capacity_bytes,
        ),
        overflow_policy: pick(
            base.overflow_policy,
            overlay.overflow_policy,
            defaults.overflow_policy,
        ),
    }
}

fn merge_logging(base: LoggingConfig, overlay: LoggingConfig) -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        level: pick(base.level, overlay.level, defaults.level),
    }
}
