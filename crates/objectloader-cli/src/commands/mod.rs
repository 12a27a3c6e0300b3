//! CLI command implementations

pub mod closure;
pub mod config;
pub mod get;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use objectloader_config::{ConfigLoader, LoaderConfig, OverflowMode};
use objectloader_core::{
    BatchDownloader, BatchDownloaderOptions, Cache, DefermentOptions, LoaderBuilder, LoaderOptions,
    NullCache, ObjectLoader, OverflowPolicy, SqliteCache, SqliteCacheOptions, TransportOptions,
};
use objectloader_server::{ServerFetcher, ServerOptions};
use tracing::debug;

use crate::GlobalOptions;

/// Directory whose `.objectloader/config.toml` applies.
pub fn workspace_root() -> Result<PathBuf> {
    std::env::current_dir().context("Failed to get current directory")
}

/// Load configuration: `--config` file alone, or global → local, then CLI overrides.
pub fn load_config(global: &GlobalOptions) -> Result<LoaderConfig> {
    let overrides = global.to_config_overrides();
    let mut loader = ConfigLoader::new();

    if let Some(ref path) = global.config {
        return loader
            .load_file(path, Some(&overrides))
            .with_context(|| format!("Failed to load config file {}", path.display()));
    }

    loader
        .load(&workspace_root()?, Some(&overrides))
        .context("Failed to load configuration")
}

/// Log level from configuration; logging is not up yet, so failures fall back to `info`
pub fn configured_log_level(global: &GlobalOptions) -> String {
    load_config(global)
        .map(|config| config.logging.level)
        .unwrap_or_else(|_| "info".to_string())
}

/// Build a loader for `root_id` from the effective configuration.
pub fn build_loader(
    config: &LoaderConfig,
    global: &GlobalOptions,
    root_id: &str,
) -> Result<ObjectLoader> {
    config.validate(true).context("Invalid configuration")?;

    let fetcher = ServerFetcher::new(server_options(config, global)?)
        .context("Failed to create server client")?;
    let downloader = BatchDownloader::new(
        fetcher,
        BatchDownloaderOptions {
            batch_max_size: config.download.batch_max_size,
            batch_max_wait: Duration::from_millis(config.download.batch_max_wait_ms),
        },
    );

    let mut builder = LoaderBuilder::new()
        .root_id(root_id)
        .downloader(Arc::new(downloader))
        .cache(open_cache(config)?)
        .options(LoaderOptions {
            deferment: DefermentOptions {
                ttl: Duration::from_secs(config.deferment.ttl_secs),
                max_size: config.deferment.max_size,
            },
            ..Default::default()
        });

    if !config.deferment.enabled {
        builder = builder.disable_deferment();
    }
    if config.transport.worker {
        builder = builder.worker_transport(TransportOptions {
            main_to_worker_capacity_bytes: config.transport.main_to_worker_capacity_bytes,
            worker_to_main_capacity_bytes: config.transport.worker_to_main_capacity_bytes,
            overflow_policy: match config.transport.overflow_policy {
                OverflowMode::Block => OverflowPolicy::Block,
                OverflowMode::Reject => OverflowPolicy::Reject,
            },
        });
    }

    builder.build().context("Failed to build object loader")
}

fn server_options(config: &LoaderConfig, global: &GlobalOptions) -> Result<ServerOptions> {
    let stream = config
        .server
        .stream
        .clone()
        .context("No stream configured (use --stream or [server] stream)")?;

    let mut options = ServerOptions::new(config.server.url.clone(), stream)
        .with_timeout(config.server.timeout_secs)
        .with_max_retries(config.server.max_retries);
    options.headers = config.server.headers.clone();
    options.requests_per_second = config.server.requests_per_second;

    // --token, else the configured environment variable
    let token = global.token.clone().or_else(|| {
        config
            .server
            .token_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
    });
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        options = options.with_token(token);
    }
    Ok(options)
}

fn open_cache(config: &LoaderConfig) -> Result<Arc<dyn Cache>> {
    let Some(path) = config.cache_path(&workspace_root()?) else {
        debug!("Persistent cache disabled");
        return Ok(Arc::new(NullCache));
    };

    debug!("Using cache at {}", path.display());
    let cache = SqliteCache::open(SqliteCacheOptions {
        path: Some(path.clone()),
        enable_caching: true,
        batch_max_size: config.cache.batch_max_size,
        batch_max_wait: Duration::from_millis(config.cache.batch_max_wait_ms),
    })
    .with_context(|| format!("Failed to open cache {}", path.display()))?;
    Ok(Arc::new(cache))
}

/// Print an info message (respects quiet flag).
pub fn print_info(message: &str, quiet: bool) {
    if !quiet {
        eprintln!("{}", message);
    }
}
