//! ObjectLoader CLI - Stream content-addressed objects from an object server
//!
//! # Usage
//!
//! ```bash
//! # Print one object
//! objectloader --server https://app.speckle.systems --stream 3073b96e86 get <object-id>
//!
//! # Stream an object and everything below it, one JSON line per object
//! objectloader closure <object-id> > objects.jsonl
//!
//! # Count a closure through the worker-thread transport
//! objectloader --worker closure <object-id> --count
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod commands;
mod progress;

/// ObjectLoader - Deduplicating, streaming object graph loader
#[derive(Parser, Debug)]
#[command(name = "objectloader")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOptions,
}

/// Global options available to all commands
#[derive(Args, Debug, Clone)]
struct GlobalOptions {
    /// Object server URL
    #[arg(long, short = 's', global = true, env = "OBJECTLOADER_SERVER")]
    server: Option<String>,

    /// Stream (project) id the objects belong to
    #[arg(long, global = true, env = "OBJECTLOADER_STREAM")]
    stream: Option<String>,

    /// Bearer token for private streams
    #[arg(long, global = true, env = "OBJECTLOADER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// SQLite cache file
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// Do not read or write the persistent cache
    #[arg(long, global = true, conflicts_with = "cache")]
    no_cache: bool,

    /// Run downloads on a worker thread
    #[arg(long, global = true)]
    worker: bool,

    /// Path to configuration file
    #[arg(long, short = 'c', global = true, env = "OBJECTLOADER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Suppress non-essential output
    #[arg(long, short = 'q', global = true)]
    quiet: bool,
}

impl GlobalOptions {
    /// Convert global options to config overrides
    pub fn to_config_overrides(&self) -> objectloader_config::ConfigOverrides {
        objectloader_config::ConfigOverrides {
            server_url: self.server.clone(),
            stream: self.stream.clone(),
            cache_path: self.cache.clone(),
            disable_cache: self.no_cache,
            worker: self.worker,
            log_level: None,
        }
    }

    /// Level forced by `--quiet` / `--verbose`, if any
    fn forced_log_level(&self) -> Option<&'static str> {
        if self.quiet {
            Some("error")
        } else if self.verbose {
            Some("debug")
        } else {
            None
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch a single object and print it as JSON
    Get(commands::get::GetArgs),

    /// Stream an object and its whole closure
    Closure(commands::closure::ClosureArgs),

    /// View and manage configuration
    #[command(subcommand)]
    Config(commands::config::ConfigCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Flags win over RUST_LOG, which wins over the config file
    let filter = match cli.global.forced_log_level() {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(commands::configured_log_level(&cli.global))),
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Get(args) => commands::get::execute(args, cli.global).await,
        Commands::Closure(args) => commands::closure::execute(args, cli.global).await,
        Commands::Config(cmd) => commands::config::execute(cmd, cli.global).await,
    }
}
