//! Config command - View and manage configuration

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use objectloader_config::ConfigLoader;

use super::{load_config, print_info, workspace_root};
use crate::GlobalOptions;

/// Config management commands
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show(ShowArgs),

    /// Write a default configuration file
    Init(InitArgs),

    /// Show configuration file paths
    Path,
}

/// Arguments for the show command
#[derive(clap::Args, Debug)]
pub struct ShowArgs {
    /// Output as JSON instead of TOML
    #[arg(long)]
    json: bool,
}

/// Arguments for the init command
#[derive(clap::Args, Debug)]
pub struct InitArgs {
    /// Create ~/.objectloader/config.toml instead of the workspace file
    #[arg(long)]
    global: bool,
}

/// Execute the config command
pub async fn execute(cmd: ConfigCommand, global: GlobalOptions) -> Result<()> {
    match cmd {
        ConfigCommand::Show(args) => execute_show(args, global),
        ConfigCommand::Init(args) => execute_init(args, global),
        ConfigCommand::Path => execute_path(),
    }
}

fn execute_show(args: ShowArgs, global: GlobalOptions) -> Result<()> {
    let config = load_config(&global)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        print!("{}", toml::to_string_pretty(&config)?);
    }

    if let Err(e) = config.validate(false) {
        print_info(&format!("warning: {}", e), global.quiet);
    }
    Ok(())
}

fn execute_init(args: InitArgs, global: GlobalOptions) -> Result<()> {
    let loader = ConfigLoader::new();
    let path: PathBuf = if args.global {
        loader.init_global()
    } else {
        loader.init_local(&workspace_root()?)
    }
    .context("Failed to initialize configuration")?;

    print_info(&format!("Configuration at {}", path.display()), global.quiet);
    Ok(())
}

fn execute_path() -> Result<()> {
    let loader = ConfigLoader::new();
    let local = loader.local_config_path(&workspace_root()?);

    match loader.global_config_path() {
        Some(path) => println!("global: {} ({})", path.display(), existence(&path)),
        None => println!("global: <no home directory>"),
    }
    println!("local:  {} ({})", local.display(), existence(&local));
    Ok(())
}

fn existence(path: &std::path::Path) -> &'static str {
    if path.exists() {
        "exists"
    } else {
        "missing"
    }
}
