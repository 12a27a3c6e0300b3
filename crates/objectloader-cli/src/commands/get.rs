//! Get command - fetch one object

use anyhow::{Context, Result};
use clap::Args;

use super::{build_loader, load_config};
use crate::GlobalOptions;

/// Arguments for the get command
#[derive(Args, Debug)]
pub struct GetArgs {
    /// Object id (content hash)
    object_id: String,

    /// Pretty-print the JSON
    #[arg(long)]
    pretty: bool,
}

/// Execute the get command
pub async fn execute(args: GetArgs, global: GlobalOptions) -> Result<()> {
    let config = load_config(&global)?;
    let loader = build_loader(&config, &global, &args.object_id)?;

    let fetched = loader.get_root_object().await;
    loader.dispose().await;
    let base = fetched.with_context(|| format!("Failed to fetch object {}", args.object_id))?;

    let json = if args.pretty {
        serde_json::to_string_pretty(base.as_ref())?
    } else {
        serde_json::to_string(base.as_ref())?
    };
    println!("{}", json);
    Ok(())
}
