//! Closure command - stream an object and everything below it
//!
//! Objects are written to stdout as JSON lines: the root first, then its
//! descendants in completion order. Failures for individual objects are
//! reported on stderr and do not stop the stream.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;
use futures::StreamExt;
use tracing::warn;

use super::{build_loader, load_config, print_info};
use crate::progress;
use crate::GlobalOptions;

/// Arguments for the closure command
#[derive(Args, Debug)]
pub struct ClosureArgs {
    /// Root object id
    object_id: String,

    /// Only print how many objects were loaded
    #[arg(long)]
    count: bool,
}

/// Execute the closure command
pub async fn execute(args: ClosureArgs, global: GlobalOptions) -> Result<()> {
    let config = load_config(&global)?;
    let loader = build_loader(&config, &global, &args.object_id)?;

    let result = stream_closure(&loader, &args, global.quiet).await;
    loader.dispose().await;
    let (loaded, failed) = result?;

    if args.count {
        println!("{}", loaded);
    }
    print_info(
        &format!("Loaded {} objects ({} failed)", loaded, failed),
        global.quiet,
    );
    if failed > 0 {
        anyhow::bail!("{} objects could not be loaded", failed);
    }
    Ok(())
}

async fn stream_closure(
    loader: &objectloader_core::ObjectLoader,
    args: &ClosureArgs,
    quiet: bool,
) -> Result<(usize, usize)> {
    let total = loader
        .get_total_object_count()
        .await
        .with_context(|| format!("Failed to fetch root object {}", args.object_id))?;
    let pb = progress::progress_bar(total as u64, "Loading", quiet);

    let mut stream = loader.object_stream().await?;
    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    let (mut loaded, mut failed) = (0usize, 0usize);

    while let Some(result) = stream.next().await {
        match result {
            Ok(item) => {
                loaded += 1;
                if !args.count {
                    serde_json::to_writer(&mut out, item.base.as_ref())?;
                    out.write_all(b"\n")?;
                }
            }
            Err(e) => {
                failed += 1;
                warn!("{}", e);
            }
        }
        if let Some(ref pb) = pb {
            pb.inc(1);
        }
    }
    out.flush()?;
    progress::finish_progress(pb);
    Ok((loaded, failed))
}
