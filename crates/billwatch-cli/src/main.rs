use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use billwatch_sync::{LogNotifier, SyncConfig, SyncPipeline};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "billwatch")]
#[command(about = "Track chamber bill listings in a spreadsheet")]
struct Cli {
    /// YAML config file; defaults to ./billwatch.yaml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape, reconcile and write to the sheet.
    Sync,
    /// Print the write plan without touching the sheet.
    Plan,
    /// Print the scraped records as JSON.
    Extract {
        /// Parse a saved listing page instead of fetching.
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = SyncConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = billwatch_sync::run_sync_once(config).await?;
            println!(
                "sync complete: run_id={} outcome={:?} new={} updated={} unchanged={}",
                summary.run_id,
                summary.outcome,
                summary.counts.new,
                summary.counts.updated,
                summary.counts.skipped
            );
        }
        Commands::Plan => {
            let pipeline = SyncPipeline::new(config, Arc::new(LogNotifier))?;
            let planned = pipeline.plan_only().await?;
            println!("{}", serde_json::to_string_pretty(&planned)?);
        }
        Commands::Extract { file } => {
            if file.is_some() {
                config.listing_file = file;
            }
            let records = billwatch_sync::extract_listing(&config).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}
