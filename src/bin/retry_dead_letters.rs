use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scan_indexer::config::Settings;
use scan_indexer::store::FsObjectStore;
use scan_indexer::uploader::dead_letter::process_dead_letter_log;

/// Re-attempt dead-lettered uploads and compact the log.
#[derive(Parser)]
struct Args {
    /// Dead-letter log to sweep (defaults to the configured one)
    #[arg(long)]
    file: Option<PathBuf>,

    /// Report what would be retried without uploading or rewriting
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let settings = Settings::new()?;
    let log_path = args
        .file
        .unwrap_or_else(|| settings.storage.dead_letter_path());
    let store = FsObjectStore::new(settings.storage.raw_dir());

    let report = process_dead_letter_log(&log_path, &store, args.dry_run).await?;
    info!(
        total = report.total,
        unique = report.unique,
        deduplicated = report.deduplicated,
        retried = report.retried,
        remaining = report.remaining,
        no_file = report.no_file,
        dry_run = args.dry_run,
        "Dead-letter sweep finished"
    );
    Ok(())
}
