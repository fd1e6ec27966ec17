use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scan_indexer::repair::{execute, plan, verify_outputs, Decision};
use scan_indexer::schema::SchemaKind;

/// Scan a stream root for files whose rows sit in the wrong UTC day
/// directory, then move or split them and verify the result.
#[derive(Parser)]
struct Args {
    /// Directory holding the partitioned files (e.g. the raw/ mirror)
    #[arg(long)]
    root: PathBuf,

    /// Which schema the files carry: updates, events, or acs
    #[arg(long, default_value = "events")]
    stream: String,

    /// Plan and report without touching any file
    #[arg(long)]
    dry_run: bool,

    /// Rows sampled per file for detection and verification
    #[arg(long)]
    sample_size: Option<usize>,
}

fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let kind = match args.stream.as_str() {
        "updates" => SchemaKind::Updates,
        "events" => SchemaKind::Events,
        "acs" => SchemaKind::Acs,
        other => {
            error!("Unknown stream {other:?}, expected \"updates\", \"events\", or \"acs\"");
            std::process::exit(1);
        }
    };
    let sample_size = args
        .sample_size
        .or_else(|| {
            std::env::var("TEST_SAMPLE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(64);

    let actions = plan(&args.root, kind, sample_size)?;
    let planned_moves = actions
        .iter()
        .filter(|a| !matches!(a.decision, Decision::Skip | Decision::SkipNoTimestamps))
        .count();
    info!(
        files = actions.len(),
        misplaced = planned_moves,
        dry_run = args.dry_run,
        "Repair plan ready"
    );

    let (report, outputs) = execute(&actions, kind, args.dry_run)?;
    info!(
        scanned = report.scanned,
        skipped = report.skipped,
        no_timestamps = report.skipped_no_timestamps,
        moved = report.moved,
        split = report.split,
        "Repair pass finished"
    );

    if !args.dry_run {
        if let Err(mismatch) = verify_outputs(&outputs, kind, sample_size) {
            error!(timestamp = %mismatch, "Post-move verification failed");
            std::process::exit(2);
        }
        info!(files = outputs.len(), "Post-move verification passed");
    }
    Ok(())
}
