use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::Parser;
use dotenv::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scan_indexer::config::Settings;
use scan_indexer::cursor::{Cursor, CursorKey, CursorUpdate, Direction};
use scan_indexer::indexer::acs::AcsConfig;
use scan_indexer::indexer::backfill::BackfillConfig;
use scan_indexer::indexer::live::LiveConfig;
use scan_indexer::indexer::resume::scan_store;
use scan_indexer::indexer::{AcsEngine, BackfillEngine, LiveEngine, SeenSet, StreamPipeline};
use scan_indexer::partition::parse_utc;
use scan_indexer::scan_api::ScanClient;
use scan_indexer::store::FsObjectStore;
use scan_indexer::uploader::{UploadQueue, UploadQueueConfig};
use scan_indexer::writer::WriterPool;

#[derive(Parser)]
struct Args {
    /// Run the historical backfill stream
    #[arg(long)]
    backfill: bool,

    /// Run the forward live stream
    #[arg(long)]
    live: bool,

    /// Run the ACS snapshot stream
    #[arg(long)]
    acs: bool,

    /// Oldest instant the backfill walks back to (RFC 3339)
    #[arg(long)]
    min_time: Option<String>,

    /// Newest instant the backfill starts from (RFC 3339, defaults to now)
    #[arg(long)]
    max_time: Option<String>,

    /// Resume from the local confirmation instead of the remote checkpoint
    #[arg(long)]
    use_local_cursor: bool,

    /// Derive cursor positions by scanning the object store before starting
    #[arg(long)]
    rebuild_cursors: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let settings = Settings::new().unwrap_or_else(|e| {
        error!("Failed to load configuration: {:?}", e);
        std::process::exit(1);
    });

    info!(
        scan_url = %settings.scan.url,
        data_dir = %settings.storage.data_dir,
        "Loaded settings"
    );

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], settings.application.metrics_port));
    if let Err(e) = scan_indexer::metrics::setup_metrics_recorder(metrics_addr) {
        warn!(error = %e, "Prometheus exporter unavailable, continuing without metrics");
    } else {
        info!("Prometheus metrics listening on {}", metrics_addr);
    }

    // Verify the Scan service is reachable before spinning anything up
    let client = Arc::new(ScanClient::new(
        &settings.scan.url,
        Duration::from_millis(settings.scan.timeout_ms),
        settings.scan.insecure_tls,
    )?);
    match client.latest_round().await {
        Ok(round) => info!(round, "Successfully connected to Scan service"),
        Err(e) => {
            error!("Failed to connect to Scan service: {:?}", e);
            std::process::exit(1);
        }
    }

    let raw_dir = settings.storage.raw_dir();
    let tmp_dir = settings.storage.tmp_dir();
    let cursor_dir = settings.storage.cursor_dir();
    std::fs::create_dir_all(&raw_dir)?;
    std::fs::create_dir_all(&tmp_dir)?;
    std::fs::create_dir_all(&cursor_dir)?;

    // The object store behind the pipeline. Cloud deployments swap in
    // their client behind the same trait; local runs and GCS-disabled
    // environments land files under RAW_DIR.
    if settings.gcs.is_enabled() {
        info!(bucket = ?settings.gcs.bucket, "Upload target: object store bucket");
    } else {
        info!(dir = %raw_dir.display(), "Upload target: local filesystem");
    }
    let store = Arc::new(FsObjectStore::new(&raw_dir));

    let writer = Arc::new(WriterPool::new(settings.indexer.writer_workers, tmp_dir));
    let uploader = UploadQueue::start(
        Arc::clone(&store),
        UploadQueueConfig {
            concurrency: settings.uploader.concurrency,
            count_high_water: settings.uploader.queue_high_water,
            count_low_water: settings.uploader.queue_low_water,
            bytes_high_water: settings.uploader.byte_high_water,
            bytes_low_water: settings.uploader.byte_low_water,
            ..Default::default()
        },
        settings.storage.dead_letter_path(),
    );
    let pipeline = Arc::new(StreamPipeline::new(
        Arc::clone(&writer),
        Arc::clone(&uploader),
        &settings.gcs.prefix,
    ));

    // No stream flags means run everything.
    let run_all = !args.backfill && !args.live && !args.acs;
    let migration_id = settings.indexer.migration_id;
    let synchronizer_id = settings.indexer.synchronizer_id.clone();

    let backfill_cursor = Arc::new(Cursor::load(
        &cursor_dir,
        &CursorKey::new("backfill", migration_id, &synchronizer_id),
    )?);
    let live_cursor = Arc::new(Cursor::load_with_direction(
        &cursor_dir,
        &CursorKey::new("live", migration_id, &synchronizer_id),
        Direction::Forward,
    )?);

    if args.rebuild_cursors {
        rebuild_cursors(&store, &settings, &backfill_cursor, &live_cursor).await?;
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, draining streams");
            cancel.cancel();
        });
    }

    let mut handles = Vec::new();

    if args.backfill || run_all {
        let max_time = parse_bound(args.max_time.as_deref(), Utc::now())?;
        let min_time = parse_bound(
            args.min_time.as_deref(),
            max_time - ChronoDuration::days(30),
        )?;
        let engine = Arc::new(BackfillEngine::new(
            Arc::clone(&client),
            Arc::clone(&pipeline),
            Arc::clone(&backfill_cursor),
            // Each stream owns its dedup set; the overlap regions the
            // sets cover never cross streams.
            Arc::new(SeenSet::new(settings.indexer.seen_capacity)),
            BackfillConfig {
                migration_id,
                page_size: settings.indexer.batch_size,
                slices: settings.indexer.backfill_slices,
                strict: settings.indexer.strict,
                use_local_cursor: args.use_local_cursor,
            },
            cancel.clone(),
        ));
        handles.push(("backfill", tokio::spawn(async move {
            engine.run(max_time, min_time).await
        })));
    }

    if args.live || run_all {
        let engine = Arc::new(LiveEngine::new(
            Arc::clone(&client),
            Arc::clone(&pipeline),
            Arc::clone(&live_cursor),
            Arc::new(SeenSet::new(settings.indexer.seen_capacity)),
            LiveConfig {
                migration_id,
                page_size: settings.indexer.batch_size,
                poll_interval: Duration::from_secs(settings.indexer.poll_interval_secs),
                flush_rows: settings.indexer.flush_rows,
                flush_bytes: settings.indexer.flush_bytes,
                strict: settings.indexer.strict,
                use_local_cursor: args.use_local_cursor,
            },
            cancel.clone(),
        ));
        handles.push(("live", tokio::spawn(async move { engine.run().await })));
    }

    if (args.acs || run_all) && settings.acs.enabled {
        let engine = Arc::new(AcsEngine::new(
            Arc::clone(&client),
            Arc::clone(&pipeline),
            Arc::clone(&store),
            AcsConfig {
                migrations: settings.acs.migrations.clone(),
                page_size: settings.acs.page_size,
                strict: settings.indexer.strict,
            },
            cancel.clone(),
        ));
        handles.push(("acs", tokio::spawn(async move { engine.run().await })));
    }

    let mut failed = false;
    for (stream, handle) in handles {
        match handle.await {
            Ok(Ok(())) => info!(stream, "Stream finished"),
            Ok(Err(e)) => {
                error!(stream, error = %e, "Stream failed");
                failed = true;
            }
            Err(e) => {
                error!(stream, error = %e, "Stream task panicked");
                failed = true;
            }
        }
    }

    // Drain the pools; after the grace period in-flight work is
    // abandoned (dead letters are already durable).
    let drain = async {
        uploader.shutdown().await;
        writer.shutdown().await;
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        warn!("Drain grace period expired, forcing exit");
    }

    let stats = uploader.stats.snapshot();
    info!(
        uploads = stats.uploads_succeeded,
        failed = stats.uploads_failed,
        retries = stats.retries_attempted,
        bytes = stats.bytes_uploaded,
        "Uploader summary"
    );

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn parse_bound(value: Option<&str>, fallback: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match value {
        Some(v) => {
            parse_utc(v).ok_or_else(|| anyhow::anyhow!("Invalid timestamp bound: {v}"))
        }
        None => Ok(fallback),
    }
}

/// Derive resume positions from what already landed in the store. The
/// newest live day is replayed (dedup suppresses the overlap); the
/// backfill resumes from the oldest day it had reached.
async fn rebuild_cursors(
    store: &FsObjectStore,
    settings: &Settings,
    backfill_cursor: &Cursor,
    live_cursor: &Cursor,
) -> Result<()> {
    let positions = scan_store(store, &settings.gcs.prefix).await?;
    info!(
        live = ?positions.live_newest_day,
        backfill = ?positions.backfill_oldest_day,
        snapshots = positions.completed_snapshots.len(),
        "Rebuilding cursors from object store"
    );

    if let Some(day_start) = positions.backfill_oldest_day.as_ref().and_then(|d| d.day_start()) {
        backfill_cursor
            .save_atomic(CursorUpdate {
                last_confirmed_before: Some(day_start.clone()),
                ..Default::default()
            })
            .await?;
        backfill_cursor
            .confirm_remote(Some(day_start), None, None)
            .await?;
    }
    if let Some(day_start) = positions.live_newest_day.as_ref().and_then(|d| d.day_start()) {
        live_cursor
            .save_atomic(CursorUpdate {
                last_confirmed_before: Some(day_start.clone()),
                ..Default::default()
            })
            .await?;
        live_cursor.confirm_remote(Some(day_start), None, None).await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
