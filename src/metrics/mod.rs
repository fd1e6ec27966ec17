use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus recorder with its own scrape listener. Must
/// run inside the tokio runtime.
pub fn setup_metrics_recorder(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    Ok(())
}

/// Sync-progress gauges shared by the stream drivers.
pub fn record_sync_progress(stream: &'static str, done: u64, total: u64) {
    metrics::gauge!("sync_done", done as f64, "stream" => stream);
    metrics::gauge!("sync_total", total as f64, "stream" => stream);
    let progress = if total > 0 {
        (done as f64 / total as f64) * 100.0
    } else {
        0.0
    };
    metrics::gauge!("sync_progress_percentage", progress, "stream" => stream);
}
