use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{await_uploads, PendingUpload, StreamPipeline};
use crate::partition::acs_partition_path;
use crate::scan_api::ScanClient;
use crate::schema::normalize::{normalize_acs_contract, NormalizeOptions};
use crate::schema::SchemaKind;
use crate::store::ObjectStore;

pub struct AcsConfig {
    pub migrations: Vec<i64>,
    pub page_size: usize,
    pub strict: bool,
}

/// Snapshot fetcher: for each migration, resolves the snapshot cutoff,
/// pages through the Active Contract Set, and finishes the snapshot
/// directory with a `_COMPLETE` marker. Snapshots whose marker already
/// exists are skipped on resume.
pub struct AcsEngine<S: ObjectStore> {
    client: Arc<ScanClient>,
    pipeline: Arc<StreamPipeline<S>>,
    store: Arc<S>,
    config: AcsConfig,
    cancel: CancellationToken,
}

impl<S: ObjectStore> AcsEngine<S> {
    pub fn new(
        client: Arc<ScanClient>,
        pipeline: Arc<StreamPipeline<S>>,
        store: Arc<S>,
        config: AcsConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            pipeline,
            store,
            config,
            cancel,
        }
    }

    pub async fn run(&self) -> Result<()> {
        for &migration_id in &self.config.migrations {
            if self.cancel.is_cancelled() {
                info!("ACS engine cancelled");
                return Ok(());
            }
            if let Err(e) = self.snapshot_migration(migration_id).await {
                if self.cancel.is_cancelled() {
                    info!("ACS engine cancelled mid-snapshot");
                    return Ok(());
                }
                warn!(migration = migration_id, error = %e, "ACS snapshot failed");
                return Err(e);
            }
        }
        Ok(())
    }

    async fn snapshot_migration(&self, migration_id: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let Some(snapshot_time) = self
            .client
            .snapshot_timestamp(&now, migration_id)
            .await
            .context("Resolving snapshot timestamp")?
        else {
            info!(migration = migration_id, "No snapshot available, skipping");
            return Ok(());
        };

        let partition = acs_partition_path(Some(&snapshot_time), Some(migration_id))?;
        let marker_key = format!("{}/{}/_COMPLETE", self.pipeline.store_prefix, partition);
        if self.store.head(&marker_key).await.is_ok() {
            info!(
                migration = migration_id,
                snapshot = %snapshot_time,
                "Snapshot already complete, skipping"
            );
            return Ok(());
        }

        info!(migration = migration_id, snapshot = %snapshot_time, "Fetching ACS snapshot");
        let opts = NormalizeOptions {
            strict: self.config.strict,
            warn_only: true,
        };

        let mut page_token: Option<String> = None;
        let mut pending: Vec<PendingUpload> = Vec::new();
        let mut contracts = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                anyhow::bail!("Cancelled mid-snapshot");
            }
            let page = self
                .client
                .acs_page(
                    &snapshot_time,
                    migration_id,
                    self.config.page_size,
                    page_token.as_deref(),
                )
                .await?;

            let mut rows = Vec::with_capacity(page.entries.len());
            for entry in &page.entries {
                match normalize_acs_contract(
                    entry,
                    migration_id,
                    Some(&snapshot_time),
                    Some(&snapshot_time),
                    opts,
                ) {
                    Ok(row) => rows.push(serde_json::to_value(row)?),
                    Err(e) => {
                        if self.config.strict {
                            return Err(e.into());
                        }
                        warn!(error = %e, "Dropping ACS entry");
                    }
                }
            }

            contracts += rows.len();
            if !rows.is_empty() {
                pending.push(
                    self.pipeline
                        .flush_partition(SchemaKind::Acs, partition.clone(), rows)
                        .await?,
                );
            }

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        await_uploads(pending).await?;
        self.write_complete_marker(&marker_key).await?;
        metrics::increment_counter!("acs_snapshots_total");
        metrics::counter!("acs_contracts_total", contracts as u64);
        info!(
            migration = migration_id,
            snapshot = %snapshot_time,
            contracts,
            "Snapshot complete"
        );
        Ok(())
    }

    /// The zero-byte marker is the snapshot's durability receipt: its
    /// presence means every page landed.
    async fn write_complete_marker(&self, marker_key: &str) -> Result<()> {
        let tmp = std::env::temp_dir().join(format!("acs_complete_{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, b"").await?;
        let ticket = self.pipeline.uploader.enqueue(&tmp, marker_key).await;
        let result = await_uploads(vec![PendingUpload {
            local: tmp,
            remote: marker_key.to_string(),
            ticket,
        }])
        .await;
        result.context("Uploading _COMPLETE marker")
    }
}
