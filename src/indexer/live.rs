use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{await_uploads, PartitionBuffers, PendingUpload, SeenSet, StreamPipeline};
use crate::cursor::Cursor;
use crate::partition::{partition_path, utc_partition, DataKind, Source};
use crate::scan_api::ScanClient;
use crate::schema::normalize::{normalize_update_with_events, NormalizeOptions};
use crate::schema::SchemaKind;
use crate::store::ObjectStore;

pub struct LiveConfig {
    pub migration_id: i64,
    pub page_size: usize,
    pub poll_interval: Duration,
    pub flush_rows: usize,
    pub flush_bytes: usize,
    pub strict: bool,
    pub use_local_cursor: bool,
}

/// Forward poller: tails the updates endpoint from the cursor's resume
/// position, buffering rows per partition and committing the cursor
/// only after the upload queue has confirmed the batch.
pub struct LiveEngine<S: ObjectStore> {
    client: Arc<ScanClient>,
    pipeline: Arc<StreamPipeline<S>>,
    cursor: Arc<Cursor>,
    seen: Arc<SeenSet>,
    config: LiveConfig,
    cancel: CancellationToken,
}

impl<S: ObjectStore> LiveEngine<S> {
    pub fn new(
        client: Arc<ScanClient>,
        pipeline: Arc<StreamPipeline<S>>,
        cursor: Arc<Cursor>,
        seen: Arc<SeenSet>,
        config: LiveConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            pipeline,
            cursor,
            seen,
            config,
            cancel,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let mut position = self.cursor.resume_position(self.config.use_local_cursor).await;
        info!(
            migration = self.config.migration_id,
            from = position.as_deref().unwrap_or("ledger begin"),
            "Starting live stream"
        );

        let mut update_buffers = PartitionBuffers::new(self.config.flush_rows, self.config.flush_bytes);
        let mut event_buffers = PartitionBuffers::new(self.config.flush_rows, self.config.flush_bytes);
        let opts = NormalizeOptions {
            strict: self.config.strict,
            warn_only: true,
        };

        loop {
            if self.cancel.is_cancelled() {
                // Push out whatever is buffered before stopping.
                self.flush_and_commit(&mut update_buffers, &mut event_buffers, &mut position)
                    .await?;
                info!("Live stream stopped");
                return Ok(());
            }

            let page = match self
                .client
                .updates_after(position.as_deref(), self.config.page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "Live poll failed, backing off");
                    self.sleep_or_cancel(self.config.poll_interval).await;
                    continue;
                }
            };

            if page.envelopes.is_empty() {
                // Caught up: drain buffers so latency stays bounded,
                // then idle until the next poll.
                self.flush_and_commit(&mut update_buffers, &mut event_buffers, &mut position)
                    .await?;
                self.sleep_or_cancel(self.config.poll_interval).await;
                continue;
            }

            let mut due = Vec::new();
            let mut batch_newest: Option<String> = None;
            let mut batch_updates = 0i64;
            let mut batch_events = 0i64;

            for envelope in &page.envelopes {
                let normalized =
                    match normalize_update_with_events(envelope, self.config.migration_id, opts) {
                        Ok(n) => n,
                        Err(e) => {
                            if self.config.strict {
                                return Err(e.into());
                            }
                            warn!(error = %e, "Dropping undecodable update");
                            continue;
                        }
                    };
                if !self.seen.insert(&normalized.update.update_id) {
                    continue;
                }
                if normalized.update.effective_at.is_none() {
                    warn!(update_id = %normalized.update.update_id, "Dropping update without effective_at");
                    continue;
                }

                if let Some(rt) = &normalized.update.record_time {
                    match &batch_newest {
                        Some(newest) if newest.as_str() >= rt.as_str() => {}
                        _ => batch_newest = Some(rt.clone()),
                    }
                }

                batch_updates += 1;
                batch_events += normalized.events.len() as i64;
                metrics::increment_counter!("updates_processed_total");

                let day = utc_partition(normalized.update.effective_at.as_deref())?;
                let path = partition_path(
                    normalized.update.effective_at.as_deref(),
                    Some(normalized.update.migration_id),
                    DataKind::Updates,
                    Source::Updates,
                )?;
                let row = serde_json::to_value(&normalized.update)?;
                for (path, rows) in update_buffers.push(&path, day, row) {
                    due.push((SchemaKind::Updates, path, rows));
                }

                for event in &normalized.events {
                    let day = utc_partition(event.effective_at.as_deref())?;
                    let path = partition_path(
                        event.effective_at.as_deref(),
                        Some(event.migration_id),
                        DataKind::Events,
                        Source::Updates,
                    )?;
                    let row = serde_json::to_value(event)?;
                    for (path, rows) in event_buffers.push(&path, day, row) {
                        due.push((SchemaKind::Events, path, rows));
                    }
                }
            }

            self.cursor
                .add_pending(batch_updates, batch_events, batch_newest.as_deref())
                .await;

            if !due.is_empty() {
                let mut pending: Vec<PendingUpload> = Vec::new();
                for (kind, path, rows) in due {
                    pending.push(self.pipeline.flush_partition(kind, path, rows).await?);
                }
                if let Err(e) = await_uploads(pending).await {
                    self.cursor.rollback().await;
                    return Err(e);
                }
            }

            // Forced flushes landed; if the page said there is more,
            // keep walking, otherwise settle the batch.
            if page.next_page_token.is_none() {
                self.flush_and_commit(&mut update_buffers, &mut event_buffers, &mut position)
                    .await?;
            }
        }
    }

    /// Drain every buffer, wait for the uploads, then commit the
    /// cursor and synchronize the remote checkpoint. The new resume
    /// position is the committed boundary.
    async fn flush_and_commit(
        &self,
        update_buffers: &mut PartitionBuffers,
        event_buffers: &mut PartitionBuffers,
        position: &mut Option<String>,
    ) -> Result<()> {
        let mut pending: Vec<PendingUpload> = Vec::new();
        for (path, rows) in update_buffers.drain_all() {
            pending.push(
                self.pipeline
                    .flush_partition(SchemaKind::Updates, path, rows)
                    .await?,
            );
        }
        for (path, rows) in event_buffers.drain_all() {
            pending.push(
                self.pipeline
                    .flush_partition(SchemaKind::Events, path, rows)
                    .await?,
            );
        }

        if let Err(e) = await_uploads(pending).await {
            self.cursor.rollback().await;
            return Err(e);
        }

        match self.cursor.commit().await {
            Ok(state) => {
                self.cursor.confirm_remote(None, None, None).await?;
                if let Some(before) = state.last_confirmed_before {
                    *position = Some(before);
                }
                Ok(())
            }
            // Nothing accumulated since the last commit.
            Err(crate::cursor::CursorError::NoTransaction) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn sleep_or_cancel(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}
