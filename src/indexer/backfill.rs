use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{await_uploads, PendingUpload, SeenSet, StreamPipeline};
use crate::cursor::{Cursor, CursorUpdate};
use crate::partition::{group_by_partition, parse_utc, DataKind, Source};
use crate::scan_api::ScanClient;
use crate::schema::normalize::{normalize_update_with_events, NormalizeOptions};
use crate::schema::SchemaKind;
use crate::store::ObjectStore;

/// One slice's time range: `[after, before)`, walked newest-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceBounds {
    pub before: String,
    pub after: String,
}

/// Split `[min_time, max_time)` into `n` equal slices, index 0 newest.
pub fn compute_slices(max_time: DateTime<Utc>, min_time: DateTime<Utc>, n: usize) -> Vec<SliceBounds> {
    let n = n.max(1);
    let total = max_time - min_time;
    let step = total / n as i32;
    let mut slices = Vec::with_capacity(n);
    for i in 0..n {
        let before = max_time - step * i as i32;
        let after = if i == n - 1 {
            min_time
        } else {
            max_time - step * (i as i32 + 1)
        };
        slices.push(SliceBounds {
            before: before.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            after: after.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        });
    }
    slices
}

/// The conservative cursor boundary: the earliest durable time of the
/// longest contiguous prefix of completed slices starting at index 0,
/// or the starting boundary when the newest slice is still open. The
/// durable cursor can never pass a slice that failed or has not
/// finished, so a restart re-fetches exactly the missing region.
pub fn safe_cursor_boundary(
    start_before: &str,
    completed: &[bool],
    earliest: &[Option<String>],
    bounds: &[SliceBounds],
) -> String {
    let contiguous = completed.iter().take_while(|done| **done).count();
    if contiguous == 0 {
        return start_before.to_string();
    }
    let last = contiguous - 1;
    earliest[last]
        .clone()
        .unwrap_or_else(|| bounds[last].after.clone())
}

struct SliceProgress {
    completed: Vec<bool>,
    earliest: Vec<Option<String>>,
    bounds: Vec<SliceBounds>,
}

pub struct BackfillConfig {
    pub migration_id: i64,
    pub page_size: usize,
    pub slices: usize,
    pub strict: bool,
    /// Resume from the local confirmation instead of the remote
    /// checkpoint; may replay data that never reached the store.
    pub use_local_cursor: bool,
}

/// Parallel historical fetcher. The time range is sharded into slices
/// that run concurrently; the durable cursor advances only along the
/// contiguous prefix of completed slices.
pub struct BackfillEngine<S: ObjectStore> {
    client: Arc<ScanClient>,
    pipeline: Arc<StreamPipeline<S>>,
    cursor: Arc<Cursor>,
    seen: Arc<SeenSet>,
    config: BackfillConfig,
    cancel: CancellationToken,
    total_updates: AtomicI64,
    total_events: AtomicI64,
}

impl<S: ObjectStore> BackfillEngine<S> {
    pub fn new(
        client: Arc<ScanClient>,
        pipeline: Arc<StreamPipeline<S>>,
        cursor: Arc<Cursor>,
        seen: Arc<SeenSet>,
        config: BackfillConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            pipeline,
            cursor,
            seen,
            config,
            cancel,
            total_updates: AtomicI64::new(0),
            total_events: AtomicI64::new(0),
        }
    }

    /// Run the backfill over `[min_time, max_time)`. Returns an error
    /// when any slice could not be completed; the cursor then points at
    /// the safe boundary for the next attempt.
    pub async fn run(&self, max_time: DateTime<Utc>, min_time: DateTime<Utc>) -> Result<()> {
        if self.cursor.is_complete().await {
            info!(migration = self.config.migration_id, "Backfill already complete, nothing to do");
            return Ok(());
        }

        // Resume from the remote checkpoint when one exists: the data
        // newer than it has already landed durably.
        let start_before = match self.cursor.resume_position(self.config.use_local_cursor).await {
            Some(resume) => parse_utc(&resume)
                .with_context(|| format!("Unparseable cursor resume position: {resume}"))?
                .min(max_time),
            None => max_time,
        };
        if start_before <= min_time {
            info!(migration = self.config.migration_id, "Backfill window already covered");
            self.cursor.mark_complete().await?;
            return Ok(());
        }

        let bounds = compute_slices(start_before, min_time, self.config.slices);
        let start_before_str = start_before.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        info!(
            migration = self.config.migration_id,
            slices = bounds.len(),
            from = %start_before_str,
            to = %bounds.last().map(|b| b.after.clone()).unwrap_or_default(),
            "Starting backfill"
        );

        let progress = Arc::new(Mutex::new(SliceProgress {
            completed: vec![false; bounds.len()],
            earliest: vec![None; bounds.len()],
            bounds: bounds.clone(),
        }));

        let slice_futures: Vec<_> = bounds
            .iter()
            .enumerate()
            .map(|(index, slice)| {
                let slice = slice.clone();
                let progress = Arc::clone(&progress);
                let start_before_str = start_before_str.clone();
                async move {
                    match self.run_slice(index, &slice).await {
                        Ok(earliest) => {
                            self.complete_slice(index, earliest, &progress, &start_before_str)
                                .await?;
                            Ok(())
                        }
                        Err(e) => {
                            error!(slice = index, error = %e, "Slice failed, cursor will not pass it");
                            Err(e)
                        }
                    }
                }
            })
            .collect();

        let results = futures::future::join_all(slice_futures).await;
        if self.cancel.is_cancelled() {
            info!("Backfill cancelled before completion");
            return Ok(());
        }
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            anyhow::bail!("Backfill finished with {failed} failed slice(s)");
        }

        self.cursor.mark_complete().await?;
        info!(
            migration = self.config.migration_id,
            updates = self.total_updates.load(Ordering::Relaxed),
            events = self.total_events.load(Ordering::Relaxed),
            "Backfill complete"
        );
        Ok(())
    }

    /// Walk one slice backward page by page. Returns the earliest
    /// record time durably persisted for the slice, or None when the
    /// slice produced no data.
    async fn run_slice(&self, index: usize, slice: &SliceBounds) -> Result<Option<String>> {
        let mut before = slice.before.clone();
        let mut slice_earliest: Option<String> = None;
        let mut slice_updates = 0i64;
        let mut slice_events = 0i64;
        let opts = NormalizeOptions {
            strict: self.config.strict,
            warn_only: true,
        };

        loop {
            if self.cancel.is_cancelled() {
                anyhow::bail!("Cancelled");
            }

            let page = self
                .client
                .updates_before(&before, self.config.page_size)
                .await
                .with_context(|| format!("Slice {index} fetch before {before}"))?;
            if page.envelopes.is_empty() {
                break;
            }

            let mut update_rows = Vec::new();
            let mut event_rows = Vec::new();
            let mut page_oldest: Option<String> = None;

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

                let record_time = normalized.update.record_time.clone();
                if let Some(rt) = &record_time {
                    match &page_oldest {
                        Some(oldest) if oldest.as_str() <= rt.as_str() => {}
                        _ => page_oldest = Some(rt.clone()),
                    }
                    // Outside this slice's range: an overlapping page
                    // from the neighbouring slice will cover it.
                    if rt.as_str() < slice.after.as_str() {
                        continue;
                    }
                }

                if !self.seen.insert(&normalized.update.update_id) {
                    continue;
                }
                if normalized.update.effective_at.is_none() {
                    warn!(update_id = %normalized.update.update_id, "Dropping update without effective_at");
                    continue;
                }

                slice_updates += 1;
                slice_events += normalized.events.len() as i64;
                metrics::increment_counter!("updates_processed_total");
                if let Some(rt) = &record_time {
                    match &slice_earliest {
                        Some(earliest) if earliest.as_str() <= rt.as_str() => {}
                        _ => slice_earliest = Some(rt.clone()),
                    }
                }

                update_rows.push(normalized.update);
                event_rows.extend(normalized.events);
            }

            self.flush_page(update_rows, event_rows).await?;

            // Advance strictly backward; a page that cannot move the
            // boundary would loop forever.
            match page_oldest {
                Some(oldest) if oldest.as_str() < before.as_str() => {
                    if oldest.as_str() <= slice.after.as_str() {
                        break;
                    }
                    before = oldest;
                }
                _ => break,
            }
        }

        self.total_updates.fetch_add(slice_updates, Ordering::Relaxed);
        self.total_events.fetch_add(slice_events, Ordering::Relaxed);
        info!(
            slice = index,
            updates = slice_updates,
            events = slice_events,
            earliest = slice_earliest.as_deref().unwrap_or("-"),
            "Slice drained"
        );
        Ok(slice_earliest)
    }

    /// Write and upload one page's rows. The writer/upload pipeline is
    /// retried with fresh jobs before the slice is given up on.
    async fn flush_page(
        &self,
        update_rows: Vec<crate::schema::UpdateRow>,
        event_rows: Vec<crate::schema::EventRow>,
    ) -> Result<()> {
        if update_rows.is_empty() && event_rows.is_empty() {
            return Ok(());
        }

        let mut attempts = 0;
        let update_values: Vec<(String, Vec<serde_json::Value>)> =
            group_by_partition(update_rows, DataKind::Updates, Source::Backfill, None)?
                .into_iter()
                .map(|(path, rows)| (path, to_values(rows)))
                .collect();
        let event_values: Vec<(String, Vec<serde_json::Value>)> =
            group_by_partition(event_rows, DataKind::Events, Source::Backfill, None)?
                .into_iter()
                .map(|(path, rows)| (path, to_values(rows)))
                .collect();

        loop {
            match self.try_flush(&update_values, &event_values).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts < 3 => {
                    attempts += 1;
                    warn!(attempt = attempts, error = %e, "Page flush failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(250 * attempts)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_flush(
        &self,
        update_values: &[(String, Vec<serde_json::Value>)],
        event_values: &[(String, Vec<serde_json::Value>)],
    ) -> Result<()> {
        let mut pending: Vec<PendingUpload> = Vec::new();
        for (path, rows) in update_values {
            pending.push(
                self.pipeline
                    .flush_partition(SchemaKind::Updates, path.clone(), rows.clone())
                    .await?,
            );
        }
        for (path, rows) in event_values {
            pending.push(
                self.pipeline
                    .flush_partition(SchemaKind::Events, path.clone(), rows.clone())
                    .await?,
            );
        }
        await_uploads(pending).await
    }

    /// Mark a slice done and advance the durable cursor to the safe
    /// boundary. The completion flag flips only after every byte of
    /// the slice has been acknowledged by the object store, which is
    /// what makes the boundary conservative under crashes.
    async fn complete_slice(
        &self,
        index: usize,
        earliest: Option<String>,
        progress: &Mutex<SliceProgress>,
        start_before: &str,
    ) -> Result<()> {
        let mut progress = progress.lock().await;
        progress.completed[index] = true;
        progress.earliest[index] = earliest;

        let boundary = safe_cursor_boundary(
            start_before,
            &progress.completed,
            &progress.earliest,
            &progress.bounds,
        );
        let completed_count = progress.completed.iter().filter(|c| **c).count();
        crate::metrics::record_sync_progress(
            "backfill",
            completed_count as u64,
            progress.completed.len() as u64,
        );

        let updates = self.total_updates.load(Ordering::Relaxed);
        let events = self.total_events.load(Ordering::Relaxed);
        self.cursor
            .save_atomic(CursorUpdate {
                last_confirmed_before: Some(boundary.clone()),
                confirmed_updates: Some(updates),
                confirmed_events: Some(events),
                ..Default::default()
            })
            .await?;
        self.cursor
            .confirm_remote(Some(boundary.clone()), Some(updates), Some(events))
            .await?;
        info!(slice = index, boundary = %boundary, "Slice complete, cursor advanced");
        Ok(())
    }
}

fn to_values<T: serde::Serialize>(rows: Vec<T>) -> Vec<serde_json::Value> {
    rows.into_iter()
        .map(|r| serde_json::to_value(r).expect("row serialization is infallible"))
        .collect()
}
