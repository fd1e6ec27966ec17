pub mod classify;
pub mod dead_letter;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::store::{local_md5_base64, ObjectStore};
use dead_letter::DeadLetterRecord;

#[derive(Debug, Clone)]
pub struct UploadQueueConfig {
    pub concurrency: usize,
    pub count_high_water: usize,
    pub count_low_water: usize,
    pub bytes_high_water: u64,
    pub bytes_low_water: u64,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for UploadQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            count_high_water: 500,
            count_low_water: 200,
            bytes_high_water: 2 * 1024 * 1024 * 1024,
            bytes_low_water: 512 * 1024 * 1024,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
pub struct UploadStats {
    pub uploads_attempted: AtomicU64,
    pub uploads_succeeded: AtomicU64,
    pub uploads_failed: AtomicU64,
    pub retries_attempted: AtomicU64,
    pub bytes_uploaded: AtomicU64,
    pub peak_queue_count: AtomicU64,
    pub peak_queue_bytes: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStatsSnapshot {
    pub uploads_attempted: u64,
    pub uploads_succeeded: u64,
    pub uploads_failed: u64,
    pub retries_attempted: u64,
    pub bytes_uploaded: u64,
    pub peak_queue_count: u64,
    pub peak_queue_bytes: u64,
}

impl UploadStats {
    pub fn snapshot(&self) -> UploadStatsSnapshot {
        UploadStatsSnapshot {
            uploads_attempted: self.uploads_attempted.load(Ordering::Relaxed),
            uploads_succeeded: self.uploads_succeeded.load(Ordering::Relaxed),
            uploads_failed: self.uploads_failed.load(Ordering::Relaxed),
            retries_attempted: self.retries_attempted.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            peak_queue_count: self.peak_queue_count.load(Ordering::Relaxed),
            peak_queue_bytes: self.peak_queue_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Resolves once the file has durably landed (or been dead-lettered).
pub type UploadTicket = oneshot::Receiver<Result<(), String>>;

struct UploadJob {
    local_path: PathBuf,
    remote_path: String,
    size_bytes: u64,
    ticket: oneshot::Sender<Result<(), String>>,
}

struct QueueState {
    waiting: VecDeque<UploadJob>,
    /// Jobs enqueued but not yet completed, including in-flight ones.
    queued_count: usize,
    queued_bytes: u64,
    paused: bool,
}

/// Result of the post-upload integrity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub ok: bool,
    pub local_md5: String,
    pub remote_md5: Option<String>,
    pub error: Option<String>,
}

/// Compare the local file's MD5 against what the object store reports.
pub async fn verify_upload<S: ObjectStore>(
    store: &S,
    local: &Path,
    remote: &str,
) -> Result<VerifyOutcome, String> {
    let local_md5 = local_md5_base64(local)
        .await
        .map_err(|e| format!("Could not hash local file: {e}"))?;
    let remote_md5 = match store.head(remote).await {
        Ok(meta) => meta.md5_base64,
        Err(_) => {
            return Ok(VerifyOutcome {
                ok: false,
                local_md5,
                remote_md5: None,
                error: Some("Could not retrieve GCS object hash".to_string()),
            })
        }
    };
    match remote_md5 {
        Some(remote) if remote == local_md5 => Ok(VerifyOutcome {
            ok: true,
            local_md5,
            remote_md5: Some(remote),
            error: None,
        }),
        Some(remote) => Ok(VerifyOutcome {
            ok: false,
            error: Some(format!(
                "Hash mismatch: local={} remote={}",
                local_md5, remote
            )),
            local_md5,
            remote_md5: Some(remote),
        }),
        None => Ok(VerifyOutcome {
            ok: false,
            local_md5,
            remote_md5: None,
            error: Some("Could not retrieve GCS object hash".to_string()),
        }),
    }
}

/// Back-pressured concurrent uploader. Producers check `should_pause`
/// after enqueueing and stop producing until `should_resume`; the
/// high/low watermark hysteresis keeps the flag from oscillating.
pub struct UploadQueue<S: ObjectStore> {
    store: Arc<S>,
    config: UploadQueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    shutting_down: AtomicBool,
    pub stats: UploadStats,
    dead_letter_path: PathBuf,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: ObjectStore> UploadQueue<S> {
    pub fn start(store: Arc<S>, config: UploadQueueConfig, dead_letter_path: PathBuf) -> Arc<Self> {
        let queue = Arc::new(Self {
            store,
            config: config.clone(),
            state: Mutex::new(QueueState {
                waiting: VecDeque::new(),
                queued_count: 0,
                queued_bytes: 0,
                paused: false,
            }),
            notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
            stats: UploadStats::default(),
            dead_letter_path,
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = queue.workers.lock().unwrap();
        for worker_id in 0..config.concurrency.max(1) {
            let queue = Arc::clone(&queue);
            workers.push(tokio::spawn(async move {
                queue.worker_loop(worker_id).await;
            }));
        }
        drop(workers);
        queue
    }

    /// Queue one file. The size is stat'd here; a stat failure queues
    /// the job with size 0 so it still gets attempted.
    pub async fn enqueue(&self, local: &Path, remote: &str) -> UploadTicket {
        let size_bytes = tokio::fs::metadata(local).await.map(|m| m.len()).unwrap_or(0);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            state.waiting.push_back(UploadJob {
                local_path: local.to_path_buf(),
                remote_path: remote.to_string(),
                size_bytes,
                ticket: tx,
            });
            state.queued_count += 1;
            state.queued_bytes += size_bytes;
            if state.queued_count >= self.config.count_high_water
                || state.queued_bytes >= self.config.bytes_high_water
            {
                if !state.paused {
                    warn!(
                        count = state.queued_count,
                        bytes = state.queued_bytes,
                        "Upload queue above high water, pausing producers"
                    );
                }
                state.paused = true;
            }
            self.stats
                .peak_queue_count
                .fetch_max(state.queued_count as u64, Ordering::Relaxed);
            self.stats
                .peak_queue_bytes
                .fetch_max(state.queued_bytes, Ordering::Relaxed);
            metrics::gauge!("upload_queue_depth", state.queued_count as f64);
            metrics::gauge!("upload_queue_bytes", state.queued_bytes as f64);
        }
        self.notify.notify_one();
        rx
    }

    pub fn should_pause(&self) -> bool {
        self.state.lock().unwrap().paused
    }

    pub fn should_resume(&self) -> bool {
        !self.should_pause()
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().unwrap().queued_count
    }

    async fn worker_loop(&self, worker_id: usize) {
        loop {
            let job = { self.state.lock().unwrap().waiting.pop_front() };
            let Some(job) = job else {
                if self.shutting_down.load(Ordering::SeqCst) {
                    debug!(worker_id, "Upload worker exiting");
                    return;
                }
                // Race window between the pop and this wait is covered
                // by notified() buffering one permit.
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
                continue;
            };
            self.process(worker_id, job).await;
        }
    }

    async fn process(&self, worker_id: usize, job: UploadJob) {
        self.stats.uploads_attempted.fetch_add(1, Ordering::Relaxed);
        let result = self.upload_with_retry(worker_id, &job).await;

        {
            let mut state = self.state.lock().unwrap();
            state.queued_count -= 1;
            state.queued_bytes = state.queued_bytes.saturating_sub(job.size_bytes);
            if state.paused
                && state.queued_count <= self.config.count_low_water
                && state.queued_bytes <= self.config.bytes_low_water
            {
                info!(count = state.queued_count, "Upload queue below low water, resuming");
                state.paused = false;
            }
            metrics::gauge!("upload_queue_depth", state.queued_count as f64);
            metrics::gauge!("upload_queue_bytes", state.queued_bytes as f64);
        }

        match result {
            Ok(()) => {
                self.stats.uploads_succeeded.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_uploaded
                    .fetch_add(job.size_bytes, Ordering::Relaxed);
                metrics::increment_counter!("files_uploaded_total");
                let _ = job.ticket.send(Ok(()));
            }
            Err(error) => {
                self.stats.uploads_failed.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("files_dead_lettered_total");
                let record = DeadLetterRecord::new(&job.local_path, &job.remote_path, &error);
                if let Err(e) = dead_letter::append(&self.dead_letter_path, &record) {
                    error!(error = %e, "Failed to append dead-letter record");
                }
                let _ = job.ticket.send(Err(error));
            }
        }
    }

    async fn upload_with_retry(&self, worker_id: usize, job: &UploadJob) -> Result<(), String> {
        let mut attempt: u32 = 0;
        loop {
            if !job.local_path.exists() {
                return Err("Local file missing".to_string());
            }

            let error = match self.store.put(&job.local_path, &job.remote_path).await {
                Ok(()) => {
                    match verify_upload(self.store.as_ref(), &job.local_path, &job.remote_path)
                        .await
                    {
                        Ok(outcome) if outcome.ok => return Ok(()),
                        Ok(outcome) => format!(
                            "Integrity check failed: {}",
                            outcome.error.unwrap_or_else(|| "unknown".to_string())
                        ),
                        Err(e) => e,
                    }
                }
                Err(e) => e.to_string(),
            };

            let transient = classify::is_transient(&error)
                || error.starts_with("Integrity check failed")
                || error.starts_with("Could not retrieve");
            if !transient {
                error!(worker_id, remote = %job.remote_path, error = %error, "Permanent upload failure");
                return Err(error);
            }
            if attempt >= self.config.max_retries {
                warn!(worker_id, remote = %job.remote_path, error = %error, "Retries exhausted");
                return Err(error);
            }

            let delay = backoff_delay(
                self.config.retry_base_delay,
                self.config.retry_max_delay,
                attempt,
            );
            warn!(
                worker_id,
                remote = %job.remote_path,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient upload failure, retrying"
            );
            self.stats.retries_attempted.fetch_add(1, Ordering::Relaxed);
            metrics::increment_counter!("upload_retries_total");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Wait for every queued job to complete.
    pub async fn drain(&self) {
        while self.queued_count() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Drain, then stop the workers.
    pub async fn shutdown(&self) {
        self.drain().await;
        self.shutting_down.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        let workers = { std::mem::take(&mut *self.workers.lock().unwrap()) };
        for handle in workers {
            let _ = handle.await;
        }
    }
}

/// Exponential backoff with +/-25% jitter, capped.
fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    use rand::Rng;
    let exp = base.saturating_mul(2u32.saturating_pow(attempt));
    let capped = exp.min(max);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    capped.mul_f64(jitter).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FsObjectStore, ObjectMeta, StoreError};
    use tempfile::TempDir;

    fn config(concurrency: usize) -> UploadQueueConfig {
        UploadQueueConfig {
            concurrency,
            count_high_water: 3,
            count_low_water: 1,
            bytes_high_water: 1024 * 1024,
            bytes_low_water: 1024,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
        }
    }

    async fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, bytes).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_upload_succeeds_with_integrity_match() -> Result<(), anyhow::Error> {
        let scratch = TempDir::new()?;
        let store_root = TempDir::new()?;
        let store = Arc::new(FsObjectStore::new(store_root.path()));
        let queue = UploadQueue::start(
            Arc::clone(&store),
            config(2),
            scratch.path().join("dead.jsonl"),
        );

        let local = write_file(scratch.path(), "a.parquet", b"payload").await;
        let ticket = queue.enqueue(&local, "raw/updates/a.parquet").await;
        ticket.await?.map_err(|e| anyhow::anyhow!(e))?;

        assert!(store.head("raw/updates/a.parquet").await.is_ok());
        let stats = queue.stats.snapshot();
        assert_eq!(stats.uploads_succeeded, 1);
        assert_eq!(stats.uploads_failed, 0);
        assert_eq!(stats.bytes_uploaded, 7);
        queue.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_local_file_is_permanent_and_dead_lettered() -> Result<(), anyhow::Error> {
        let scratch = TempDir::new()?;
        let store_root = TempDir::new()?;
        let store = Arc::new(FsObjectStore::new(store_root.path()));
        let dead = scratch.path().join("dead.jsonl");
        let queue = UploadQueue::start(Arc::clone(&store), config(1), dead.clone());

        let gone = scratch.path().join("never.parquet");
        let ticket = queue.enqueue(&gone, "raw/never.parquet").await;
        let err = ticket.await?.unwrap_err();
        assert_eq!(err, "Local file missing");

        let log = std::fs::read_to_string(&dead)?;
        let record: DeadLetterRecord = serde_json::from_str(log.lines().next().unwrap())?;
        assert_eq!(record.remote_path, "raw/never.parquet");
        assert!(!record.file_exists);

        let stats = queue.stats.snapshot();
        assert_eq!(stats.uploads_failed, 1);
        assert_eq!(stats.retries_attempted, 0);
        queue.shutdown().await;
        Ok(())
    }

    /// Store whose put always reports a transient error.
    struct FlakyStore;

    impl ObjectStore for FlakyStore {
        async fn put(&self, _local: &Path, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Other("HTTP 503 Service Unavailable".to_string()))
        }
        async fn head(&self, key: &str) -> Result<ObjectMeta, StoreError> {
            Err(StoreError::NotFound(key.to_string()))
        }
        async fn rename(&self, _from: &str, _to: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn list(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_dead_letter() -> Result<(), anyhow::Error> {
        let scratch = TempDir::new()?;
        let dead = scratch.path().join("dead.jsonl");
        let queue = UploadQueue::start(Arc::new(FlakyStore), config(1), dead.clone());

        let local = write_file(scratch.path(), "a.parquet", b"x").await;
        let ticket = queue.enqueue(&local, "raw/a.parquet").await;
        let err = ticket.await?.unwrap_err();
        assert!(err.contains("503"));

        let stats = queue.stats.snapshot();
        // max_retries = 2: one initial attempt plus two retries.
        assert_eq!(stats.retries_attempted, 2);
        assert_eq!(stats.uploads_failed, 1);
        assert!(dead.exists());
        queue.shutdown().await;
        Ok(())
    }

    /// Store whose uploads wait for a permit, so the queue depth is
    /// under test control.
    struct GatedStore {
        inner: FsObjectStore,
        gate: Arc<tokio::sync::Semaphore>,
    }

    impl ObjectStore for GatedStore {
        async fn put(&self, local: &Path, key: &str) -> Result<(), StoreError> {
            let _permit = self.gate.acquire().await.map_err(|_| {
                StoreError::Other("gate closed".to_string())
            })?;
            self.inner.put(local, key).await
        }
        async fn head(&self, key: &str) -> Result<ObjectMeta, StoreError> {
            self.inner.head(key).await
        }
        async fn rename(&self, from: &str, to: &str) -> Result<(), StoreError> {
            self.inner.rename(from, to).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list(prefix).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_watermark_pause_and_resume() -> Result<(), anyhow::Error> {
        let scratch = TempDir::new()?;
        let store_root = TempDir::new()?;
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let store = Arc::new(GatedStore {
            inner: FsObjectStore::new(store_root.path()),
            gate: Arc::clone(&gate),
        });
        let queue = UploadQueue::start(
            Arc::clone(&store),
            config(1),
            scratch.path().join("dead.jsonl"),
        );

        // With uploads gated, four enqueues sit in the queue, past the
        // high water of three.
        let mut tickets = Vec::new();
        for i in 0..4 {
            let local = write_file(scratch.path(), &format!("f{i}"), b"data").await;
            tickets.push(queue.enqueue(&local, &format!("raw/f{i}")).await);
        }
        assert!(queue.should_pause());
        assert!(queue.stats.snapshot().peak_queue_count >= 3);

        gate.add_permits(4);
        for ticket in tickets {
            ticket.await?.map_err(|e| anyhow::anyhow!(e))?;
        }
        queue.drain().await;
        // Hysteresis: back under the low water, producers resume.
        assert!(queue.should_resume());
        assert_eq!(queue.stats.snapshot().uploads_succeeded, 4);
        queue.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_verify_detects_hash_mismatch() -> Result<(), anyhow::Error> {
        let scratch = TempDir::new()?;
        let store_root = TempDir::new()?;
        let store = FsObjectStore::new(store_root.path());

        let local = write_file(scratch.path(), "a.parquet", b"original").await;
        store.put(&local, "raw/a.parquet").await?;
        // Corrupt the stored copy.
        std::fs::write(store_root.path().join("raw/a.parquet"), b"tampered")?;

        let outcome = verify_upload(&store, &local, "raw/a.parquet").await.unwrap();
        assert!(!outcome.ok);
        let error = outcome.error.unwrap();
        assert!(error.starts_with("Hash mismatch: local="));
        assert!(error.contains("remote="));
        assert_ne!(outcome.local_md5, outcome.remote_md5.unwrap());

        // Identical bytes verify clean.
        std::fs::write(store_root.path().join("raw/a.parquet"), b"original")?;
        let outcome = verify_upload(&store, &local, "raw/a.parquet").await.unwrap();
        assert!(outcome.ok);
        Ok(())
    }

    #[tokio::test]
    async fn test_verify_missing_remote_reports_no_hash() -> Result<(), anyhow::Error> {
        let scratch = TempDir::new()?;
        let store_root = TempDir::new()?;
        let store = FsObjectStore::new(store_root.path());
        let local = write_file(scratch.path(), "a.parquet", b"x").await;
        let outcome = verify_upload(&store, &local, "raw/absent.parquet").await.unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.error.as_deref(), Some("Could not retrieve GCS object hash"));
        Ok(())
    }
}
