pub mod encoder;

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::schema::SchemaKind;
pub use encoder::EncodedFile;

#[derive(Debug)]
pub struct WriteJob {
    pub kind: SchemaKind,
    /// Hive partition path the resulting file belongs under.
    pub partition_path: String,
    pub rows: Vec<Value>,
}

#[derive(Debug)]
pub struct WriteResult {
    pub partition_path: String,
    pub file: EncodedFile,
}

type JobEnvelope = (WriteJob, oneshot::Sender<Result<WriteResult, anyhow::Error>>);

/// Fixed pool of persistent workers turning record batches into
/// parquet files. The submit channel is bounded at the worker count,
/// so producers block once every worker is busy.
pub struct WriterPool {
    tx: std::sync::Mutex<Option<mpsc::Sender<JobEnvelope>>>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WriterPool {
    pub fn new(workers: usize, tmp_dir: PathBuf) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<JobEnvelope>(workers);
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let tmp_dir = tmp_dir.clone();
                tokio::spawn(async move {
                    loop {
                        let envelope = { rx.lock().await.recv().await };
                        let Some((job, reply)) = envelope else {
                            debug!(worker_id, "Writer worker shutting down");
                            break;
                        };
                        let partition_path = job.partition_path.clone();
                        let tmp = tmp_dir.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            encoder::encode_batch(job.kind, &job.rows, &tmp)
                        })
                        .await
                        .map_err(anyhow::Error::from)
                        .and_then(|r| r)
                        .map(|file| WriteResult {
                            partition_path,
                            file,
                        });

                        if let Err(e) = &result {
                            error!(worker_id, error = %e, "Write job failed");
                        }
                        // Receiver may have given up; nothing to do.
                        let _ = reply.send(result);
                    }
                })
            })
            .collect();

        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            handles: std::sync::Mutex::new(handles),
        }
    }

    /// Submit a job and wait for its file. Blocks on submission when
    /// all workers are busy, which is the pool's back-pressure.
    pub async fn submit(&self, job: WriteJob) -> Result<WriteResult, anyhow::Error> {
        let tx = self
            .tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Writer pool is shut down"))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send((job, reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("Writer pool is shut down"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("Writer worker dropped the job"))?
    }

    /// Stop accepting jobs and wait for in-flight work to finish.
    pub async fn shutdown(&self) {
        self.tx.lock().unwrap().take();
        let handles = { std::mem::take(&mut *self.handles.lock().unwrap()) };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
