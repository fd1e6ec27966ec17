use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

use crate::store::ObjectStore;

/// One failed upload, appended as a JSONL line for operator follow-up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub local_path: String,
    pub remote_path: String,
    pub error: String,
    pub timestamp: String,
    pub file_exists: bool,
}

impl DeadLetterRecord {
    pub fn new(local_path: &Path, remote_path: &str, error: &str) -> Self {
        Self {
            local_path: local_path.to_string_lossy().into_owned(),
            remote_path: remote_path.to_string(),
            error: error.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            file_exists: local_path.exists(),
        }
    }
}

/// Append one record. The log is append-only outside of retry sweeps,
/// so a plain O_APPEND write is safe from any worker.
pub fn append(log_path: &Path, record: &DeadLetterRecord) -> std::io::Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let line = serde_json::to_string(record)?;
    writeln!(file, "{line}")
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub total: usize,
    pub unique: usize,
    pub deduplicated: usize,
    pub retried: usize,
    pub remaining: usize,
    pub no_file: usize,
}

fn read_records(log_path: &Path) -> std::io::Result<Vec<DeadLetterRecord>> {
    let content = match std::fs::read_to_string(log_path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut records = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<DeadLetterRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(error = %e, "Skipping unparseable dead-letter line"),
        }
    }
    Ok(records)
}

/// Deduplicate by remote path keeping the latest timestamp, retry each
/// unique entry, and rewrite the log with what still fails. Entries
/// whose local file is gone are unrecoverable and dropped.
pub async fn process_dead_letter_log<S: ObjectStore>(
    log_path: &Path,
    store: &S,
    dry_run: bool,
) -> Result<SweepReport, anyhow::Error> {
    let records = read_records(log_path)?;
    let mut report = SweepReport {
        total: records.len(),
        ..Default::default()
    };

    let mut latest: HashMap<String, DeadLetterRecord> = HashMap::new();
    for record in records {
        match latest.get(&record.remote_path) {
            Some(existing) if existing.timestamp >= record.timestamp => {}
            _ => {
                latest.insert(record.remote_path.clone(), record);
            }
        }
    }
    report.unique = latest.len();
    report.deduplicated = report.total - report.unique;

    let mut remaining = Vec::new();
    for (_, mut record) in latest {
        let local = std::path::PathBuf::from(&record.local_path);
        if !local.exists() {
            report.no_file += 1;
            continue;
        }
        if dry_run {
            remaining.push(record);
            continue;
        }
        match store.put(&local, &record.remote_path).await {
            Ok(()) => {
                info!(remote = %record.remote_path, "Dead-letter retry succeeded");
                report.retried += 1;
            }
            Err(e) => {
                record.error = e.to_string();
                record.timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
                remaining.push(record);
            }
        }
    }
    report.remaining = remaining.len();

    if !dry_run {
        // Compact: the sweep holds exclusive access to the log.
        let mut buffer = String::new();
        for record in &remaining {
            buffer.push_str(&serde_json::to_string(record)?);
            buffer.push('\n');
        }
        std::fs::write(log_path, buffer)?;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsObjectStore;
    use tempfile::TempDir;

    fn record(local: &Path, remote: &str, ts: &str) -> DeadLetterRecord {
        DeadLetterRecord {
            local_path: local.to_string_lossy().into_owned(),
            remote_path: remote.to_string(),
            error: "HTTP 503".to_string(),
            timestamp: ts.to_string(),
            file_exists: local.exists(),
        }
    }

    #[tokio::test]
    async fn test_dedup_keeps_latest_per_remote_path() -> Result<(), anyhow::Error> {
        let dir = TempDir::new()?;
        let log = dir.path().join("dead_letter.jsonl");
        let local = dir.path().join("f.parquet");
        std::fs::write(&local, b"bytes")?;

        // Three entries over two distinct remote paths, one duplicated
        // at a later time.
        append(&log, &record(&local, "raw/a.parquet", "2025-01-01T00:00:00Z"))?;
        append(&log, &record(&local, "raw/b.parquet", "2025-01-01T00:00:00Z"))?;
        append(&log, &record(&local, "raw/a.parquet", "2025-01-02T00:00:00Z"))?;

        let store_root = TempDir::new()?;
        let store = FsObjectStore::new(store_root.path());
        let report = process_dead_letter_log(&log, &store, false).await?;

        assert_eq!(report.total, 3);
        assert_eq!(report.unique, 2);
        assert_eq!(report.deduplicated, 1);
        assert_eq!(report.retried, 2);
        assert_eq!(report.remaining, 0);
        assert_eq!(report.no_file, 0);

        // Retried entries landed and the log compacted to empty.
        assert!(store.head("raw/a.parquet").await.is_ok());
        assert_eq!(std::fs::read_to_string(&log)?.trim(), "");
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_local_file_counts_no_file() -> Result<(), anyhow::Error> {
        let dir = TempDir::new()?;
        let log = dir.path().join("dead_letter.jsonl");
        let gone = dir.path().join("never-existed.parquet");
        append(&log, &record(&gone, "raw/gone.parquet", "2025-01-01T00:00:00Z"))?;

        let store_root = TempDir::new()?;
        let store = FsObjectStore::new(store_root.path());
        let report = process_dead_letter_log(&log, &store, false).await?;
        assert_eq!(report.no_file, 1);
        assert_eq!(report.retried, 0);
        assert_eq!(report.remaining, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_leaves_log_untouched() -> Result<(), anyhow::Error> {
        let dir = TempDir::new()?;
        let log = dir.path().join("dead_letter.jsonl");
        let local = dir.path().join("f.parquet");
        std::fs::write(&local, b"bytes")?;
        append(&log, &record(&local, "raw/a.parquet", "2025-01-01T00:00:00Z"))?;
        let before = std::fs::read_to_string(&log)?;

        let store_root = TempDir::new()?;
        let store = FsObjectStore::new(store_root.path());
        let report = process_dead_letter_log(&log, &store, true).await?;
        assert_eq!(report.retried, 0);
        assert_eq!(report.remaining, 1);
        assert_eq!(std::fs::read_to_string(&log)?, before);
        assert!(store.head("raw/a.parquet").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_log_is_empty_report() -> Result<(), anyhow::Error> {
        let dir = TempDir::new()?;
        let store = FsObjectStore::new(dir.path());
        let report =
            process_dead_letter_log(&dir.path().join("absent.jsonl"), &store, false).await?;
        assert_eq!(report, SweepReport::default());
        Ok(())
    }
}
