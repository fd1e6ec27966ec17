use anyhow::Result;
use chrono::{TimeZone, Utc};

use crate::store::ObjectStore;

/// A day partition parsed back out of an object key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct KeyPartition {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl KeyPartition {
    /// Midnight UTC at the start of this day.
    pub fn day_start(&self) -> Option<String> {
        Utc.with_ymd_and_hms(self.year, self.month, self.day, 0, 0, 0)
            .single()
            .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
    }
}

/// Positions recovered by walking the object store, used when cursor
/// files are missing or being rebuilt.
#[derive(Debug, Clone, Default)]
pub struct ResumePositions {
    /// Newest day with live data: the forward stream replays from its
    /// start, duplicates suppressed downstream.
    pub live_newest_day: Option<KeyPartition>,
    /// Oldest day with backfill data: the backward stream resumes from
    /// its start.
    pub backfill_oldest_day: Option<KeyPartition>,
    /// Snapshot directories that already carry a `_COMPLETE` marker.
    pub completed_snapshots: Vec<String>,
}

fn segment_value(key: &str, name: &str) -> Option<i64> {
    let tag = format!("{name}=");
    key.split('/')
        .find_map(|segment| segment.strip_prefix(tag.as_str()))
        .and_then(|v| v.parse::<i64>().ok())
}

/// Parse `year=Y/month=m/day=d` out of a partitioned object key.
pub fn parse_key_partition(key: &str) -> Option<KeyPartition> {
    Some(KeyPartition {
        year: segment_value(key, "year")? as i32,
        month: segment_value(key, "month")? as u32,
        day: segment_value(key, "day")? as u32,
    })
}

/// Walk the store under `prefix` and derive the latest durable
/// position of every stream.
pub async fn scan_store<S: ObjectStore>(store: &S, prefix: &str) -> Result<ResumePositions> {
    let prefix = prefix.trim_end_matches('/');
    let keys = store.list(prefix).await?;
    let mut positions = ResumePositions::default();

    let live_prefix = format!("{prefix}/updates/");
    let backfill_prefix = format!("{prefix}/backfill/");
    let acs_prefix = format!("{prefix}/acs/");

    for key in keys {
        if key.starts_with(&acs_prefix) {
            if let Some(dir) = key.strip_suffix("/_COMPLETE") {
                positions.completed_snapshots.push(dir.to_string());
            }
            continue;
        }
        let Some(partition) = parse_key_partition(&key) else {
            continue;
        };
        if key.starts_with(&live_prefix) {
            match &positions.live_newest_day {
                Some(current) if *current >= partition => {}
                _ => positions.live_newest_day = Some(partition),
            }
        } else if key.starts_with(&backfill_prefix) {
            match &positions.backfill_oldest_day {
                Some(current) if *current <= partition => {}
                _ => positions.backfill_oldest_day = Some(partition),
            }
        }
    }

    positions.completed_snapshots.sort();
    Ok(positions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsObjectStore;
    use tempfile::TempDir;

    async fn seed(store: &FsObjectStore, keys: &[&str]) {
        let scratch = TempDir::new().unwrap();
        let local = scratch.path().join("f");
        tokio::fs::write(&local, b"x").await.unwrap();
        for key in keys {
            store.put(&local, key).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_scan_finds_stream_positions() -> Result<(), anyhow::Error> {
        let root = TempDir::new()?;
        let store = FsObjectStore::new(root.path());
        seed(
            &store,
            &[
                "raw/updates/updates/migration=0/year=2025/month=4/day=17/a.parquet",
                "raw/updates/updates/migration=0/year=2025/month=4/day=18/b.parquet",
                "raw/backfill/updates/migration=0/year=2025/month=3/day=2/c.parquet",
                "raw/backfill/events/migration=0/year=2025/month=2/day=27/d.parquet",
                "raw/acs/migration=0/year=2025/month=4/day=17/snapshot_id=070509/_COMPLETE",
                "raw/acs/migration=0/year=2025/month=4/day=17/snapshot_id=070509/e.parquet",
            ],
        )
        .await;

        let positions = scan_store(&store, "raw").await?;
        assert_eq!(
            positions.live_newest_day,
            Some(KeyPartition { year: 2025, month: 4, day: 18 })
        );
        assert_eq!(
            positions.backfill_oldest_day,
            Some(KeyPartition { year: 2025, month: 2, day: 27 })
        );
        assert_eq!(positions.completed_snapshots.len(), 1);
        assert!(positions.completed_snapshots[0].ends_with("snapshot_id=070509"));
        Ok(())
    }

    #[tokio::test]
    async fn test_scan_empty_store() -> Result<(), anyhow::Error> {
        let root = TempDir::new()?;
        let store = FsObjectStore::new(root.path());
        let positions = scan_store(&store, "raw").await?;
        assert_eq!(positions.live_newest_day, None);
        assert_eq!(positions.backfill_oldest_day, None);
        assert!(positions.completed_snapshots.is_empty());
        Ok(())
    }

    #[test]
    fn test_parse_key_partition() {
        let key = "raw/backfill/events/migration=4/year=2025/month=4/day=7/x.parquet";
        assert_eq!(
            parse_key_partition(key),
            Some(KeyPartition { year: 2025, month: 4, day: 7 })
        );
        assert_eq!(parse_key_partition("raw/no/partitions/here"), None);
    }

    #[test]
    fn test_day_start_is_midnight_utc() {
        let p = KeyPartition { year: 2025, month: 4, day: 7 };
        assert_eq!(p.day_start().as_deref(), Some("2025-04-07T00:00:00.000000Z"));
    }
}
