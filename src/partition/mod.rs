use chrono::{DateTime, Datelike, Timelike, Utc};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("Invalid timestamp: {0:?}")]
    InvalidTimestamp(Option<String>),

    #[error("Record {0} has no effective_at and cannot be partitioned")]
    MissingEffectiveAt(String),
}

/// Which table a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Updates,
    Events,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Updates => "updates",
            DataKind::Events => "events",
        }
    }
}

/// Which stream produced a file. Backfill and live data land under
/// separate roots so a restarted backfill never collides with the
/// forward stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Backfill,
    Updates,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Backfill => "backfill",
            Source::Updates => "updates",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UtcPartition {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

/// Parse a timestamp string as UTC. Accepts RFC 3339 with an offset, a
/// trailing `Z`, or a bare datetime which is interpreted as UTC.
pub fn parse_utc(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    // Timestamps without a timezone are UTC.
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(value, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }
    None
}

/// UTC calendar components of an instant. Never silently defaults: a
/// missing or unparseable timestamp is an error.
pub fn utc_partition(instant: Option<&str>) -> Result<UtcPartition, PartitionError> {
    let value = instant.ok_or(PartitionError::InvalidTimestamp(None))?;
    let dt = parse_utc(value)
        .ok_or_else(|| PartitionError::InvalidTimestamp(Some(value.to_string())))?;
    Ok(UtcPartition {
        year: dt.year(),
        month: dt.month(),
        day: dt.day(),
    })
}

/// Hive-style partition path for ledger data. Month and day are
/// unpadded so columnar engines infer them as int64 partition columns.
/// A null migration defaults to 0, which is a valid migration in its
/// own right.
pub fn partition_path(
    instant: Option<&str>,
    migration_id: Option<i64>,
    kind: DataKind,
    source: Source,
) -> Result<String, PartitionError> {
    let p = utc_partition(instant)?;
    Ok(format!(
        "{}/{}/migration={}/year={}/month={}/day={}",
        source.as_str(),
        kind.as_str(),
        migration_id.unwrap_or(0),
        p.year,
        p.month,
        p.day
    ))
}

/// ACS snapshot path. The snapshot id is the zero-padded HHMMSS of the
/// snapshot instant: it is an identifier string, not a partition
/// integer.
pub fn acs_partition_path(
    instant: Option<&str>,
    migration_id: Option<i64>,
) -> Result<String, PartitionError> {
    let value = instant.ok_or(PartitionError::InvalidTimestamp(None))?;
    let dt = parse_utc(value)
        .ok_or_else(|| PartitionError::InvalidTimestamp(Some(value.to_string())))?;
    Ok(format!(
        "acs/migration={}/year={}/month={}/day={}/snapshot_id={:02}{:02}{:02}",
        migration_id.unwrap_or(0),
        dt.year(),
        dt.month(),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second()
    ))
}

/// Rows that carry the timestamp used for day partitioning.
pub trait Partitioned {
    fn partition_instant(&self) -> Option<&str>;
    fn migration_id(&self) -> Option<i64>;
    /// Identifier used in error messages when a row cannot be placed.
    fn identity(&self) -> String;
}

/// Split a buffer whose records may span multiple UTC days into
/// per-partition groups. Fails on the first record that has no
/// partition timestamp; rows must be filtered before they get here.
pub fn group_by_partition<T: Partitioned>(
    records: Vec<T>,
    kind: DataKind,
    source: Source,
    migration_override: Option<i64>,
) -> Result<HashMap<String, Vec<T>>, PartitionError> {
    let mut groups: HashMap<String, Vec<T>> = HashMap::new();
    for record in records {
        if record.partition_instant().is_none() {
            return Err(PartitionError::MissingEffectiveAt(record.identity()));
        }
        let migration = migration_override.or_else(|| record.migration_id());
        let path = partition_path(record.partition_instant(), migration, kind, source)?;
        groups.entry(path).or_default().push(record);
    }
    Ok(groups)
}

/// Normalize a local path to an object-store key. Object stores use
/// forward slashes regardless of platform.
pub fn to_store_path(local: &Path) -> String {
    let raw = local.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        raw.into_owned()
    } else {
        raw.replace(std::path::MAIN_SEPARATOR, "/")
    }
}
