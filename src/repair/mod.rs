use anyhow::{Context, Result};
use arrow::array::{Array, StringArray};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ProjectionMask;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::partition::{utc_partition, UtcPartition};
use crate::schema::SchemaKind;
use crate::writer::encoder;

/// What to do with one catalogued file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Rows already match the directory they sit in.
    Skip,
    /// No timestamps could be read; left alone.
    SkipNoTimestamps,
    /// Every row shares one UTC day that differs from the directory.
    Move { dest: PathBuf },
    /// Rows span several UTC days; one output file per day.
    Split { days: Vec<UtcPartition> },
}

#[derive(Debug, Clone)]
pub struct FileAction {
    pub path: PathBuf,
    pub decision: Decision,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub scanned: usize,
    pub skipped: usize,
    pub skipped_no_timestamps: usize,
    pub moved: usize,
    pub split: usize,
}

/// All parquet files under `root`, relative order stable for
/// reproducible runs.
pub fn catalog(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
                continue;
            }
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().map_or(false, |ext| ext == "parquet") {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Read up to `sample_limit` values of the named timestamp column.
fn sample_timestamps(path: &Path, column: &str, sample_limit: usize) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("Opening {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let parquet_schema = builder.parquet_schema();
    let Some(leaf_index) = parquet_schema
        .columns()
        .iter()
        .position(|c| c.name() == column)
    else {
        return Ok(Vec::new());
    };
    let mask = ProjectionMask::leaves(parquet_schema, [leaf_index]);
    let reader = builder.with_projection(mask).build()?;

    let mut values = Vec::new();
    for batch in reader {
        let batch = batch?;
        let column = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| anyhow::anyhow!("Timestamp column {column} is not a string column"))?;
        for i in 0..column.len() {
            if column.is_valid(i) {
                values.push(column.value(i).to_string());
                if values.len() >= sample_limit {
                    return Ok(values);
                }
            }
        }
    }
    Ok(values)
}

fn observed_days(timestamps: &[String]) -> BTreeSet<UtcPartition> {
    let mut days = BTreeSet::new();
    for ts in timestamps {
        match utc_partition(Some(ts)) {
            Ok(day) => {
                days.insert(day);
            }
            Err(_) => warn!(timestamp = %ts, "Unparseable timestamp in file, ignoring"),
        }
    }
    days
}

/// The partition a file claims, read off its directory path.
pub fn parsed_partition(path: &Path) -> Option<UtcPartition> {
    let key = path.to_string_lossy();
    let partition = crate::indexer::resume::parse_key_partition(&key)?;
    Some(UtcPartition {
        year: partition.year,
        month: partition.month,
        day: partition.day,
    })
}

/// Rewrite the `year=`/`month=`/`day=` segments of a path for a new
/// day, keeping the filename.
pub fn retarget_path(path: &Path, day: UtcPartition) -> PathBuf {
    let mut segments: Vec<String> = Vec::new();
    for component in path.iter() {
        let segment = component.to_string_lossy();
        let rewritten = if segment.starts_with("year=") {
            format!("year={}", day.year)
        } else if segment.starts_with("month=") {
            format!("month={}", day.month)
        } else if segment.starts_with("day=") {
            format!("day={}", day.day)
        } else {
            segment.into_owned()
        };
        segments.push(rewritten);
    }
    segments.iter().collect()
}

/// Decide what to do with one file.
pub fn plan_file(path: &Path, kind: SchemaKind, sample_limit: usize) -> Result<FileAction> {
    let timestamps = sample_timestamps(path, kind.timestamp_column(), sample_limit)?;
    let days = observed_days(&timestamps);

    let decision = if days.is_empty() {
        Decision::SkipNoTimestamps
    } else if let Some(parsed) = parsed_partition(path) {
        if days.len() == 1 && days.contains(&parsed) {
            Decision::Skip
        } else if days.len() == 1 {
            let day = *days.iter().next().expect("non-empty");
            Decision::Move {
                dest: retarget_path(path, day),
            }
        } else {
            Decision::Split {
                days: days.into_iter().collect(),
            }
        }
    } else {
        // Not under a recognizable partition directory; leave alone.
        Decision::SkipNoTimestamps
    };

    Ok(FileAction {
        path: path.to_path_buf(),
        decision,
    })
}

/// Plan every file under the stream root.
pub fn plan(root: &Path, kind: SchemaKind, sample_limit: usize) -> Result<Vec<FileAction>> {
    catalog(root)?
        .iter()
        .map(|path| plan_file(path, kind, sample_limit))
        .collect()
}

fn read_all_rows(path: &Path) -> Result<Vec<Value>> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let batches: Vec<RecordBatch> = reader.collect::<Result<_, _>>()?;

    let mut writer = arrow::json::ArrayWriter::new(Vec::new());
    for batch in &batches {
        writer.write(batch)?;
    }
    writer.finish()?;
    let bytes = writer.into_inner();
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(&bytes)?)
}

/// Apply a plan. Moves rename in place; splits rewrite one file per
/// observed day and remove the original. Returns the executed actions'
/// destination files for verification.
pub fn execute(
    actions: &[FileAction],
    kind: SchemaKind,
    dry_run: bool,
) -> Result<(RepairReport, Vec<(PathBuf, UtcPartition)>)> {
    let mut report = RepairReport::default();
    let mut outputs: Vec<(PathBuf, UtcPartition)> = Vec::new();

    for action in actions {
        report.scanned += 1;
        match &action.decision {
            Decision::Skip => report.skipped += 1,
            Decision::SkipNoTimestamps => report.skipped_no_timestamps += 1,
            Decision::Move { dest } => {
                info!(from = %action.path.display(), to = %dest.display(), dry_run, "Moving misplaced file");
                if !dry_run {
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::rename(&action.path, dest)?;
                }
                if let Some(day) = parsed_partition(dest) {
                    outputs.push((dest.clone(), day));
                }
                report.moved += 1;
            }
            Decision::Split { days } => {
                info!(
                    file = %action.path.display(),
                    days = days.len(),
                    dry_run,
                    "Splitting file spanning multiple days"
                );
                if !dry_run {
                    outputs.extend(split_file(&action.path, kind, days)?);
                }
                report.split += 1;
            }
        }
    }
    Ok((report, outputs))
}

fn split_file(
    path: &Path,
    kind: SchemaKind,
    days: &[UtcPartition],
) -> Result<Vec<(PathBuf, UtcPartition)>> {
    let rows = read_all_rows(path)?;
    let column = kind.timestamp_column();
    let mut outputs = Vec::new();

    for &day in days {
        let day_rows: Vec<Value> = rows
            .iter()
            .filter(|row| {
                row.get(column)
                    .and_then(|v| v.as_str())
                    .and_then(|ts| utc_partition(Some(ts)).ok())
                    .map_or(false, |d| d == day)
            })
            .cloned()
            .collect();
        if day_rows.is_empty() {
            continue;
        }

        let dest_dir = retarget_path(path.parent().unwrap_or(Path::new(".")), day);
        std::fs::create_dir_all(&dest_dir)?;
        let encoded = encoder::encode_batch(kind, &day_rows, &dest_dir)?;
        outputs.push((encoded.file_path, day));
    }

    std::fs::remove_file(path)?;
    Ok(outputs)
}

/// Post-move verification: sample each output file and fail on the
/// first row whose UTC day does not match the destination partition.
/// The returned error carries the offending timestamp.
pub fn verify_outputs(
    outputs: &[(PathBuf, UtcPartition)],
    kind: SchemaKind,
    sample_limit: usize,
) -> Result<(), String> {
    for (path, expected) in outputs {
        let timestamps = match sample_timestamps(path, kind.timestamp_column(), sample_limit) {
            Ok(ts) => ts,
            Err(e) => return Err(format!("{}: {e}", path.display())),
        };
        for ts in timestamps {
            match utc_partition(Some(&ts)) {
                Ok(day) if day == *expected => {}
                _ => return Err(ts),
            }
        }
    }
    Ok(())
}
