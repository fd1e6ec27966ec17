use arrow::array::{ArrayRef, BooleanBuilder, Int64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde_json::Value;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::schema::{Column, ColumnType, SchemaKind, ValidationError};

/// Outcome of one encode job.
#[derive(Debug, Clone)]
pub struct EncodedFile {
    pub file_path: PathBuf,
    pub row_count: usize,
    pub byte_size: u64,
    /// Non-fatal observations, e.g. optional columns absent from every
    /// row of the batch.
    pub validation: Vec<String>,
}

fn arrow_schema(columns: &[Column]) -> Schema {
    let fields: Vec<Field> = columns
        .iter()
        .map(|c| {
            let ty = match c.ty {
                ColumnType::Utf8 | ColumnType::Json => DataType::Utf8,
                ColumnType::Int64 => DataType::Int64,
                ColumnType::Bool => DataType::Boolean,
            };
            Field::new(c.name, ty, !c.required)
        })
        .collect();
    Schema::new(fields)
}

fn cell_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn build_column(column: &Column, rows: &[Value]) -> Result<ArrayRef, ValidationError> {
    match column.ty {
        ColumnType::Utf8 | ColumnType::Json => {
            let mut builder = StringBuilder::new();
            for row in rows {
                match row.get(column.name) {
                    None | Some(Value::Null) => builder.append_null(),
                    Some(v) => builder.append_option(cell_string(v)),
                }
            }
            Ok(Arc::new(builder.finish()))
        }
        ColumnType::Int64 => {
            let mut builder = Int64Builder::new();
            for row in rows {
                let cell = row.get(column.name).and_then(|v| match v {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => s.parse::<i64>().ok(),
                    _ => None,
                });
                builder.append_option(cell);
            }
            Ok(Arc::new(builder.finish()))
        }
        ColumnType::Bool => {
            let mut builder = BooleanBuilder::new();
            for row in rows {
                builder.append_option(row.get(column.name).and_then(|v| v.as_bool()));
            }
            Ok(Arc::new(builder.finish()))
        }
    }
}

/// Reject batches where a required column is missing or null; the
/// upstream normalizers guarantee these, so a violation here is a bug
/// worth stopping on rather than shipping a broken file.
fn validate_columns(kind: SchemaKind, rows: &[Value]) -> Result<Vec<String>, ValidationError> {
    let mut notes = Vec::new();
    for column in kind.columns() {
        let present = rows
            .iter()
            .filter(|row| row.get(column.name).map_or(false, |v| !v.is_null()))
            .count();
        if column.required && present != rows.len() {
            return Err(ValidationError::SchemaValidation(format!(
                "column {} required but only {}/{} rows carry it",
                column.name,
                present,
                rows.len()
            )));
        }
        if !column.required && present == 0 {
            notes.push(format!("column {} empty in batch", column.name));
        }
    }
    Ok(notes)
}

/// Encode one batch of rows into a single parquet file under `tmp_dir`.
/// Blocking; callers run it on a blocking thread.
pub fn encode_batch(
    kind: SchemaKind,
    rows: &[Value],
    tmp_dir: &Path,
) -> Result<EncodedFile, anyhow::Error> {
    if rows.is_empty() {
        anyhow::bail!("Refusing to encode an empty batch");
    }
    let validation = validate_columns(kind, rows)?;

    let schema = Arc::new(arrow_schema(kind.columns()));
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(kind.columns().len());
    for column in kind.columns() {
        arrays.push(build_column(column, rows)?);
    }
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;

    std::fs::create_dir_all(tmp_dir)?;
    let file_name = format!(
        "{}_{}_{}.parquet",
        kind.file_prefix(),
        Utc::now().format("%Y%m%d%H%M%S"),
        Uuid::new_v4().simple()
    );
    let file_path = tmp_dir.join(file_name);

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let file = File::create(&file_path)?;
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    let byte_size = std::fs::metadata(&file_path)?.len();
    Ok(EncodedFile {
        file_path,
        row_count: rows.len(),
        byte_size,
        validation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::normalize::{normalize_update, NormalizeOptions};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use serde_json::json;
    use tempfile::TempDir;

    fn update_rows() -> Vec<Value> {
        let raw = json!({
            "transaction": {
                "update_id": "u-1",
                "record_time": "2025-04-17T23:50:00Z",
                "effective_at": "2025-04-17T23:49:58Z",
                "offset": "000042"
            }
        });
        let row = normalize_update(&raw, 4, NormalizeOptions::default()).unwrap();
        vec![serde_json::to_value(row).unwrap()]
    }

    #[test]
    fn test_encode_and_read_back() -> Result<(), anyhow::Error> {
        let tmp = TempDir::new()?;
        let encoded = encode_batch(SchemaKind::Updates, &update_rows(), tmp.path())?;
        assert_eq!(encoded.row_count, 1);
        assert!(encoded.byte_size > 0);
        assert!(encoded.file_path.exists());

        let file = File::open(&encoded.file_path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        let batches: Vec<RecordBatch> = reader.collect::<Result<_, _>>()?;
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 1);
        let schema = batches[0].schema();
        assert!(schema.column_with_name("update_data").is_some());
        assert!(schema.column_with_name("migration_id").is_some());
        Ok(())
    }

    #[test]
    fn test_missing_required_column_fails() {
        let tmp = TempDir::new().unwrap();
        let rows = vec![json!({"update_id": "u-1"})];
        let err = encode_batch(SchemaKind::Updates, &rows, tmp.path()).unwrap_err();
        assert!(err.to_string().contains("required"));
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let tmp = TempDir::new().unwrap();
        assert!(encode_batch(SchemaKind::Events, &[], tmp.path()).is_err());
    }
}
