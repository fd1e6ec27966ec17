pub mod normalize;
pub mod template;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::partition::Partitioned;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid timestamp: {0:?}")]
    InvalidTimestamp(Option<String>),

    #[error("Unknown update type for update {update_id}")]
    UnknownUpdateType { update_id: String },

    #[error("Missing critical fields on {context}: {fields:?}")]
    MissingCriticalField {
        context: String,
        fields: Vec<&'static str>,
    },

    #[error("ACS validation failed for {contract_id}: missing {missing:?}")]
    AcsValidation {
        contract_id: String,
        missing: Vec<&'static str>,
    },

    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),
}

/// One committed ledger operation, flattened for columnar output. The
/// reassignment-only fields are non-null exactly when `update_type`
/// is "reassignment"; the complete source envelope survives verbatim
/// in `update_data`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateRow {
    pub update_id: String,
    pub update_type: String,
    pub migration_id: i64,
    pub synchronizer_id: Option<String>,
    pub workflow_id: Option<String>,
    pub command_id: Option<String>,
    pub offset: Option<i64>,
    pub record_time: Option<String>,
    pub effective_at: Option<String>,
    pub root_event_ids: Vec<String>,
    pub event_count: i64,
    pub trace_context: Option<String>,
    pub kind: Option<String>,
    pub source_synchronizer: Option<String>,
    pub target_synchronizer: Option<String>,
    pub unassign_id: Option<String>,
    pub submitter: Option<String>,
    pub reassignment_counter: Option<i64>,
    pub update_data: String,
}

impl Partitioned for UpdateRow {
    fn partition_instant(&self) -> Option<&str> {
        self.effective_at.as_deref()
    }
    fn migration_id(&self) -> Option<i64> {
        Some(self.migration_id)
    }
    fn identity(&self) -> String {
        self.update_id.clone()
    }
}

/// One node of an update's event tree. Created-only fields are null on
/// exercised events and vice versa.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventRow {
    pub event_id: String,
    pub update_id: String,
    pub migration_id: i64,
    pub event_type: String,
    pub contract_id: Option<String>,
    pub template_id: Option<String>,
    pub package_name: Option<String>,
    pub module_name: Option<String>,
    pub entity_name: Option<String>,
    pub effective_at: Option<String>,
    pub signatories: Option<Vec<String>>,
    pub observers: Option<Vec<String>>,
    pub witness_parties: Option<Vec<String>>,
    pub choice: Option<String>,
    pub choice_argument: Option<String>,
    pub acting_parties: Option<Vec<String>>,
    pub child_event_ids: Option<Vec<String>>,
    pub exercise_result: Option<String>,
    pub consuming: Option<bool>,
    pub raw_event: String,
}

impl Partitioned for EventRow {
    fn partition_instant(&self) -> Option<&str> {
        self.effective_at.as_deref()
    }
    fn migration_id(&self) -> Option<i64> {
        Some(self.migration_id)
    }
    fn identity(&self) -> String {
        format!("{}/{}", self.update_id, self.event_id)
    }
}

/// One live contract at a snapshot instant. Snapshot identity is
/// (migration_id, snapshot_time).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AcsContractRow {
    pub contract_id: String,
    pub event_id: Option<String>,
    pub template_id: Option<String>,
    pub package_name: Option<String>,
    pub module_name: Option<String>,
    pub entity_name: Option<String>,
    pub signatories: Option<Vec<String>>,
    pub observers: Option<Vec<String>>,
    pub witness_parties: Option<Vec<String>>,
    pub migration_id: i64,
    pub record_time: Option<String>,
    pub snapshot_time: Option<String>,
    pub payload: Option<String>,
    pub raw: String,
}

impl Partitioned for AcsContractRow {
    fn partition_instant(&self) -> Option<&str> {
        self.snapshot_time.as_deref()
    }
    fn migration_id(&self) -> Option<i64> {
        Some(self.migration_id)
    }
    fn identity(&self) -> String {
        self.contract_id.clone()
    }
}

/// Physical column type in the output files. Party arrays and other
/// nested values are stored as JSON strings so every engine reading the
/// lake sees the same bytes the API produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Utf8,
    Int64,
    Bool,
    /// Any JSON value, serialized to its string form.
    Json,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub required: bool,
}

const fn col(name: &'static str, ty: ColumnType, required: bool) -> Column {
    Column { name, ty, required }
}

pub const UPDATE_COLUMNS: &[Column] = &[
    col("update_id", ColumnType::Utf8, true),
    col("update_type", ColumnType::Utf8, true),
    col("migration_id", ColumnType::Int64, true),
    col("synchronizer_id", ColumnType::Utf8, false),
    col("workflow_id", ColumnType::Utf8, false),
    col("command_id", ColumnType::Utf8, false),
    col("offset", ColumnType::Int64, false),
    col("record_time", ColumnType::Utf8, false),
    col("effective_at", ColumnType::Utf8, true),
    col("root_event_ids", ColumnType::Json, false),
    col("event_count", ColumnType::Int64, true),
    col("trace_context", ColumnType::Utf8, false),
    col("kind", ColumnType::Utf8, false),
    col("source_synchronizer", ColumnType::Utf8, false),
    col("target_synchronizer", ColumnType::Utf8, false),
    col("unassign_id", ColumnType::Utf8, false),
    col("submitter", ColumnType::Utf8, false),
    col("reassignment_counter", ColumnType::Int64, false),
    col("update_data", ColumnType::Utf8, true),
];

pub const EVENT_COLUMNS: &[Column] = &[
    col("event_id", ColumnType::Utf8, true),
    col("update_id", ColumnType::Utf8, true),
    col("migration_id", ColumnType::Int64, true),
    col("event_type", ColumnType::Utf8, true),
    col("contract_id", ColumnType::Utf8, false),
    col("template_id", ColumnType::Utf8, false),
    col("package_name", ColumnType::Utf8, false),
    col("module_name", ColumnType::Utf8, false),
    col("entity_name", ColumnType::Utf8, false),
    col("effective_at", ColumnType::Utf8, true),
    col("signatories", ColumnType::Json, false),
    col("observers", ColumnType::Json, false),
    col("witness_parties", ColumnType::Json, false),
    col("choice", ColumnType::Utf8, false),
    col("choice_argument", ColumnType::Utf8, false),
    col("acting_parties", ColumnType::Json, false),
    col("child_event_ids", ColumnType::Json, false),
    col("exercise_result", ColumnType::Utf8, false),
    col("consuming", ColumnType::Bool, false),
    col("raw_event", ColumnType::Utf8, true),
];

pub const ACS_COLUMNS: &[Column] = &[
    col("contract_id", ColumnType::Utf8, true),
    col("event_id", ColumnType::Utf8, false),
    col("template_id", ColumnType::Utf8, false),
    col("package_name", ColumnType::Utf8, false),
    col("module_name", ColumnType::Utf8, false),
    col("entity_name", ColumnType::Utf8, false),
    col("signatories", ColumnType::Json, false),
    col("observers", ColumnType::Json, false),
    col("witness_parties", ColumnType::Json, false),
    col("migration_id", ColumnType::Int64, true),
    col("record_time", ColumnType::Utf8, false),
    col("snapshot_time", ColumnType::Utf8, true),
    col("payload", ColumnType::Utf8, false),
    col("raw", ColumnType::Utf8, true),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaKind {
    Updates,
    Events,
    Acs,
}

impl SchemaKind {
    pub fn columns(&self) -> &'static [Column] {
        match self {
            SchemaKind::Updates => UPDATE_COLUMNS,
            SchemaKind::Events => EVENT_COLUMNS,
            SchemaKind::Acs => ACS_COLUMNS,
        }
    }

    pub fn file_prefix(&self) -> &'static str {
        match self {
            SchemaKind::Updates => "updates",
            SchemaKind::Events => "events",
            SchemaKind::Acs => "acs",
        }
    }

    /// Column the repair tool samples to decide a file's true UTC day.
    pub fn timestamp_column(&self) -> &'static str {
        match self {
            SchemaKind::Updates | SchemaKind::Events => "effective_at",
            SchemaKind::Acs => "snapshot_time",
        }
    }
}
