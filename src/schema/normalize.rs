use serde_json::Value;
use tracing::warn;

use super::template::parse_template_id;
use super::{AcsContractRow, EventRow, UpdateRow, ValidationError};
use crate::partition::parse_utc;

#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeOptions {
    /// Fail on malformed records instead of degrading them.
    pub strict: bool,
    /// Log a warning for every degraded record.
    pub warn_only: bool,
}

/// Timestamps the events of an update inherit when their own are
/// missing.
#[derive(Debug, Clone, Default)]
pub struct UpdateInfo {
    pub effective_at: Option<String>,
    pub record_time: Option<String>,
}

fn get_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn get_string_array(value: &Value, key: &str) -> Option<Vec<String>> {
    value.get(key).and_then(|v| v.as_array()).map(|items| {
        items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect()
    })
}

fn get_i64(value: &Value, key: &str) -> Option<i64> {
    value.get(key).and_then(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    })
}

/// Stringify a sub-value verbatim when present; null and missing both
/// map to None.
fn stringify(value: &Value, key: &str) -> Option<String> {
    match value.get(key) {
        None | Some(Value::Null) => None,
        Some(v @ Value::String(_)) => v.as_str().map(str::to_string),
        Some(v) => Some(v.to_string()),
    }
}

/// Offsets arrive as base-10 strings, sometimes zero-padded.
pub fn parse_offset(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => {
            let trimmed = s.trim().trim_start_matches('0');
            if trimmed.is_empty() {
                // All zeros is offset 0.
                if s.trim().chars().all(|c| c == '0') && !s.trim().is_empty() {
                    Some(0)
                } else {
                    None
                }
            } else {
                trimmed.parse::<i64>().ok()
            }
        }
        _ => None,
    }
}

/// Re-emit a timestamp in canonical RFC 3339 UTC. Inputs without a
/// timezone are interpreted as UTC. Unparseable inputs are passed
/// through so the partitioner reports them instead of losing them.
fn canonical_ts(value: Option<String>) -> Option<String> {
    value.map(|v| match parse_utc(&v) {
        Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        None => v,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateVariant {
    Transaction,
    FlatTransaction,
    Reassignment,
    Unknown,
}

fn detect_update_variant(raw: &Value) -> UpdateVariant {
    if raw.get("transaction").map_or(false, |v| !v.is_null()) {
        UpdateVariant::Transaction
    } else if raw.get("reassignment").map_or(false, |v| !v.is_null()) {
        UpdateVariant::Reassignment
    } else if raw
        .get("events_by_id")
        .and_then(|v| v.as_object())
        .map_or(false, |m| !m.is_empty())
    {
        UpdateVariant::FlatTransaction
    } else {
        UpdateVariant::Unknown
    }
}

/// Convert a polymorphic update envelope into the canonical row. The
/// complete envelope is preserved verbatim in `update_data`.
pub fn normalize_update(
    raw: &Value,
    migration_id: i64,
    opts: NormalizeOptions,
) -> Result<UpdateRow, ValidationError> {
    let variant = detect_update_variant(raw);
    let update_data = raw.to_string();

    let (update_type, body) = match variant {
        UpdateVariant::Transaction => ("transaction", raw.get("transaction").unwrap_or(raw)),
        UpdateVariant::FlatTransaction => ("transaction", raw),
        UpdateVariant::Reassignment => {
            ("reassignment", raw.get("reassignment").unwrap_or(raw))
        }
        UpdateVariant::Unknown => {
            let update_id = get_str(raw, "update_id").unwrap_or_default();
            if opts.strict {
                return Err(ValidationError::UnknownUpdateType { update_id });
            }
            if opts.warn_only {
                warn!(update_id = %update_id, "Unknown update envelope shape, keeping as unknown");
            }
            ("unknown", raw)
        }
    };

    let update_id = get_str(body, "update_id")
        .or_else(|| get_str(raw, "update_id"))
        .unwrap_or_default();
    let record_time = canonical_ts(get_str(body, "record_time").or_else(|| get_str(raw, "record_time")));
    let effective_at = canonical_ts(get_str(body, "effective_at"));

    // The update's own effective_at is required; only events fall back
    // to the update's record_time.
    if effective_at.is_none() && update_type != "unknown" {
        warn!(update_id = %update_id, "Dropping update without effective_at");
        return Err(ValidationError::MissingCriticalField {
            context: format!("update {}", update_id),
            fields: vec!["effective_at"],
        });
    }

    let mut row = UpdateRow {
        update_id,
        update_type: update_type.to_string(),
        migration_id,
        synchronizer_id: get_str(body, "synchronizer_id").or_else(|| get_str(raw, "synchronizer_id")),
        workflow_id: get_str(body, "workflow_id"),
        command_id: get_str(body, "command_id"),
        offset: body
            .get("offset")
            .or_else(|| raw.get("offset"))
            .and_then(parse_offset),
        record_time,
        effective_at,
        root_event_ids: get_string_array(body, "root_event_ids").unwrap_or_default(),
        event_count: body
            .get("events_by_id")
            .and_then(|v| v.as_object())
            .map(|m| m.len() as i64)
            .or_else(|| get_i64(body, "event_count"))
            .unwrap_or(0),
        trace_context: stringify(body, "trace_context").or_else(|| stringify(raw, "trace_context")),
        update_data,
        ..Default::default()
    };

    if update_type == "reassignment" {
        row.kind = get_str(body, "kind").or_else(|| {
            if body.get("assigned_event").map_or(false, |v| !v.is_null()) {
                Some("assign".to_string())
            } else if body.get("unassigned_event").map_or(false, |v| !v.is_null()) {
                Some("unassign".to_string())
            } else {
                None
            }
        });
        row.source_synchronizer =
            get_str(body, "source_synchronizer").or_else(|| get_str(body, "source"));
        row.target_synchronizer =
            get_str(body, "target_synchronizer").or_else(|| get_str(body, "target"));
        row.unassign_id = get_str(body, "unassign_id");
        row.submitter = get_str(body, "submitter");
        row.reassignment_counter = get_i64(body, "reassignment_counter");
    }

    Ok(row)
}

fn detect_event_shape<'a>(envelope: &'a Value) -> (&'static str, &'a Value) {
    for (wrapper, event_type) in [
        ("created_event", "created"),
        ("archived_event", "archived"),
        ("exercised_event", "exercised"),
    ] {
        if let Some(inner) = envelope.get(wrapper) {
            if !inner.is_null() {
                return (event_type, inner);
            }
        }
    }
    // Flat shape with a discriminator string.
    let discriminator = get_str(envelope, "event_type").unwrap_or_default();
    let lowered = discriminator.to_lowercase();
    let event_type = if lowered.contains("creat") {
        "created"
    } else if lowered.contains("archiv") {
        "archived"
    } else if lowered.contains("exercis") {
        "exercised"
    } else {
        "created"
    };
    (event_type, envelope)
}

/// Convert one event envelope into the canonical row. The effective
/// timestamp prefers the event's own `created_at`, then the update's
/// `effective_at`, then the update's `record_time`; with none of the
/// three the event cannot be partitioned and the caller drops it.
pub fn normalize_event(
    envelope: &Value,
    update_id: &str,
    migration_id: i64,
    update_info: &UpdateInfo,
) -> Result<EventRow, ValidationError> {
    let (event_type, inner) = detect_event_shape(envelope);

    let event_id = get_str(inner, "event_id")
        .or_else(|| get_str(envelope, "event_id"))
        .unwrap_or_default();

    let effective_at = canonical_ts(get_str(inner, "created_at"))
        .or_else(|| update_info.effective_at.clone())
        .or_else(|| update_info.record_time.clone());
    if effective_at.is_none() {
        return Err(ValidationError::MissingCriticalField {
            context: format!("event {}/{}", update_id, event_id),
            fields: vec!["effective_at"],
        });
    }

    let template_id = get_str(inner, "template_id");
    let parsed = template_id.as_deref().map(parse_template_id).unwrap_or_default();

    let mut row = EventRow {
        event_id,
        update_id: update_id.to_string(),
        migration_id,
        event_type: event_type.to_string(),
        contract_id: get_str(inner, "contract_id"),
        package_name: get_str(inner, "package_name").or(parsed.package_name),
        module_name: parsed.module_name,
        entity_name: parsed.entity_name,
        template_id,
        effective_at,
        witness_parties: get_string_array(inner, "witness_parties"),
        raw_event: envelope.to_string(),
        ..Default::default()
    };

    match event_type {
        "created" => {
            row.signatories = get_string_array(inner, "signatories");
            row.observers = get_string_array(inner, "observers");
        }
        "exercised" => {
            row.choice = get_str(inner, "choice");
            row.choice_argument = stringify(inner, "choice_argument");
            row.acting_parties = get_string_array(inner, "acting_parties");
            row.child_event_ids = get_string_array(inner, "child_event_ids")
                .or_else(|| get_string_array(envelope, "child_event_ids"));
            row.exercise_result = stringify(inner, "exercise_result");
            row.consuming = inner.get("consuming").and_then(|v| v.as_bool());
        }
        _ => {}
    }

    Ok(row)
}

/// Convert one ACS entry into the canonical row. Snapshot identity is
/// supplied by the caller.
pub fn normalize_acs_contract(
    event: &Value,
    migration_id: i64,
    record_time: Option<&str>,
    snapshot_time: Option<&str>,
    opts: NormalizeOptions,
) -> Result<AcsContractRow, ValidationError> {
    let inner = event
        .get("created_event")
        .filter(|v| !v.is_null())
        .unwrap_or(event);

    let event_id = get_str(inner, "event_id").or_else(|| get_str(event, "event_id"));
    // Some ACS pages omit the contract id on the entry itself; the
    // event id addresses the same create.
    let contract_id = get_str(inner, "contract_id")
        .or_else(|| event_id.clone())
        .unwrap_or_default();
    let template_id = get_str(inner, "template_id");

    if opts.strict {
        let mut missing = Vec::new();
        if contract_id.is_empty() {
            missing.push("contract_id");
        }
        if template_id.is_none() {
            missing.push("template_id");
        }
        if !missing.is_empty() {
            return Err(ValidationError::AcsValidation {
                contract_id,
                missing,
            });
        }
    } else if opts.warn_only && (contract_id.is_empty() || template_id.is_none()) {
        warn!(contract_id = %contract_id, "ACS entry missing critical fields");
    }

    let parsed = template_id.as_deref().map(parse_template_id).unwrap_or_default();

    Ok(AcsContractRow {
        contract_id,
        event_id,
        package_name: get_str(inner, "package_name").or(parsed.package_name),
        module_name: parsed.module_name,
        entity_name: parsed.entity_name,
        template_id,
        signatories: get_string_array(inner, "signatories"),
        observers: get_string_array(inner, "observers"),
        witness_parties: get_string_array(inner, "witness_parties"),
        migration_id,
        record_time: canonical_ts(record_time.map(str::to_string)),
        snapshot_time: canonical_ts(snapshot_time.map(str::to_string)),
        payload: stringify(inner, "create_arguments"),
        raw: event.to_string(),
    })
}

/// One update and its event rows, ready for partitioning.
#[derive(Debug, Clone)]
pub struct NormalizedUpdate {
    pub update: UpdateRow,
    pub events: Vec<EventRow>,
    pub dropped_events: usize,
}

/// Full decode of one envelope: the update row plus its events in tree
/// order. Events that cannot be timestamped are dropped with a
/// warning, never silently.
pub fn normalize_update_with_events(
    raw: &Value,
    migration_id: i64,
    opts: NormalizeOptions,
) -> Result<NormalizedUpdate, ValidationError> {
    let update = normalize_update(raw, migration_id, opts)?;
    let info = UpdateInfo {
        effective_at: update.effective_at.clone(),
        record_time: update.record_time.clone(),
    };

    let mut events = Vec::new();
    let mut dropped_events = 0;

    if update.update_type == "reassignment" {
        let body = raw.get("reassignment").unwrap_or(raw);
        for (key, event_type) in [
            ("assigned_event", "reassign_create"),
            ("unassigned_event", "reassign_archive"),
        ] {
            let Some(envelope) = body.get(key).filter(|v| !v.is_null()) else {
                continue;
            };
            match normalize_event(envelope, &update.update_id, migration_id, &info) {
                Ok(mut row) => {
                    row.event_type = event_type.to_string();
                    events.push(row);
                }
                Err(e) => {
                    warn!(update_id = %update.update_id, error = %e, "Dropping reassignment event");
                    dropped_events += 1;
                }
            }
        }
    } else {
        let body = raw.get("transaction").filter(|v| !v.is_null()).unwrap_or(raw);
        if let Some(events_by_id) = body.get("events_by_id").and_then(|v| v.as_object()) {
            let roots = if update.root_event_ids.is_empty() {
                events_by_id.keys().cloned().collect()
            } else {
                update.root_event_ids.clone()
            };
            for (event_id, envelope) in flatten_events_in_tree_order(events_by_id, &roots) {
                match normalize_event(envelope, &update.update_id, migration_id, &info) {
                    Ok(mut row) => {
                        if row.event_id.is_empty() {
                            row.event_id = event_id;
                        }
                        events.push(row);
                    }
                    Err(e) => {
                        warn!(update_id = %update.update_id, event_id = %event_id, error = %e, "Dropping event");
                        dropped_events += 1;
                    }
                }
            }
        }
    }

    Ok(NormalizedUpdate {
        update,
        events,
        dropped_events,
    })
}

/// Pre-order flattening of an update's event tree: each parent is
/// followed by all of its descendants before the next sibling. An
/// exercised event's children live either under
/// `exercised_event.child_event_ids` or directly on the envelope.
pub fn flatten_events_in_tree_order<'a>(
    events_by_id: &'a serde_json::Map<String, Value>,
    root_ids: &[String],
) -> Vec<(String, &'a Value)> {
    let mut ordered = Vec::with_capacity(events_by_id.len());
    let mut stack: Vec<String> = root_ids.iter().rev().cloned().collect();
    let mut visited = std::collections::HashSet::new();

    while let Some(id) = stack.pop() {
        if !visited.insert(id.clone()) {
            continue;
        }
        let Some(event) = events_by_id.get(&id) else {
            continue;
        };
        let children = event
            .get("exercised_event")
            .and_then(|inner| get_string_array(inner, "child_event_ids"))
            .or_else(|| get_string_array(event, "child_event_ids"))
            .unwrap_or_default();
        for child in children.into_iter().rev() {
            stack.push(child);
        }
        ordered.push((id, event));
    }

    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_transaction_update() {
        let raw = json!({
            "update_id": "u-1",
            "transaction": {
                "update_id": "u-1",
                "synchronizer_id": "sync::global",
                "workflow_id": "wf-7",
                "command_id": "cmd-9",
                "offset": "000420",
                "record_time": "2025-04-17T23:50:00Z",
                "effective_at": "2025-04-17T23:49:58Z",
                "root_event_ids": ["#u-1:0"],
                "events_by_id": {"#u-1:0": {"created_event": {}}},
                "unexpected_field": {"kept": true}
            }
        });
        let row = normalize_update(&raw, 4, NormalizeOptions::default()).unwrap();
        assert_eq!(row.update_type, "transaction");
        assert_eq!(row.update_id, "u-1");
        assert_eq!(row.migration_id, 4);
        assert_eq!(row.offset, Some(420));
        assert_eq!(row.event_count, 1);
        assert_eq!(row.root_event_ids, vec!["#u-1:0"]);
        assert_eq!(row.kind, None);
        assert_eq!(row.source_synchronizer, None);

        // Loss-freedom: the stored envelope parses back to the input,
        // unknown fields included.
        let restored: serde_json::Value = serde_json::from_str(&row.update_data).unwrap();
        assert_eq!(restored, raw);
    }

    #[test]
    fn test_normalize_reassignment_update() {
        let raw = json!({
            "reassignment": {
                "update_id": "u-2",
                "record_time": "2025-04-17T10:00:00Z",
                "effective_at": "2025-04-17T09:59:58Z",
                "source": "sync::a",
                "target": "sync::b",
                "unassign_id": "ua-1",
                "submitter": "party::p1",
                "reassignment_counter": 3,
                "unassigned_event": {"contract_id": "c-1"}
            }
        });
        let row = normalize_update(&raw, 0, NormalizeOptions::default()).unwrap();
        assert_eq!(row.update_type, "reassignment");
        assert_eq!(row.kind.as_deref(), Some("unassign"));
        assert_eq!(row.source_synchronizer.as_deref(), Some("sync::a"));
        assert_eq!(row.target_synchronizer.as_deref(), Some("sync::b"));
        assert_eq!(row.reassignment_counter, Some(3));
        assert_eq!(row.effective_at.as_deref(), Some("2025-04-17T09:59:58.000000Z"));
    }

    #[test]
    fn test_update_without_effective_at_is_dropped() {
        // record_time alone is not enough at the update level.
        let raw = json!({
            "transaction": {
                "update_id": "u-7",
                "record_time": "2025-04-17T10:00:00Z",
            }
        });
        assert!(matches!(
            normalize_update(&raw, 0, NormalizeOptions::default()),
            Err(ValidationError::MissingCriticalField { context, fields })
                if context == "update u-7" && fields == vec!["effective_at"]
        ));
    }

    #[test]
    fn test_normalize_flat_transaction() {
        let raw = json!({
            "update_id": "u-3",
            "record_time": "2025-04-17T10:00:00Z",
            "effective_at": "2025-04-17T10:00:00Z",
            "events_by_id": {"#u-3:0": {"event_type": "created_event"}}
        });
        let row = normalize_update(&raw, 1, NormalizeOptions::default()).unwrap();
        assert_eq!(row.update_type, "transaction");
        assert_eq!(row.event_count, 1);
    }

    #[test]
    fn test_unknown_update_strict_vs_loose() {
        let raw = json!({"update_id": "u-4", "something_else": 1});
        let strict = NormalizeOptions { strict: true, warn_only: false };
        assert!(matches!(
            normalize_update(&raw, 0, strict),
            Err(ValidationError::UnknownUpdateType { update_id }) if update_id == "u-4"
        ));
        let row = normalize_update(&raw, 0, NormalizeOptions::default()).unwrap();
        assert_eq!(row.update_type, "unknown");
    }

    #[test]
    fn test_naive_timestamps_become_utc() {
        let raw = json!({
            "transaction": {
                "update_id": "u-5",
                "record_time": "2025-04-17 23:50:00",
                "effective_at": "2025-04-17 23:49:58",
            }
        });
        let row = normalize_update(&raw, 0, NormalizeOptions::default()).unwrap();
        assert_eq!(row.record_time.as_deref(), Some("2025-04-17T23:50:00.000000Z"));
        assert_eq!(row.effective_at.as_deref(), Some("2025-04-17T23:49:58.000000Z"));
    }

    #[test]
    fn test_parse_offset_strips_leading_zeros() {
        assert_eq!(parse_offset(&json!("000123")), Some(123));
        assert_eq!(parse_offset(&json!("0000")), Some(0));
        assert_eq!(parse_offset(&json!(77)), Some(77));
        assert_eq!(parse_offset(&json!("abc")), None);
    }

    #[test]
    fn test_normalize_created_event() {
        let envelope = json!({
            "created_event": {
                "event_id": "#u-1:0",
                "contract_id": "c-9",
                "template_id": "hash1:Splice.Amulet:Amulet",
                "created_at": "2025-04-17T23:50:00Z",
                "signatories": ["party::a"],
                "observers": ["party::b"],
                "extra": {"kept": [1, 2]}
            }
        });
        let info = UpdateInfo::default();
        let row = normalize_event(&envelope, "u-1", 4, &info).unwrap();
        assert_eq!(row.event_type, "created");
        assert_eq!(row.module_name.as_deref(), Some("Splice.Amulet"));
        assert_eq!(row.entity_name.as_deref(), Some("Amulet"));
        assert_eq!(row.signatories.as_deref(), Some(&["party::a".to_string()][..]));
        // Exercised-only fields stay null on created events.
        assert_eq!(row.choice, None);
        assert_eq!(row.child_event_ids, None);

        let restored: serde_json::Value = serde_json::from_str(&row.raw_event).unwrap();
        assert_eq!(restored, envelope);
    }

    #[test]
    fn test_normalize_exercised_event_nulls_created_fields() {
        let envelope = json!({
            "exercised_event": {
                "event_id": "#u-1:1",
                "contract_id": "c-9",
                "template_id": "Splice.Amulet:Amulet",
                "choice": "Amulet_Transfer",
                "choice_argument": {"amount": "5"},
                "acting_parties": ["party::a"],
                "child_event_ids": ["#u-1:2"],
                "exercise_result": {"ok": true},
                "consuming": true
            }
        });
        let info = UpdateInfo {
            effective_at: Some("2025-04-17T23:50:00Z".to_string()),
            record_time: None,
        };
        let row = normalize_event(&envelope, "u-1", 0, &info).unwrap();
        assert_eq!(row.event_type, "exercised");
        assert_eq!(row.choice.as_deref(), Some("Amulet_Transfer"));
        assert_eq!(row.consuming, Some(true));
        assert_eq!(row.child_event_ids.as_deref(), Some(&["#u-1:2".to_string()][..]));
        assert_eq!(row.signatories, None);
        assert_eq!(row.observers, None);
        // Inherited from the update.
        assert_eq!(row.effective_at.as_deref(), Some("2025-04-17T23:50:00Z"));
    }

    #[test]
    fn test_event_timestamp_fallback_chain() {
        let envelope = json!({"created_event": {"event_id": "#e"}});
        let info = UpdateInfo {
            effective_at: None,
            record_time: Some("2025-01-01T00:00:00Z".to_string()),
        };
        let row = normalize_event(&envelope, "u", 0, &info).unwrap();
        assert_eq!(row.effective_at.as_deref(), Some("2025-01-01T00:00:00Z"));

        let none = UpdateInfo::default();
        assert!(matches!(
            normalize_event(&envelope, "u", 0, &none),
            Err(ValidationError::MissingCriticalField { .. })
        ));
    }

    #[test]
    fn test_normalize_acs_contract() {
        let event = json!({
            "created_event": {
                "event_id": "#acs:0",
                "contract_id": "c-77",
                "template_id": "hash9:Splice.Wallet:Install",
                "create_arguments": {"owner": "party::x"},
                "signatories": ["party::x"]
            }
        });
        let row = normalize_acs_contract(
            &event,
            2,
            Some("2025-04-17T06:00:00Z"),
            Some("2025-04-17T07:05:09Z"),
            NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!(row.contract_id, "c-77");
        assert_eq!(row.entity_name.as_deref(), Some("Install"));
        assert_eq!(row.payload.as_deref(), Some(r#"{"owner":"party::x"}"#));
        assert_eq!(row.snapshot_time.as_deref(), Some("2025-04-17T07:05:09.000000Z"));
    }

    #[test]
    fn test_acs_contract_id_falls_back_to_event_id() {
        let event = json!({"created_event": {"event_id": "#acs:1", "template_id": "M:E"}});
        let row = normalize_acs_contract(&event, 0, None, Some("2025-04-17T00:00:00Z"), NormalizeOptions::default())
            .unwrap();
        assert_eq!(row.contract_id, "#acs:1");
    }

    #[test]
    fn test_acs_strict_mode_fails_on_missing_fields() {
        let event = json!({"created_event": {}});
        let opts = NormalizeOptions { strict: true, warn_only: false };
        assert!(matches!(
            normalize_acs_contract(&event, 0, None, Some("2025-04-17T00:00:00Z"), opts),
            Err(ValidationError::AcsValidation { .. })
        ));
    }

    #[test]
    fn test_flatten_tree_order() {
        let mut events = serde_json::Map::new();
        events.insert(
            "a".to_string(),
            json!({"exercised_event": {"child_event_ids": ["b", "c"]}}),
        );
        events.insert("b".to_string(), json!({"created_event": {}}));
        events.insert("c".to_string(), json!({"child_event_ids": ["d"]}));
        events.insert("d".to_string(), json!({"created_event": {}}));
        events.insert("e".to_string(), json!({"created_event": {}}));

        let ordered = flatten_events_in_tree_order(&events, &["a".to_string(), "e".to_string()]);
        let ids: Vec<&str> = ordered.iter().map(|(id, _)| id.as_str()).collect();
        // Parent, then all descendants, then the next sibling root.
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_normalize_update_with_events_tree_order() {
        let raw = json!({
            "transaction": {
                "update_id": "u-1",
                "record_time": "2025-04-17T23:50:00Z",
                "effective_at": "2025-04-17T23:50:00Z",
                "root_event_ids": ["#u-1:0"],
                "events_by_id": {
                    "#u-1:1": {"created_event": {"event_id": "#u-1:1", "contract_id": "c2"}},
                    "#u-1:0": {
                        "exercised_event": {
                            "event_id": "#u-1:0",
                            "contract_id": "c1",
                            "choice": "Transfer",
                            "child_event_ids": ["#u-1:1"]
                        }
                    }
                }
            }
        });
        let normalized =
            normalize_update_with_events(&raw, 0, NormalizeOptions::default()).unwrap();
        assert_eq!(normalized.update.event_count, 2);
        assert_eq!(normalized.dropped_events, 0);
        let ids: Vec<&str> = normalized.events.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["#u-1:0", "#u-1:1"]);
        assert_eq!(normalized.events[0].event_type, "exercised");
        assert_eq!(normalized.events[1].event_type, "created");
    }

    #[test]
    fn test_reassignment_events_get_overridden_type() {
        let raw = json!({
            "reassignment": {
                "update_id": "u-2",
                "record_time": "2025-04-17T10:00:00Z",
                "effective_at": "2025-04-17T10:00:00Z",
                "unassigned_event": {"event_id": "#u-2:0", "contract_id": "c-1"}
            }
        });
        let normalized =
            normalize_update_with_events(&raw, 2, NormalizeOptions::default()).unwrap();
        assert_eq!(normalized.events.len(), 1);
        assert_eq!(normalized.events[0].event_type, "reassign_archive");
        assert_eq!(normalized.events[0].migration_id, 2);
    }

    #[test]
    fn test_untimestampable_events_are_dropped_with_count() {
        // No effective_at: the update itself fails decode.
        let raw = json!({
            "transaction": {
                "update_id": "u-3",
                "events_by_id": {"#e": {"created_event": {}}}
            }
        });
        assert!(matches!(
            normalize_update_with_events(&raw, 0, NormalizeOptions::default()),
            Err(ValidationError::MissingCriticalField { .. })
        ));
    }

    #[test]
    fn test_flatten_ignores_dangling_and_cycles() {
        let mut events = serde_json::Map::new();
        events.insert("a".to_string(), json!({"child_event_ids": ["a", "missing"]}));
        let ordered = flatten_events_in_tree_order(&events, &["a".to_string()]);
        assert_eq!(ordered.len(), 1);
    }
}
