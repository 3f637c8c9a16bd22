// crates/datatrail-core/src/runtime/export.rs
// ============================================================================
// Module: Datatrail Audit Export
// Description: Audit trail export as a JSON bundle or a CSV directory.
// Purpose: Produce portable, deterministic snapshots of a run's audit trail
//          and record export status back onto the run.
// Dependencies: crate::{core, interfaces}, csv, serde_json
// ============================================================================

//! ## Overview
//! JSON export writes one file containing `{ "records": [...] }` with records
//! in record-type order. CSV export writes a directory with one file per
//! record type; columns are the sorted union of all keys present in that
//! type's records, and an empty directory is produced when no records exist.
//! Both formats produce the canonical record bundle as a signable file: the
//! bundle itself for JSON, a `manifest.json` inside the directory for CSV.
//! Export success or failure is recorded on the run itself.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::core::hashing::DEFAULT_HASH_ALGORITHM;
use crate::core::hashing::canonical_json_bytes;
use crate::core::hashing::hash_bytes;
use crate::core::identifiers::RunId;
use crate::core::records::ExportStatus;
use crate::core::time::Clock;
use crate::interfaces::ExportUpdate;
use crate::interfaces::Landscape;
use crate::interfaces::LandscapeSnapshot;
use crate::runtime::EngineError;
use crate::runtime::pipeline::ExportSettings;

// ============================================================================
// SECTION: Report
// ============================================================================

/// Result of a successful export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    /// Export format label.
    pub format: String,
    /// Files written, in creation order.
    pub files: Vec<PathBuf>,
    /// File holding the canonical record bundle; detached signatures cover
    /// exactly these bytes.
    pub signable_path: PathBuf,
    /// Canonical hash of the JSON record bundle.
    pub content_hash: String,
    /// Number of records exported.
    pub record_count: usize,
}

// ============================================================================
// SECTION: Export Entry Point
// ============================================================================

/// Exports a run's audit trail and records the export status on the run.
///
/// # Errors
///
/// Returns [`EngineError::Export`] when serialization or I/O fails; the
/// failure is recorded on the run before the error propagates.
pub fn run_export(
    landscape: &dyn Landscape,
    clock: &dyn Clock,
    run_id: &RunId,
    settings: &ExportSettings,
) -> Result<ExportReport, EngineError> {
    match export_inner(landscape, run_id, settings) {
        Ok(report) => {
            landscape.update_run_export(
                run_id,
                ExportUpdate {
                    export_status: Some(ExportStatus::Exported),
                    exported_at: Some(clock.now()),
                    export_error: None,
                    export_format: Some(report.format.clone()),
                    export_sink: Some(settings.path.display().to_string()),
                },
            )?;
            Ok(report)
        }
        Err(error) => {
            landscape.update_run_export(
                run_id,
                ExportUpdate {
                    export_status: Some(ExportStatus::Failed),
                    exported_at: Some(clock.now()),
                    export_error: Some(error.to_string()),
                    export_format: Some(settings.format.clone()),
                    export_sink: Some(settings.path.display().to_string()),
                },
            )?;
            Err(error)
        }
    }
}

/// Performs the export without touching run status.
fn export_inner(
    landscape: &dyn Landscape,
    run_id: &RunId,
    settings: &ExportSettings,
) -> Result<ExportReport, EngineError> {
    let snapshot = landscape.export_snapshot(run_id)?;
    let records = flatten_snapshot(&snapshot)?;
    match settings.format.as_str() {
        "json" => export_json(&records, settings),
        "csv" => export_csv(&records, settings),
        other => Err(EngineError::Export(format!("unsupported export format '{other}'"))),
    }
}

// ============================================================================
// SECTION: Record Flattening
// ============================================================================

/// One export record: its type label and its flattened fields.
struct ExportRecord {
    /// Record type label (table name).
    record_type: &'static str,
    /// Record fields.
    fields: Map<String, Value>,
}

/// Serializes one record list into export records.
fn push_records<T: Serialize>(
    out: &mut Vec<ExportRecord>,
    record_type: &'static str,
    records: &[T],
) -> Result<(), EngineError> {
    for record in records {
        let value = serde_json::to_value(record)
            .map_err(|err| EngineError::Export(format!("record serialization failed: {err}")))?;
        let Value::Object(fields) = value else {
            return Err(EngineError::Export(format!(
                "record of type '{record_type}' did not serialize to an object"
            )));
        };
        out.push(ExportRecord { record_type, fields });
    }
    Ok(())
}

/// Flattens a snapshot into records in record-type order.
fn flatten_snapshot(snapshot: &LandscapeSnapshot) -> Result<Vec<ExportRecord>, EngineError> {
    let mut records = Vec::new();
    push_records(&mut records, "runs", &snapshot.runs)?;
    push_records(&mut records, "nodes", &snapshot.nodes)?;
    push_records(&mut records, "edges", &snapshot.edges)?;
    push_records(&mut records, "rows", &snapshot.rows)?;
    push_records(&mut records, "tokens", &snapshot.tokens)?;
    push_records(&mut records, "token_parents", &snapshot.token_parents)?;
    push_records(&mut records, "node_states", &snapshot.node_states)?;
    push_records(&mut records, "calls", &snapshot.calls)?;
    push_records(&mut records, "operations", &snapshot.operations)?;
    push_records(&mut records, "artifacts", &snapshot.artifacts)?;
    push_records(&mut records, "routing_events", &snapshot.routing_events)?;
    push_records(&mut records, "batches", &snapshot.batches)?;
    push_records(&mut records, "batch_members", &snapshot.batch_members)?;
    push_records(&mut records, "batch_outputs", &snapshot.batch_outputs)?;
    push_records(&mut records, "checkpoints", &snapshot.checkpoints)?;
    push_records(&mut records, "token_outcomes", &snapshot.token_outcomes)?;
    push_records(&mut records, "validation_errors", &snapshot.validation_errors)?;
    push_records(&mut records, "transform_errors", &snapshot.transform_errors)?;
    Ok(records)
}

// ============================================================================
// SECTION: JSON Export
// ============================================================================

/// Serializes records into the canonical `{ "records": [...] }` bundle.
fn bundle_bytes(records: &[ExportRecord]) -> Result<Vec<u8>, EngineError> {
    let entries: Vec<Value> = records
        .iter()
        .map(|record| {
            let mut fields = record.fields.clone();
            fields.insert(
                "record_type".to_string(),
                Value::String(record.record_type.to_string()),
            );
            Value::Object(fields)
        })
        .collect();
    let bundle = serde_json::json!({ "records": entries });
    Ok(canonical_json_bytes(&bundle)?)
}

/// Writes the single-file JSON bundle.
fn export_json(
    records: &[ExportRecord],
    settings: &ExportSettings,
) -> Result<ExportReport, EngineError> {
    let bytes = bundle_bytes(records)?;
    if let Some(parent) = settings.path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .map_err(|err| EngineError::Export(format!("create export directory: {err}")))?;
    }
    fs::write(&settings.path, &bytes)
        .map_err(|err| EngineError::Export(format!("write export file: {err}")))?;
    Ok(ExportReport {
        format: "json".to_string(),
        files: vec![settings.path.clone()],
        signable_path: settings.path.clone(),
        content_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, &bytes).value,
        record_count: records.len(),
    })
}

// ============================================================================
// SECTION: CSV Export
// ============================================================================

/// Writes the one-file-per-record-type CSV directory.
fn export_csv(
    records: &[ExportRecord],
    settings: &ExportSettings,
) -> Result<ExportReport, EngineError> {
    fs::create_dir_all(&settings.path)
        .map_err(|err| EngineError::Export(format!("create export directory: {err}")))?;
    let mut files = Vec::new();
    let record_types: Vec<&'static str> = {
        let mut seen = Vec::new();
        for record in records {
            if !seen.contains(&record.record_type) {
                seen.push(record.record_type);
            }
        }
        seen
    };
    for record_type in record_types {
        let group: Vec<&ExportRecord> =
            records.iter().filter(|record| record.record_type == record_type).collect();
        let mut columns: BTreeSet<String> = BTreeSet::new();
        for record in &group {
            for key in record.fields.keys() {
                columns.insert(key.clone());
            }
        }
        let columns: Vec<String> = columns.into_iter().collect();
        let path = settings.path.join(format!("{record_type}.csv"));
        let mut writer = csv::Writer::from_path(&path)
            .map_err(|err| EngineError::Export(format!("open {record_type}.csv: {err}")))?;
        writer
            .write_record(&columns)
            .map_err(|err| EngineError::Export(format!("write {record_type}.csv: {err}")))?;
        for record in &group {
            let cells: Vec<String> = columns
                .iter()
                .map(|column| match record.fields.get(column) {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(text)) => text.clone(),
                    Some(other) => other.to_string(),
                })
                .collect();
            writer
                .write_record(&cells)
                .map_err(|err| EngineError::Export(format!("write {record_type}.csv: {err}")))?;
        }
        writer
            .flush()
            .map_err(|err| EngineError::Export(format!("flush {record_type}.csv: {err}")))?;
        files.push(path);
    }
    // The canonical record bundle is written alongside the per-type files;
    // detached signatures cover exactly these bytes.
    let bytes = bundle_bytes(records)?;
    let manifest = settings.path.join("manifest.json");
    fs::write(&manifest, &bytes)
        .map_err(|err| EngineError::Export(format!("write manifest.json: {err}")))?;
    files.push(manifest.clone());
    Ok(ExportReport {
        format: "csv".to_string(),
        files,
        signable_path: manifest,
        content_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, &bytes).value,
        record_count: records.len(),
    })
}
