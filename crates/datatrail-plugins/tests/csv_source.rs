// crates/datatrail-plugins/tests/csv_source.rs
// ============================================================================
// Module: CSV Source Tests
// Description: Tests for CSV loading, typing, normalization, and quarantine.
// ============================================================================
//! ## Overview
//! Validates that malformed rows are yielded as quarantined (never raised),
//! cells parse into declared types, headers normalize with a recorded
//! resolution, and hard I/O failures propagate.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::io::Write;

use datatrail_core::NodeId;
use datatrail_core::PluginContext;
use datatrail_core::RouteTarget;
use datatrail_core::RunId;
use datatrail_core::SourcePlugin;
use datatrail_core::SourceRow;
use serde_json::Value;
use serde_json::json;
use tempfile::NamedTempFile;

use datatrail_plugins::CsvSource;

/// Builds a detached plugin context.
fn ctx() -> PluginContext {
    PluginContext::detached(
        RunId::new("run_test"),
        NodeId::new("source_csv"),
        std::sync::Arc::new(Value::Null),
    )
}

/// Writes a temp CSV file with the given content.
fn csv_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// Builds a source over the given file with a declared schema.
fn source(path: &std::path::Path, schema: Value) -> CsvSource {
    CsvSource::from_config(&json!({
        "path": path,
        "schema": schema,
        "on_success": "output",
        "on_validation_failure": "quarantine",
    }))
    .unwrap()
}

/// Drains all rows from a source.
fn load_all(source: &mut CsvSource) -> Vec<SourceRow> {
    let ctx = ctx();
    source.load(&ctx).unwrap().map(Result::unwrap).collect()
}

// ============================================================================
// SECTION: Loading and Typing
// ============================================================================

/// Tests valid rows parse into declared types.
#[test]
fn test_typed_parsing() {
    let file = csv_file("id,value,active\n1,99.5,true\n");
    let mut source = source(
        file.path(),
        json!({"id": "int", "value": "float", "active": "bool"}),
    );
    let rows = load_all(&mut source);
    assert_eq!(rows.len(), 1);
    match &rows[0] {
        SourceRow::Valid(row) => {
            assert_eq!(row.get("id"), Some(&json!(1)));
            assert_eq!(row.get("value"), Some(&json!(99.5)));
            assert_eq!(row.get("active"), Some(&json!(true)));
        }
        other => panic!("expected valid row, got {other:?}"),
    }
}

/// Tests an unparseable cell quarantines the row instead of raising.
#[test]
fn test_bad_cell_quarantines() {
    let file = csv_file("id\nnot_a_number\n");
    let mut source = source(file.path(), json!({"id": "int"}));
    let rows = load_all(&mut source);
    assert_eq!(rows.len(), 1);
    match &rows[0] {
        SourceRow::Quarantined { destination, error, .. } => {
            assert_eq!(destination, &RouteTarget::Sink("quarantine".to_string()));
            assert!(error.contains("id"));
        }
        other => panic!("expected quarantined row, got {other:?}"),
    }
}

/// Tests skip_rows drops leading data rows after the header.
#[test]
fn test_skip_rows() {
    let file = csv_file("id\n1\n2\n3\n");
    let mut source = CsvSource::from_config(&json!({
        "path": file.path(),
        "schema": {"id": "int"},
        "skip_rows": 2,
        "on_success": "output",
        "on_validation_failure": "discard",
    }))
    .unwrap();
    let rows = load_all(&mut source);
    assert_eq!(rows.len(), 1);
}

// ============================================================================
// SECTION: Normalization
// ============================================================================

/// Tests headers normalize and the resolution mapping is recorded.
#[test]
fn test_header_normalization_and_resolution() {
    let file = csv_file("First Name!,Last Name@\nAda,Lovelace\n");
    let mut source = source(
        file.path(),
        json!({"first_name": "str", "last_name": "str"}),
    );
    let rows = load_all(&mut source);
    match &rows[0] {
        SourceRow::Valid(row) => {
            assert_eq!(row.get("first_name"), Some(&json!("Ada")));
            assert_eq!(row.get("last_name"), Some(&json!("Lovelace")));
        }
        other => panic!("expected valid row, got {other:?}"),
    }
    let resolution = source.get_field_resolution().unwrap();
    assert_eq!(resolution.mapping.get("First Name!").map(String::as_str), Some("first_name"));
    assert!(resolution.normalization_version.is_some());
}

// ============================================================================
// SECTION: Hard Errors
// ============================================================================

/// Tests a missing file propagates as a hard source error.
#[test]
fn test_missing_file_is_hard_error() {
    let mut source = CsvSource::from_config(&json!({
        "path": "/nonexistent/input.csv",
        "on_success": "output",
        "on_validation_failure": "discard",
    }))
    .unwrap();
    let ctx = ctx();
    assert!(source.load(&ctx).is_err());
}
