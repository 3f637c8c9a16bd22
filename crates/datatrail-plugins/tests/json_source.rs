// crates/datatrail-plugins/tests/json_source.rs
// ============================================================================
// Module: JSON Source Tests
// Description: Tests for JSON, JSONL, and nested data-key loading.
// ============================================================================
//! ## Overview
//! Validates the three layouts, auto-sniffing, non-object quarantine, and
//! data-key errors.

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
use datatrail_core::RunId;
use datatrail_core::SourcePlugin;
use datatrail_core::SourceRow;
use serde_json::Value;
use serde_json::json;
use tempfile::NamedTempFile;

use datatrail_plugins::JsonSource;

/// Builds a detached plugin context.
fn ctx() -> PluginContext {
    PluginContext::detached(
        RunId::new("run_test"),
        NodeId::new("source_json"),
        std::sync::Arc::new(Value::Null),
    )
}

/// Writes a temp file with the given content.
fn data_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// Loads all rows from a config.
fn load(config: Value) -> Vec<SourceRow> {
    let mut source = JsonSource::from_config(&config).unwrap();
    let ctx = ctx();
    source.load(&ctx).unwrap().map(Result::unwrap).collect()
}

// ============================================================================
// SECTION: Layouts
// ============================================================================

/// Tests a top-level array loads one row per object.
#[test]
fn test_array_layout() {
    let file = data_file(r#"[{"id": 1}, {"id": 2}]"#);
    let rows = load(json!({
        "path": file.path(),
        "format": "json",
        "on_success": "output",
        "on_validation_failure": "discard",
    }));
    assert_eq!(rows.len(), 2);
    assert!(matches!(&rows[0], SourceRow::Valid(row) if row.get("id") == Some(&json!(1))));
}

/// Tests JSONL loads one row per line, quarantining bad lines.
#[test]
fn test_jsonl_layout() {
    let file = data_file("{\"id\": 1}\nnot json\n{\"id\": 2}\n");
    let rows = load(json!({
        "path": file.path(),
        "format": "jsonl",
        "on_success": "output",
        "on_validation_failure": "discard",
    }));
    assert_eq!(rows.len(), 3);
    assert!(matches!(&rows[0], SourceRow::Valid(_)));
    assert!(matches!(&rows[1], SourceRow::Quarantined { .. }));
    assert!(matches!(&rows[2], SourceRow::Valid(_)));
}

/// Tests a nested document via data_key.
#[test]
fn test_data_key_layout() {
    let file = data_file(r#"{"meta": 1, "items": [{"id": 1}]}"#);
    let rows = load(json!({
        "path": file.path(),
        "format": "json",
        "data_key": "items",
        "on_success": "output",
        "on_validation_failure": "discard",
    }));
    assert_eq!(rows.len(), 1);
}

/// Tests auto format sniffs arrays as JSON and bare objects as JSONL.
#[test]
fn test_auto_sniffing() {
    let array = data_file(r#"[{"id": 1}]"#);
    let rows = load(json!({
        "path": array.path(),
        "on_success": "output",
        "on_validation_failure": "discard",
    }));
    assert_eq!(rows.len(), 1);
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Tests a non-object row quarantines.
#[test]
fn test_non_object_row_quarantined() {
    let file = data_file(r"[42]");
    let rows = load(json!({
        "path": file.path(),
        "format": "json",
        "on_success": "output",
        "on_validation_failure": "discard",
    }));
    assert!(matches!(&rows[0], SourceRow::Quarantined { error, .. } if error.contains("object")));
}

/// Tests a missing data_key is a hard config error.
#[test]
fn test_missing_data_key_is_error() {
    let file = data_file(r#"{"other": []}"#);
    let mut source = JsonSource::from_config(&json!({
        "path": file.path(),
        "format": "json",
        "data_key": "items",
        "on_success": "output",
        "on_validation_failure": "discard",
    }))
    .unwrap();
    let ctx = ctx();
    assert!(source.load(&ctx).is_err());
}
