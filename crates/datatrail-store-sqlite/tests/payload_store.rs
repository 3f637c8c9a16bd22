// crates/datatrail-store-sqlite/tests/payload_store.rs
// ============================================================================
// Module: Payload Store Tests
// Description: Tests for the content-addressed filesystem payload store.
// ============================================================================
//! ## Overview
//! Validates idempotent writes, content-derived references, tolerant loads
//! and deletes, and the payload flow through a Landscape configured with a
//! payload store.

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

use std::sync::Arc;

use datatrail_core::Determinism;
use datatrail_core::Landscape;
use datatrail_core::LogicalClock;
use datatrail_core::NodeId;
use datatrail_core::NodeRegistration;
use datatrail_core::NodeType;
use datatrail_core::PayloadRef;
use datatrail_core::PayloadStore;
use datatrail_store_sqlite::FsPayloadStore;
use datatrail_store_sqlite::SqliteLandscape;
use datatrail_store_sqlite::SqliteStoreConfig;
use serde_json::json;
use tempfile::TempDir;

// ============================================================================
// SECTION: Blob Semantics
// ============================================================================

/// Tests identical content yields the identical reference exactly once.
#[test]
fn test_store_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = FsPayloadStore::open(dir.path()).unwrap();
    let first = store.store(b"payload bytes").unwrap();
    let second = store.store(b"payload bytes").unwrap();
    assert_eq!(first, second);
    assert_eq!(store.load(&first).unwrap().unwrap(), b"payload bytes");
}

/// Tests distinct content yields distinct references.
#[test]
fn test_distinct_content_distinct_refs() {
    let dir = TempDir::new().unwrap();
    let store = FsPayloadStore::open(dir.path()).unwrap();
    let first = store.store(b"alpha").unwrap();
    let second = store.store(b"beta").unwrap();
    assert_ne!(first, second);
}

/// Tests loading a missing reference yields None and deleting it succeeds.
#[test]
fn test_missing_reference_tolerated() {
    let dir = TempDir::new().unwrap();
    let store = FsPayloadStore::open(dir.path()).unwrap();
    let ghost = PayloadRef::new("0badc0de0badc0de0badc0de0badc0de0badc0de0badc0de0badc0de0badc0de");
    assert!(store.load(&ghost).unwrap().is_none());
    store.delete(&ghost).unwrap();
}

/// Tests delete removes the blob.
#[test]
fn test_delete_removes_blob() {
    let dir = TempDir::new().unwrap();
    let store = FsPayloadStore::open(dir.path()).unwrap();
    let reference = store.store(b"ephemeral").unwrap();
    store.delete(&reference).unwrap();
    assert!(store.load(&reference).unwrap().is_none());
}

// ============================================================================
// SECTION: Landscape Integration
// ============================================================================

/// Tests rows created through a payload-backed Landscape rehydrate.
#[test]
fn test_row_payload_round_trip() {
    let dir = TempDir::new().unwrap();
    let payloads = Arc::new(FsPayloadStore::open(dir.path().join("payloads")).unwrap());
    let store = SqliteLandscape::open(
        &SqliteStoreConfig::new(dir.path().join("landscape.db")),
        Arc::new(LogicalClock::default()),
        Some(payloads),
    )
    .unwrap();
    let run = store.begin_run(&json!({}), "jcs-sha256/1").unwrap();
    let node = store
        .register_node(
            &run.run_id,
            NodeRegistration {
                node_id: Some(NodeId::new("source_test")),
                plugin_name: "test".to_string(),
                node_type: NodeType::Source,
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::Deterministic,
                config: json!({}),
                schema_mode: None,
                schema_fields_json: None,
                sequence_in_pipeline: Some(0),
            },
        )
        .unwrap();
    let data = json!({"id": 7, "value": "kept"});
    let row = store.create_row(&run.run_id, &node.node_id, 0, &data, None).unwrap();
    assert!(row.payload_ref.is_some());
    let loaded = store.load_row_payload(&row).unwrap().unwrap();
    assert_eq!(loaded, data);
}
