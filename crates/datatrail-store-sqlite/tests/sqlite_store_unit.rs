// crates/datatrail-store-sqlite/tests/sqlite_store_unit.rs
// ============================================================================
// Module: SQLite Landscape Tests
// Description: Tests for the durable Landscape store invariants.
// ============================================================================
//! ## Overview
//! Validates that the SQL schema enforces what the contract promises:
//! referential integrity with RESTRICT semantics, terminal-outcome uniqueness
//! through the partial index, node-state transition rules, and the Tier-1
//! rule that invalid stored enums crash reads instead of round-tripping.

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

use datatrail_core::CompletionRequest;
use datatrail_core::Determinism;
use datatrail_core::Landscape;
use datatrail_core::LandscapeError;
use datatrail_core::LogicalClock;
use datatrail_core::NodeId;
use datatrail_core::NodeRegistration;
use datatrail_core::NodeType;
use datatrail_core::OutcomeContext;
use datatrail_core::RowId;
use datatrail_core::RowOutcome;
use datatrail_core::RunId;
use datatrail_core::TokenSpec;
use datatrail_store_sqlite::SqliteLandscape;
use datatrail_store_sqlite::SqliteStoreConfig;
use serde_json::json;
use tempfile::TempDir;

/// Opens a store in a fresh temp directory.
fn open_store() -> (TempDir, SqliteLandscape) {
    let dir = TempDir::new().unwrap();
    let store = SqliteLandscape::open(
        &SqliteStoreConfig::new(dir.path().join("landscape.db")),
        Arc::new(LogicalClock::default()),
        None,
    )
    .unwrap();
    (dir, store)
}

/// Creates a run with one registered source node.
fn seed_run(store: &SqliteLandscape) -> (RunId, NodeId) {
    let run = store.begin_run(&json!({"pipeline": "sqlite-test"}), "jcs-sha256/1").unwrap();
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
    (run.run_id, node.node_id)
}

// ============================================================================
// SECTION: Round Trips
// ============================================================================

/// Tests a run round-trips through the store.
#[test]
fn test_run_round_trip() {
    let (_dir, store) = open_store();
    let (run_id, _) = seed_run(&store);
    let run = store.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.canonical_version, "jcs-sha256/1");
    assert_eq!(run.settings_json, json!({"pipeline": "sqlite-test"}).to_string());
}

/// Tests node registration is idempotent for identical configs and rejects
/// divergent re-registration.
#[test]
fn test_node_registration_idempotency() {
    let (_dir, store) = open_store();
    let (run_id, node_id) = seed_run(&store);
    let registration = |config: serde_json::Value| NodeRegistration {
        node_id: Some(node_id.clone()),
        plugin_name: "test".to_string(),
        node_type: NodeType::Source,
        plugin_version: "1.0.0".to_string(),
        determinism: Determinism::Deterministic,
        config,
        schema_mode: None,
        schema_fields_json: None,
        sequence_in_pipeline: Some(0),
    };
    // Identical re-registration returns the stored record.
    let node = store.register_node(&run_id, registration(json!({}))).unwrap();
    assert_eq!(node.node_id, node_id);
    // Divergent config is an integrity error.
    let error = store.register_node(&run_id, registration(json!({"changed": true}))).unwrap_err();
    assert!(matches!(error, LandscapeError::Integrity(_)));
}

/// Tests node states transition only out of open.
#[test]
fn test_node_state_transitions() {
    let (_dir, store) = open_store();
    let (run_id, node_id) = seed_run(&store);
    let row = store.create_row(&run_id, &node_id, 0, &json!({"a": 1}), None).unwrap();
    let token = store.create_token(&row.row_id, TokenSpec::default()).unwrap();
    let state = store
        .begin_node_state(&token.token_id, &node_id, 1, &json!({"a": 1}), 1)
        .unwrap();
    let completed = store
        .complete_node_state(
            &state.head.state_id,
            CompletionRequest::Completed { output: json!({"a": 2}), success_reason: None },
            3.5,
        )
        .unwrap();
    assert!(completed.output_hash().is_some());
    let error = store
        .complete_node_state(&state.head.state_id, CompletionRequest::Pending, 1.0)
        .unwrap_err();
    assert!(matches!(error, LandscapeError::InvalidTransition { .. }));
}

// ============================================================================
// SECTION: Referential Integrity
// ============================================================================

/// Tests a token cannot reference a missing row.
#[test]
fn test_token_requires_row() {
    let (_dir, store) = open_store();
    seed_run(&store);
    let error = store.create_token(&RowId::new("ghost"), TokenSpec::default()).unwrap_err();
    assert!(matches!(error, LandscapeError::MissingParent { entity: "row", .. }));
}

/// Tests a transform error record requires its token.
#[test]
fn test_transform_error_requires_token() {
    let (_dir, store) = open_store();
    let (run_id, node_id) = seed_run(&store);
    let error = store
        .record_transform_error(
            &run_id,
            &datatrail_core::TokenId::new("ghost"),
            &node_id,
            &json!({"a": 1}),
            "discard",
            None,
        )
        .unwrap_err();
    assert!(matches!(error, LandscapeError::Integrity(_) | LandscapeError::MissingParent { .. }));
}

// ============================================================================
// SECTION: Terminal Uniqueness
// ============================================================================

/// Tests the partial unique index rejects a second terminal outcome.
#[test]
fn test_terminal_outcome_unique_in_schema() {
    let (_dir, store) = open_store();
    let (run_id, node_id) = seed_run(&store);
    let row = store.create_row(&run_id, &node_id, 0, &json!({"a": 1}), None).unwrap();
    let token = store.create_token(&row.row_id, TokenSpec::default()).unwrap();
    store
        .record_token_outcome(
            &run_id,
            &token.token_id,
            &OutcomeContext::Completed { sink_name: "output".to_string() },
            None,
        )
        .unwrap();
    let error = store
        .record_token_outcome(
            &run_id,
            &token.token_id,
            &OutcomeContext::Quarantined,
            None,
        )
        .unwrap_err();
    assert!(matches!(error, LandscapeError::TerminalOutcomeExists(_)));
}

/// Tests buffered outcomes accumulate and terminal wins reads.
#[test]
fn test_outcome_read_prefers_terminal() {
    let (_dir, store) = open_store();
    let (run_id, node_id) = seed_run(&store);
    let row = store.create_row(&run_id, &node_id, 0, &json!({"a": 1}), None).unwrap();
    let token = store.create_token(&row.row_id, TokenSpec::default()).unwrap();
    let batch = store.create_batch(&run_id, &node_id).unwrap();
    store.add_batch_member(&batch.batch_id, &token.token_id, 0).unwrap();
    store
        .record_token_outcome(
            &run_id,
            &token.token_id,
            &OutcomeContext::Buffered { batch_id: batch.batch_id },
            None,
        )
        .unwrap();
    store
        .record_token_outcome(
            &run_id,
            &token.token_id,
            &OutcomeContext::Completed { sink_name: "output".to_string() },
            None,
        )
        .unwrap();
    let outcome = store.get_token_outcome(&token.token_id).unwrap().unwrap();
    assert!(outcome.is_terminal);
    assert_eq!(outcome.outcome, RowOutcome::Completed);
}

// ============================================================================
// SECTION: Tier-1 Reads
// ============================================================================

/// Tests an invalid stored enum crashes the read instead of round-tripping.
#[test]
fn test_invalid_enum_read_crashes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("landscape.db");
    let store = SqliteLandscape::open(
        &SqliteStoreConfig::new(path.clone()),
        Arc::new(LogicalClock::default()),
        None,
    )
    .unwrap();
    let (run_id, _) = seed_run(&store);
    drop(store);

    // Corrupt the status column out of band.
    let connection = rusqlite::Connection::open(&path).unwrap();
    connection
        .execute(
            "UPDATE runs SET status = 'garbage' WHERE run_id = ?1",
            rusqlite::params![run_id.as_str()],
        )
        .unwrap();
    drop(connection);

    let store = SqliteLandscape::open(
        &SqliteStoreConfig::new(path),
        Arc::new(LogicalClock::default()),
        None,
    )
    .unwrap();
    let error = store.get_run(&run_id).unwrap_err();
    assert!(matches!(error, LandscapeError::Integrity(_)));
}

// ============================================================================
// SECTION: Checkpoints and Lineage
// ============================================================================

/// Tests checkpoints round-trip and order by sequence number.
#[test]
fn test_checkpoint_round_trip() {
    let (_dir, store) = open_store();
    let (run_id, node_id) = seed_run(&store);
    let row = store.create_row(&run_id, &node_id, 0, &json!({"a": 1}), None).unwrap();
    let token = store.create_token(&row.row_id, TokenSpec::default()).unwrap();
    for sequence in [1u64, 3, 2] {
        let checkpoint = datatrail_core::Checkpoint::new(
            datatrail_core::CheckpointId::new(format!("cp_{sequence}")),
            run_id.clone(),
            token.token_id.clone(),
            node_id.clone(),
            sequence,
            datatrail_core::Timestamp::from_unix_millis(0),
            "topology".to_string(),
            "config".to_string(),
            None,
        )
        .unwrap();
        store.record_checkpoint(checkpoint).unwrap();
    }
    let latest = store.get_latest_checkpoint(&run_id).unwrap().unwrap();
    assert_eq!(latest.sequence_number, 3);
    let all = store.get_checkpoints(&run_id).unwrap();
    let sequences: Vec<u64> = all.iter().map(|cp| cp.sequence_number).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    store.delete_checkpoints(&run_id).unwrap();
    assert!(store.get_latest_checkpoint(&run_id).unwrap().is_none());
}

/// Tests explain reconstructs a token chain with its states and outcome.
#[test]
fn test_explain_token_chain() {
    let (_dir, store) = open_store();
    let (run_id, node_id) = seed_run(&store);
    let row = store.create_row(&run_id, &node_id, 0, &json!({"a": 1}), None).unwrap();
    let parent = store.create_token(&row.row_id, TokenSpec::default()).unwrap();
    let child = store
        .create_token(
            &row.row_id,
            TokenSpec {
                parents: vec![parent.token_id.clone()],
                ..TokenSpec::default()
            },
        )
        .unwrap();
    let state = store
        .begin_node_state(&child.token_id, &node_id, 2, &json!({"a": 1}), 1)
        .unwrap();
    store
        .complete_node_state(
            &state.head.state_id,
            CompletionRequest::Completed { output: json!({"a": 2}), success_reason: None },
            1.0,
        )
        .unwrap();
    store
        .record_token_outcome(
            &run_id,
            &child.token_id,
            &OutcomeContext::Completed { sink_name: "output".to_string() },
            None,
        )
        .unwrap();
    let lineage = store.explain_token(&child.token_id).unwrap().unwrap();
    assert_eq!(lineage.tokens.len(), 2);
    assert_eq!(lineage.node_states.len(), 1);
    assert_eq!(lineage.outcome.unwrap().outcome, RowOutcome::Completed);
    assert!(!lineage.source_row.payload_available);
}
