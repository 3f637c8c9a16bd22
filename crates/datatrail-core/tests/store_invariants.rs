// crates/datatrail-core/tests/store_invariants.rs
// ============================================================================
// Module: In-Memory Landscape Tests
// Description: Tests for audit-store invariants in the reference store.
// ============================================================================
//! ## Overview
//! Validates referential integrity, terminal-outcome uniqueness, node-state
//! transition rules, and lineage reconstruction against the in-memory
//! Landscape.

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
use datatrail_core::RunStatus;
use datatrail_core::TokenId;
use datatrail_core::TokenSpec;
use datatrail_core::runtime::InMemoryLandscape;
use serde_json::json;

/// Creates a store, a run, and a registered source node.
fn store_with_run() -> (InMemoryLandscape, RunId, NodeId) {
    let store = InMemoryLandscape::new(Arc::new(LogicalClock::default()));
    let run = store.begin_run(&json!({"pipeline": "test"}), "jcs-sha256/1").unwrap();
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
    (store, run.run_id, node.node_id)
}

// ============================================================================
// SECTION: Referential Integrity
// ============================================================================

/// Tests creating a token for a missing row fails.
#[test]
fn test_token_requires_row() {
    let (store, _, _) = store_with_run();
    let error = store.create_token(&RowId::new("missing"), TokenSpec::default()).unwrap_err();
    assert!(matches!(error, LandscapeError::MissingParent { entity: "row", .. }));
}

/// Tests creating a row for an unregistered node fails.
#[test]
fn test_row_requires_node() {
    let (store, run_id, _) = store_with_run();
    let error = store
        .create_row(&run_id, &NodeId::new("ghost"), 0, &json!({"a": 1}), None)
        .unwrap_err();
    assert!(matches!(error, LandscapeError::MissingParent { entity: "node", .. }));
}

/// Tests recording an outcome for a missing token fails.
#[test]
fn test_outcome_requires_token() {
    let (store, run_id, _) = store_with_run();
    let error = store
        .record_token_outcome(
            &run_id,
            &TokenId::new("ghost"),
            &OutcomeContext::Quarantined,
            None,
        )
        .unwrap_err();
    assert!(matches!(error, LandscapeError::MissingParent { entity: "token", .. }));
}

// ============================================================================
// SECTION: Terminal Uniqueness
// ============================================================================

/// Tests at most one terminal outcome per token.
#[test]
fn test_terminal_outcome_unique() {
    let (store, run_id, node_id) = store_with_run();
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
            &OutcomeContext::Failed { error_hash: None },
            None,
        )
        .unwrap_err();
    assert!(matches!(error, LandscapeError::TerminalOutcomeExists(_)));
}

/// Tests non-terminal outcomes may accumulate before the terminal one.
#[test]
fn test_non_terminal_outcomes_accumulate() {
    let (store, run_id, node_id) = store_with_run();
    let row = store.create_row(&run_id, &node_id, 0, &json!({"a": 1}), None).unwrap();
    let token = store.create_token(&row.row_id, TokenSpec::default()).unwrap();
    let batch = store.create_batch(&run_id, &node_id).unwrap();
    store.add_batch_member(&batch.batch_id, &token.token_id, 0).unwrap();
    store
        .record_token_outcome(
            &run_id,
            &token.token_id,
            &OutcomeContext::Buffered { batch_id: batch.batch_id.clone() },
            None,
        )
        .unwrap();
    store
        .record_token_outcome(
            &run_id,
            &token.token_id,
            &OutcomeContext::ConsumedInBatch { batch_id: batch.batch_id.clone() },
            None,
        )
        .unwrap();
    // The latest non-terminal outcome is returned until a terminal exists.
    let outcome = store.get_token_outcome(&token.token_id).unwrap().unwrap();
    assert_eq!(outcome.outcome, RowOutcome::ConsumedInBatch);

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
// SECTION: Node State Transitions
// ============================================================================

/// Tests only open states may transition.
#[test]
fn test_transition_from_non_open_rejected() {
    let (store, run_id, node_id) = store_with_run();
    let row = store.create_row(&run_id, &node_id, 0, &json!({"a": 1}), None).unwrap();
    let token = store.create_token(&row.row_id, TokenSpec::default()).unwrap();
    let state = store
        .begin_node_state(&token.token_id, &node_id, 1, &json!({"a": 1}), 1)
        .unwrap();
    store
        .complete_node_state(
            &state.head.state_id,
            CompletionRequest::Completed { output: json!({"a": 1}), success_reason: None },
            1.0,
        )
        .unwrap();
    let error = store
        .complete_node_state(
            &state.head.state_id,
            CompletionRequest::Failed { error: None, partial_output: None },
            1.0,
        )
        .unwrap_err();
    assert!(matches!(error, LandscapeError::InvalidTransition { .. }));
}

// ============================================================================
// SECTION: Run Status
// ============================================================================

/// Tests terminal run status is set exactly once.
#[test]
fn test_run_terminal_status_once() {
    let (store, run_id, _) = store_with_run();
    store.set_run_status(&run_id, RunStatus::Completed).unwrap();
    let error = store.set_run_status(&run_id, RunStatus::Failed).unwrap_err();
    assert!(matches!(error, LandscapeError::RunAlreadyTerminal(_)));
}

// ============================================================================
// SECTION: Lineage
// ============================================================================

/// Tests explain reconstructs states in step order with the terminal outcome.
#[test]
fn test_explain_row_basic() {
    let (store, run_id, node_id) = store_with_run();
    let row = store.create_row(&run_id, &node_id, 0, &json!({"a": 1}), None).unwrap();
    let token = store.create_token(&row.row_id, TokenSpec::default()).unwrap();
    for step in 1..=3u32 {
        let state = store
            .begin_node_state(&token.token_id, &node_id, step, &json!({"a": 1}), 1)
            .unwrap();
        store
            .complete_node_state(
                &state.head.state_id,
                CompletionRequest::Completed { output: json!({"a": 1}), success_reason: None },
                1.0,
            )
            .unwrap();
    }
    store
        .record_token_outcome(
            &run_id,
            &token.token_id,
            &OutcomeContext::Completed { sink_name: "output".to_string() },
            None,
        )
        .unwrap();
    let lineage = store.explain_row(&run_id, &row.row_id, None).unwrap().unwrap();
    assert_eq!(lineage.tokens.len(), 1);
    assert_eq!(lineage.node_states.len(), 3);
    let steps: Vec<u32> =
        lineage.node_states.iter().map(|state| state.head().step_index).collect();
    assert_eq!(steps, vec![1, 2, 3]);
    assert_eq!(lineage.outcome.unwrap().outcome, RowOutcome::Completed);
    assert!(!lineage.source_row.payload_available);
}

/// Tests multiple terminal tokens require a sink disambiguator.
#[test]
fn test_explain_ambiguous_without_sink() {
    let (store, run_id, node_id) = store_with_run();
    let row = store.create_row(&run_id, &node_id, 0, &json!({"a": 1}), None).unwrap();
    let first = store.create_token(&row.row_id, TokenSpec::default()).unwrap();
    let second = store.create_token(&row.row_id, TokenSpec::default()).unwrap();
    store
        .record_token_outcome(
            &run_id,
            &first.token_id,
            &OutcomeContext::Completed { sink_name: "left".to_string() },
            None,
        )
        .unwrap();
    store
        .record_token_outcome(
            &run_id,
            &second.token_id,
            &OutcomeContext::Completed { sink_name: "right".to_string() },
            None,
        )
        .unwrap();
    let error = store.explain_row(&run_id, &row.row_id, None).unwrap_err();
    assert!(matches!(error, LandscapeError::AmbiguousLineage(_)));
    let lineage = store.explain_row(&run_id, &row.row_id, Some("left")).unwrap().unwrap();
    assert_eq!(lineage.outcome.unwrap().sink_name.as_deref(), Some("left"));
}
