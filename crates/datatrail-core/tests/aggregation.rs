// crates/datatrail-core/tests/aggregation.rs
// ============================================================================
// Module: Aggregation and Coalesce Tests
// Description: Tests for buffer triggers, state round trips, and joins.
// ============================================================================
//! ## Overview
//! Validates the buffer bookkeeping in isolation: count and time triggers,
//! empty-buffer behavior, checkpoint state round trips, and the coalesce
//! policies and merge strategies.

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

use datatrail_core::AggregationSettings;
use datatrail_core::BatchId;
use datatrail_core::CoalescePolicy;
use datatrail_core::CoalesceSettings;
use datatrail_core::MergeStrategy;
use datatrail_core::NodeId;
use datatrail_core::OutputMode;
use datatrail_core::PipelineRow;
use datatrail_core::RowId;
use datatrail_core::SchemaContract;
use datatrail_core::Timestamp;
use datatrail_core::Token;
use datatrail_core::TokenId;
use datatrail_core::runtime::AggregationManager;
use datatrail_core::runtime::ArrivalDisposition;
use datatrail_core::runtime::CoalesceManager;
use datatrail_core::runtime::aggregation::BranchArrival;
use serde_json::json;

/// Builds a token with the given id.
fn token(id: &str) -> Token {
    Token {
        token_id: TokenId::new(id),
        row_id: RowId::new(format!("row_{id}")),
        created_at: Timestamp::from_unix_millis(0),
        fork_group_id: None,
        join_group_id: None,
        expand_group_id: None,
        branch_name: None,
        step_in_pipeline: Some(1),
    }
}

/// Builds a free-contract pipeline row from JSON.
fn row(value: serde_json::Value) -> PipelineRow {
    PipelineRow::new(value.as_object().cloned().unwrap(), SchemaContract::free())
}

/// Builds a manager with one registered aggregation.
fn manager(count: Option<usize>, timeout_ms: Option<i64>) -> (AggregationManager, NodeId) {
    let node_id = NodeId::new("aggregation_00_window");
    let mut manager = AggregationManager::new();
    manager.register(AggregationSettings {
        node_id: node_id.clone(),
        name: "window".to_string(),
        count_trigger: count,
        timeout_ms,
        output_mode: OutputMode::Passthrough,
    });
    (manager, node_id)
}

// ============================================================================
// SECTION: Triggers
// ============================================================================

/// Tests the count trigger fires exactly at the threshold.
#[test]
fn test_count_trigger_fires_at_threshold() {
    let (mut manager, node_id) = manager(Some(3), None);
    let now = Timestamp::from_unix_millis(0);
    for index in 0..2 {
        let action = manager
            .buffer_row(&node_id, token(&format!("t{index}")), row(json!({"i": index})), 1, now)
            .unwrap();
        assert!(!action.count_fired);
    }
    let action =
        manager.buffer_row(&node_id, token("t2"), row(json!({"i": 2})), 1, now).unwrap();
    assert!(action.count_fired);
    assert_eq!(action.ordinal, 2);
}

/// Tests an empty buffer never reports an expired timeout.
#[test]
fn test_empty_buffer_never_times_out() {
    let (manager, node_id) = manager(None, Some(10));
    assert!(!manager.timeout_expired(&node_id, Timestamp::from_unix_millis(1_000_000)));
}

/// Tests the time trigger measures the age of the first buffered row.
#[test]
fn test_timeout_measures_buffer_age() {
    let (mut manager, node_id) = manager(None, Some(100));
    manager
        .buffer_row(&node_id, token("t0"), row(json!({})), 1, Timestamp::from_unix_millis(0))
        .unwrap();
    assert!(!manager.timeout_expired(&node_id, Timestamp::from_unix_millis(99)));
    assert!(manager.timeout_expired(&node_id, Timestamp::from_unix_millis(100)));
}

/// Tests draining resets the buffer and its batch assignment.
#[test]
fn test_take_buffer_resets() {
    let (mut manager, node_id) = manager(Some(10), None);
    manager
        .buffer_row(&node_id, token("t0"), row(json!({})), 1, Timestamp::from_unix_millis(0))
        .unwrap();
    manager.assign_batch(&node_id, BatchId::new("batch_1")).unwrap();
    let (entries, batch_id) = manager.take_buffer(&node_id).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(batch_id, Some(BatchId::new("batch_1")));
    assert_eq!(manager.buffer_count(&node_id), 0);
    assert!(manager.batch_id(&node_id).is_none());
}

// ============================================================================
// SECTION: Checkpoint State
// ============================================================================

/// Tests buffers round-trip through checkpoint state.
#[test]
fn test_aggregation_state_round_trip() {
    let (mut manager, node_id) = manager(Some(10), None);
    manager
        .buffer_row(&node_id, token("t0"), row(json!({"i": 0})), 1, Timestamp::from_unix_millis(5))
        .unwrap();
    manager
        .buffer_row(&node_id, token("t1"), row(json!({"i": 1})), 1, Timestamp::from_unix_millis(6))
        .unwrap();
    let state = manager.serialize_state().unwrap();

    let (mut restored, _) = self::manager(Some(10), None);
    restored.restore_state(&state).unwrap();
    assert_eq!(restored.buffer_count(&node_id), 2);
}

/// Tests empty buffers serialize to nothing.
#[test]
fn test_empty_state_serializes_to_none() {
    let (manager, _) = manager(Some(10), None);
    assert!(manager.serialize_state().is_none());
}

// ============================================================================
// SECTION: Coalesce
// ============================================================================

/// Builds coalesce settings for two branches.
fn coalesce(policy: CoalescePolicy, merge: MergeStrategy) -> CoalesceSettings {
    CoalesceSettings {
        node_id: NodeId::new("coalesce_01_join"),
        name: "join".to_string(),
        expected_branches: vec!["left".to_string(), "right".to_string()],
        policy,
        merge,
    }
}

/// Builds an arrival on a branch.
fn arrival(branch: &str, id: &str, value: serde_json::Value) -> BranchArrival {
    BranchArrival { branch: branch.to_string(), token: token(id), row: row(value) }
}

/// Tests require-all fires only when every branch has arrived.
#[test]
fn test_require_all_policy() {
    let settings = coalesce(CoalescePolicy::RequireAll, MergeStrategy::Union);
    let mut manager = CoalesceManager::new();
    manager.register(settings.clone());
    let row_id = RowId::new("row_x");
    let disposition = manager
        .add_arrival(&settings.node_id, &row_id, arrival("left", "tl", json!({"a": 1})))
        .unwrap();
    assert_eq!(disposition, ArrivalDisposition::Held);
    let disposition = manager
        .add_arrival(&settings.node_id, &row_id, arrival("right", "tr", json!({"b": 2})))
        .unwrap();
    assert_eq!(disposition, ArrivalDisposition::Ready);
}

/// Tests the first policy fires on the first arrival.
#[test]
fn test_first_policy() {
    let settings = coalesce(CoalescePolicy::First, MergeStrategy::Union);
    let mut manager = CoalesceManager::new();
    manager.register(settings.clone());
    let disposition = manager
        .add_arrival(&settings.node_id, &RowId::new("row_x"), arrival("left", "tl", json!({})))
        .unwrap();
    assert_eq!(disposition, ArrivalDisposition::Ready);
}

/// Tests a join fires at most once per row: after the first-wins join is
/// taken, a late branch for the same row is rejected instead of re-joining.
#[test]
fn test_first_policy_rejects_late_arrival() {
    let settings = coalesce(CoalescePolicy::First, MergeStrategy::Union);
    let mut manager = CoalesceManager::new();
    manager.register(settings.clone());
    let row_id = RowId::new("row_x");
    let disposition = manager
        .add_arrival(&settings.node_id, &row_id, arrival("left", "tl", json!({"a": 1})))
        .unwrap();
    assert_eq!(disposition, ArrivalDisposition::Ready);
    let joined = manager.take_arrivals(&settings.node_id, &row_id);
    assert_eq!(joined.len(), 1);

    let disposition = manager
        .add_arrival(&settings.node_id, &row_id, arrival("right", "tr", json!({"b": 2})))
        .unwrap();
    assert_eq!(disposition, ArrivalDisposition::AlreadyJoined);
    // The late arrival was not buffered: nothing is pending for the key.
    assert!(manager.take_arrivals(&settings.node_id, &row_id).is_empty());
}

/// Tests quorum joins also resolve at most once per row.
#[test]
fn test_quorum_rejects_second_join() {
    let settings = coalesce(CoalescePolicy::Quorum(1), MergeStrategy::Union);
    let mut manager = CoalesceManager::new();
    manager.register(settings.clone());
    let row_id = RowId::new("row_q");
    let disposition = manager
        .add_arrival(&settings.node_id, &row_id, arrival("left", "tl", json!({})))
        .unwrap();
    assert_eq!(disposition, ArrivalDisposition::Ready);
    let _ = manager.take_arrivals(&settings.node_id, &row_id);
    let disposition = manager
        .add_arrival(&settings.node_id, &row_id, arrival("right", "tr", json!({})))
        .unwrap();
    assert_eq!(disposition, ArrivalDisposition::AlreadyJoined);
}

/// Tests union merge with earlier branches winning conflicts.
#[test]
fn test_union_merge_branch_precedence() {
    let settings = coalesce(CoalescePolicy::RequireAll, MergeStrategy::Union);
    let arrivals = vec![
        // Delivered out of declaration order on purpose.
        arrival("right", "tr", json!({"shared": "from_right", "b": 2})),
        arrival("left", "tl", json!({"shared": "from_left", "a": 1})),
    ];
    let (merged, _) = CoalesceManager::merge_rows(&settings, &arrivals).unwrap();
    assert_eq!(merged.get("shared"), Some(&json!("from_left")));
    assert_eq!(merged.get("a"), Some(&json!(1)));
    assert_eq!(merged.get("b"), Some(&json!(2)));
}

/// Tests nested merge keys rows by branch name.
#[test]
fn test_nested_merge() {
    let settings = coalesce(CoalescePolicy::RequireAll, MergeStrategy::Nested);
    let arrivals = vec![
        arrival("left", "tl", json!({"a": 1})),
        arrival("right", "tr", json!({"b": 2})),
    ];
    let (merged, _) = CoalesceManager::merge_rows(&settings, &arrivals).unwrap();
    assert_eq!(merged.get("left"), Some(&json!({"a": 1})));
    assert_eq!(merged.get("right"), Some(&json!({"b": 2})));
}

/// Tests select merge keeps only the named fields.
#[test]
fn test_select_merge() {
    let settings = coalesce(
        CoalescePolicy::RequireAll,
        MergeStrategy::Select(vec!["a".to_string()]),
    );
    let arrivals = vec![
        arrival("left", "tl", json!({"a": 1, "noise": true})),
        arrival("right", "tr", json!({"b": 2})),
    ];
    let (merged, _) = CoalesceManager::merge_rows(&settings, &arrivals).unwrap();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged.get("a"), Some(&json!(1)));
}

/// Tests conflicting branch contracts refuse to merge.
#[test]
fn test_contract_conflict_fails_join() {
    use datatrail_core::FieldContract;
    use datatrail_core::FieldType;
    use datatrail_core::SchemaMode;

    let settings = coalesce(CoalescePolicy::RequireAll, MergeStrategy::Union);
    let left_contract = SchemaContract::declared(
        SchemaMode::Strict,
        vec![FieldContract::declared("shared", FieldType::Integer, true)],
    );
    let right_contract = SchemaContract::declared(
        SchemaMode::Strict,
        vec![FieldContract::declared("shared", FieldType::String, true)],
    );
    let arrivals = vec![
        BranchArrival {
            branch: "left".to_string(),
            token: token("tl"),
            row: PipelineRow::new(
                json!({"shared": 1}).as_object().cloned().unwrap(),
                left_contract,
            ),
        },
        BranchArrival {
            branch: "right".to_string(),
            token: token("tr"),
            row: PipelineRow::new(
                json!({"shared": "x"}).as_object().cloned().unwrap(),
                right_contract,
            ),
        },
    ];
    assert!(CoalesceManager::merge_rows(&settings, &arrivals).is_err());
}
