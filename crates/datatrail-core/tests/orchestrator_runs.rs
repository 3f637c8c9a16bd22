// crates/datatrail-core/tests/orchestrator_runs.rs
// ============================================================================
// Module: Orchestrator Run Tests
// Description: End-to-end engine runs over the in-memory Landscape.
// ============================================================================
//! ## Overview
//! Drives complete pipelines through the orchestrator: pass-through, gate
//! routing with recorded events, error routing, aggregation end-of-source
//! flushing, and durability failure handling.

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

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::BatchEcho;
use common::CollectingSink;
use common::RejectTransform;
use common::StampTransform;
use common::TestGate;
use common::VecSource;
use common::targets;
use datatrail_core::AggregationSettings;
use datatrail_core::EngineError;
use datatrail_core::Landscape;
use datatrail_core::LogicalClock;
use datatrail_core::NodeId;
use datatrail_core::Orchestrator;
use datatrail_core::OutputMode;
use datatrail_core::PipelineConfig;
use datatrail_core::RouteTarget;
use datatrail_core::RowOutcome;
use datatrail_core::RunStatus;
use datatrail_core::StepConfig;
use datatrail_core::StepTarget;
use datatrail_core::runtime::InMemoryLandscape;
use serde_json::json;

/// Builds an orchestrator over a fresh in-memory Landscape.
fn engine() -> (Arc<InMemoryLandscape>, Orchestrator) {
    let clock = Arc::new(LogicalClock::default());
    let landscape = Arc::new(InMemoryLandscape::new(clock.clone()));
    let orchestrator = Orchestrator::new(landscape.clone(), clock);
    (landscape, orchestrator)
}

/// Builds a minimal pipeline config.
fn pipeline(
    source: VecSource,
    steps: Vec<StepConfig>,
    sinks: Vec<CollectingSink>,
) -> PipelineConfig {
    PipelineConfig {
        pipeline_name: "test".to_string(),
        source: Box::new(source),
        steps,
        sinks: sinks.into_iter().map(|sink| Box::new(sink) as _).collect(),
        settings: json!({"pipeline": "test"}),
        checkpoint_every_rows: None,
        export: None,
    }
}

// ============================================================================
// SECTION: Pass-Through
// ============================================================================

/// Tests a source-to-sink run completes every row and flushes the sink.
#[test]
fn test_passthrough_run_completes() {
    let (landscape, orchestrator) = engine();
    let source = VecSource::of_valid(
        vec![json!({"id": 1, "value": 100}), json!({"id": 2, "value": 200})],
        "output",
    );
    let sink = CollectingSink::new("output");
    let (rows, flushed) = sink.handles();
    let summary = orchestrator.run(pipeline(source, Vec::new(), vec![sink])).unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.rows_loaded, 2);
    assert_eq!(summary.rows_completed, 2);
    assert!(flushed.load(Ordering::SeqCst));
    let written = rows.lock().unwrap();
    assert_eq!(written.len(), 2);
    assert_eq!(written[0].get("id"), Some(&json!(1)));

    // Exactly one row and one token per source row, each with one terminal
    // completed outcome.
    let run = landscape.get_run(&summary.run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let stored_rows = landscape.get_rows(&summary.run_id).unwrap();
    assert_eq!(stored_rows.len(), 2);
    for row in &stored_rows {
        let tokens = landscape.get_tokens_for_row(&row.row_id).unwrap();
        assert_eq!(tokens.len(), 1);
        let outcome = landscape.get_token_outcome(&tokens[0].token_id).unwrap().unwrap();
        assert!(outcome.is_terminal);
        assert_eq!(outcome.outcome, RowOutcome::Completed);
        assert_eq!(outcome.sink_name.as_deref(), Some("output"));
    }
}

/// Tests transforms run and record node states between source and sink.
#[test]
fn test_transform_chain_records_states() {
    let (landscape, orchestrator) = engine();
    let source = VecSource::of_valid(vec![json!({"id": 1})], "output");
    let sink = CollectingSink::new("output");
    let (rows, _) = sink.handles();
    let steps = vec![
        StepConfig::Transform(Box::new(StampTransform::new("stage_a", json!(true), "output"))),
        StepConfig::Transform(Box::new(StampTransform::new("stage_b", json!(true), "output"))),
    ];
    let summary = orchestrator.run(pipeline(source, steps, vec![sink])).unwrap();
    assert_eq!(summary.rows_completed, 1);
    let written = rows.lock().unwrap();
    assert_eq!(written[0].get("stage_a"), Some(&json!(true)));
    assert_eq!(written[0].get("stage_b"), Some(&json!(true)));

    let stored_rows = landscape.get_rows(&summary.run_id).unwrap();
    let tokens = landscape.get_tokens_for_row(&stored_rows[0].row_id).unwrap();
    let states = landscape.get_node_states_for_token(&tokens[0].token_id).unwrap();
    // Two transforms plus the sink node state.
    assert_eq!(states.len(), 3);
}

// ============================================================================
// SECTION: Gate Routing
// ============================================================================

/// Tests the gate routing scenario: first-match wins, no-match routes to the
/// configured sink, and a routing event is recorded per decision.
#[test]
fn test_gate_routing_scenario() {
    let (landscape, orchestrator) = engine();
    let source = VecSource::of_valid(
        vec![
            json!({"status": "active", "score": 0.9}),
            json!({"status": "active", "score": 0.3}),
            json!({"status": "deleted", "score": 0.9}),
        ],
        "matched",
    );
    let matched = CollectingSink::new("matched");
    let unmatched = CollectingSink::new("unmatched");
    let (matched_rows, _) = matched.handles();
    let (unmatched_rows, _) = unmatched.handles();
    let gate = TestGate::single(
        "score_gate",
        "match",
        "row['status'] == 'active' and row['score'] >= 0.5",
        Some("unmatched"),
    );
    let steps = vec![StepConfig::Gate {
        plugin: Box::new(gate),
        targets: targets(&[("match", StepTarget::Sink("matched".to_string()))]),
    }];
    let summary =
        orchestrator.run(pipeline(source, steps, vec![matched, unmatched])).unwrap();

    assert_eq!(matched_rows.lock().unwrap().len(), 1);
    assert_eq!(unmatched_rows.lock().unwrap().len(), 2);
    assert_eq!(summary.rows_completed, 1);
    assert_eq!(summary.rows_routed, 2);

    // One routing event per row.
    let snapshot = landscape.export_snapshot(&summary.run_id).unwrap();
    assert_eq!(snapshot.routing_events.len(), 3);
}

// ============================================================================
// SECTION: Error Routing
// ============================================================================

/// Tests transform errors route to the on-error sink with a transform error
/// record, while discard yields a failed outcome.
#[test]
fn test_transform_error_routing() {
    let (landscape, orchestrator) = engine();
    let source = VecSource::of_valid(
        vec![json!({"kind": "good"}), json!({"kind": "bad"})],
        "output",
    );
    let output = CollectingSink::new("output");
    let errors = CollectingSink::new("errors");
    let (output_rows, _) = output.handles();
    let (error_rows, _) = errors.handles();
    let steps = vec![StepConfig::Transform(Box::new(RejectTransform::new(
        "kind",
        json!("bad"),
        "output",
        RouteTarget::Sink("errors".to_string()),
    )))];
    let summary = orchestrator.run(pipeline(source, steps, vec![output, errors])).unwrap();

    assert_eq!(output_rows.lock().unwrap().len(), 1);
    assert_eq!(error_rows.lock().unwrap().len(), 1);
    assert_eq!(summary.rows_completed, 1);
    assert_eq!(summary.rows_routed, 1);

    let snapshot = landscape.export_snapshot(&summary.run_id).unwrap();
    assert_eq!(snapshot.transform_errors.len(), 1);
    assert_eq!(snapshot.transform_errors[0].destination, "errors");
    let routed = snapshot
        .token_outcomes
        .iter()
        .find(|outcome| outcome.outcome == RowOutcome::Routed)
        .unwrap();
    assert_eq!(routed.sink_name.as_deref(), Some("errors"));
}

// ============================================================================
// SECTION: Quarantine
// ============================================================================

/// Tests quarantined source rows create a row, a token, and a routed or
/// quarantined outcome without entering the pipeline.
#[test]
fn test_quarantined_rows() {
    use datatrail_core::SourceRow;

    let (landscape, orchestrator) = engine();
    let mut source = VecSource::of_valid(vec![json!({"id": 1})], "output");
    source.rows.push(SourceRow::quarantined(
        json!({"id": "broken"}),
        RouteTarget::Discard,
        "id must be an integer",
    ));
    let sink = CollectingSink::new("output");
    let summary = orchestrator.run(pipeline(source, Vec::new(), vec![sink])).unwrap();

    assert_eq!(summary.rows_loaded, 2);
    assert_eq!(summary.rows_completed, 1);
    assert_eq!(summary.rows_quarantined, 1);
    let snapshot = landscape.export_snapshot(&summary.run_id).unwrap();
    assert_eq!(snapshot.rows.len(), 2);
    assert_eq!(snapshot.validation_errors.len(), 1);
    let quarantined = snapshot
        .token_outcomes
        .iter()
        .find(|outcome| outcome.outcome == RowOutcome::Quarantined)
        .unwrap();
    assert!(quarantined.is_terminal);
}

// ============================================================================
// SECTION: Aggregation
// ============================================================================

/// Tests the end-of-source flush: a count trigger of 100 over 5 rows emits
/// no batch mid-stream and exactly one end-of-source batch of 5.
#[test]
fn test_aggregation_end_of_source_flush() {
    let (landscape, orchestrator) = engine();
    let source = VecSource::of_valid(
        (0..5).map(|index| json!({"id": index})).collect(),
        "output",
    );
    let sink = CollectingSink::new("output");
    let (rows, _) = sink.handles();
    let echo = BatchEcho::new("output");
    let batches_seen = Arc::clone(&echo.batches_seen);
    let steps = vec![StepConfig::Aggregation {
        transform: Box::new(echo),
        settings: AggregationSettings {
            node_id: NodeId::new("pending"),
            name: "window".to_string(),
            count_trigger: Some(100),
            timeout_ms: None,
            output_mode: OutputMode::Passthrough,
        },
    }];
    let summary = orchestrator.run(pipeline(source, steps, vec![sink])).unwrap();

    assert_eq!(batches_seen.load(Ordering::SeqCst), 1);
    assert_eq!(rows.lock().unwrap().len(), 5);
    let snapshot = landscape.export_snapshot(&summary.run_id).unwrap();
    assert_eq!(snapshot.batches.len(), 1);
    assert_eq!(
        snapshot.batches[0].trigger_type,
        Some(datatrail_core::TriggerType::EndOfSource)
    );
    assert_eq!(snapshot.batch_members.len(), 5);
    // Every member was buffered and then consumed.
    let buffered = snapshot
        .token_outcomes
        .iter()
        .filter(|outcome| outcome.outcome == RowOutcome::Buffered)
        .count();
    let consumed = snapshot
        .token_outcomes
        .iter()
        .filter(|outcome| outcome.outcome == RowOutcome::ConsumedInBatch)
        .count();
    assert_eq!(buffered, 5);
    assert_eq!(consumed, 5);
}

/// Tests a count trigger of N flushes one batch per N rows mid-stream.
#[test]
fn test_aggregation_count_trigger_cadence() {
    let (landscape, orchestrator) = engine();
    let source = VecSource::of_valid(
        (0..6).map(|index| json!({"id": index})).collect(),
        "output",
    );
    let sink = CollectingSink::new("output");
    let echo = BatchEcho::new("output");
    let batches_seen = Arc::clone(&echo.batches_seen);
    let steps = vec![StepConfig::Aggregation {
        transform: Box::new(echo),
        settings: AggregationSettings {
            node_id: NodeId::new("pending"),
            name: "window".to_string(),
            count_trigger: Some(3),
            timeout_ms: None,
            output_mode: OutputMode::Passthrough,
        },
    }];
    let summary = orchestrator.run(pipeline(source, steps, vec![sink])).unwrap();
    assert_eq!(batches_seen.load(Ordering::SeqCst), 2);
    let snapshot = landscape.export_snapshot(&summary.run_id).unwrap();
    assert_eq!(snapshot.batches.len(), 2);
    assert!(
        snapshot
            .batches
            .iter()
            .all(|batch| batch.trigger_type == Some(datatrail_core::TriggerType::Count))
    );
}

/// Tests single output mode produces one child token parented by the batch.
#[test]
fn test_aggregation_single_output_joins_members() {
    struct BatchCount {
        /// Success sink name.
        on_success: String,
        /// Error route.
        on_error: RouteTarget,
        /// Free contract.
        schema: datatrail_core::SchemaContract,
    }
    impl datatrail_core::TransformPlugin for BatchCount {
        fn name(&self) -> &str {
            "batch_count"
        }
        fn plugin_version(&self) -> &str {
            "1.0.0"
        }
        fn determinism(&self) -> datatrail_core::Determinism {
            datatrail_core::Determinism::Deterministic
        }
        fn input_schema(&self) -> &datatrail_core::SchemaContract {
            &self.schema
        }
        fn output_schema(&self) -> &datatrail_core::SchemaContract {
            &self.schema
        }
        fn is_batch_aware(&self) -> bool {
            true
        }
        fn transform_adds_fields(&self) -> bool {
            true
        }
        fn on_error(&self) -> &RouteTarget {
            &self.on_error
        }
        fn on_success(&self) -> &str {
            &self.on_success
        }
        fn process(
            &mut self,
            row: datatrail_core::PipelineRow,
            _ctx: &datatrail_core::PluginContext,
        ) -> datatrail_core::TransformResult {
            datatrail_core::TransformResult::success(row.into_parts().0)
        }
        fn process_batch(
            &mut self,
            rows: Vec<datatrail_core::PipelineRow>,
            _ctx: &datatrail_core::PluginContext,
        ) -> datatrail_core::TransformResult {
            let mut summary = serde_json::Map::new();
            summary.insert("row_count".to_string(), json!(rows.len()));
            datatrail_core::TransformResult::success(summary)
        }
    }

    let (landscape, orchestrator) = engine();
    let source = VecSource::of_valid(
        (0..4).map(|index| json!({"id": index})).collect(),
        "output",
    );
    let sink = CollectingSink::new("output");
    let (rows, _) = sink.handles();
    let steps = vec![StepConfig::Aggregation {
        transform: Box::new(BatchCount {
            on_success: "output".to_string(),
            on_error: RouteTarget::Discard,
            schema: datatrail_core::SchemaContract::free(),
        }),
        settings: AggregationSettings {
            node_id: NodeId::new("pending"),
            name: "window".to_string(),
            count_trigger: Some(4),
            timeout_ms: None,
            output_mode: OutputMode::Single,
        },
    }];
    let summary = orchestrator.run(pipeline(source, steps, vec![sink])).unwrap();

    let written = rows.lock().unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].get("row_count"), Some(&json!(4)));
    let snapshot = landscape.export_snapshot(&summary.run_id).unwrap();
    // The output token is parented by all four members.
    let child = snapshot.tokens.iter().find(|token| token.join_group_id.is_some()).unwrap();
    let parents: Vec<_> = snapshot
        .token_parents
        .iter()
        .filter(|parent| parent.token_id == child.token_id)
        .collect();
    assert_eq!(parents.len(), 4);
}

// ============================================================================
// SECTION: Durability
// ============================================================================

/// Tests a failing sink flush marks the run failed.
#[test]
fn test_flush_failure_fails_run() {
    let (landscape, orchestrator) = engine();
    let source = VecSource::of_valid(vec![json!({"id": 1})], "output");
    let mut sink = CollectingSink::new("output");
    sink.fail_flush = true;
    let error = orchestrator.run(pipeline(source, Vec::new(), vec![sink])).unwrap_err();
    assert!(matches!(error, EngineError::Durability { .. }));

    // The store's id generator is deterministic, so the failed run's id is
    // reconstructible.
    let mut ids = datatrail_core::IdGenerator::new("landscape");
    let run_id = datatrail_core::RunId::new(ids.next_id("run"));
    let run = landscape.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}
