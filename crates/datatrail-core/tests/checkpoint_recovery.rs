// crates/datatrail-core/tests/checkpoint_recovery.rs
// ============================================================================
// Module: Checkpoint and Recovery Tests
// Description: Tests for checkpoint compatibility and resume replay.
// ============================================================================
//! ## Overview
//! Stages crashed runs by hand (rows persisted with payloads, a checkpoint at
//! a known sequence number, no terminal run status) and validates that resume
//! replays exactly the unprocessed rows, that topology or config drift is
//! refused loudly without writing data, and that non-resumable sinks refuse
//! resume.

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

use common::CollectingSink;
use common::MemoryPayloadStore;
use common::SinkBuffer;
use common::StampTransform;
use common::VecSource;
use datatrail_core::CHECKPOINT_FORMAT_VERSION;
use datatrail_core::EngineError;
use datatrail_core::Landscape;
use datatrail_core::LogicalClock;
use datatrail_core::NodeRegistration;
use datatrail_core::Orchestrator;
use datatrail_core::PipelineConfig;
use datatrail_core::RunId;
use datatrail_core::RunStatus;
use datatrail_core::StepConfig;
use datatrail_core::TokenSpec;
use datatrail_core::runtime::CheckpointManager;
use datatrail_core::runtime::InMemoryLandscape;
use datatrail_core::runtime::PreparedPipeline;
use datatrail_core::runtime::RecoveryManager;
use serde_json::json;

/// Builds a pipeline config: source -> [optional stamp transform] -> sink.
fn make_pipeline(with_transform: bool, sink: CollectingSink) -> PipelineConfig {
    let steps = if with_transform {
        vec![StepConfig::Transform(Box::new(StampTransform::new(
            "stamped",
            json!(true),
            "output",
        )))]
    } else {
        Vec::new()
    };
    PipelineConfig {
        pipeline_name: "recovery".to_string(),
        source: Box::new(VecSource::of_valid(Vec::new(), "output")),
        steps,
        sinks: vec![Box::new(sink)],
        settings: json!({"pipeline": "recovery"}),
        checkpoint_every_rows: Some(1),
        export: None,
    }
}

/// Registers every node and edge of a prepared graph.
fn register_graph(landscape: &dyn Landscape, run_id: &RunId, prepared: &PreparedPipeline) {
    for node in prepared.graph.nodes().values() {
        landscape
            .register_node(
                run_id,
                NodeRegistration {
                    node_id: Some(node.node_id.clone()),
                    plugin_name: node.plugin_name.clone(),
                    node_type: node.node_type,
                    plugin_version: node.plugin_version.clone(),
                    determinism: node.determinism,
                    config: node.config.clone(),
                    schema_mode: None,
                    schema_fields_json: None,
                    sequence_in_pipeline: None,
                },
            )
            .unwrap();
    }
    for edge in prepared.graph.edges() {
        landscape
            .register_edge(run_id, &edge.from, &edge.to, &edge.label, edge.mode)
            .unwrap();
    }
}

/// Stages a crashed run: five persisted rows, a checkpoint after row 2, run
/// left executing. Returns the landscape, clock, and run id.
fn stage_crashed_run(
    with_transform: bool,
) -> (Arc<InMemoryLandscape>, Arc<LogicalClock>, RunId) {
    let clock = Arc::new(LogicalClock::default());
    let landscape = Arc::new(InMemoryLandscape::with_payload_store(
        clock.clone(),
        Arc::new(MemoryPayloadStore::default()),
    ));
    let staging_sink = CollectingSink::new("output");
    let prepared = make_pipeline(with_transform, staging_sink).prepare().unwrap();

    let run = landscape.begin_run(&json!({"pipeline": "recovery"}), "jcs-sha256/1").unwrap();
    register_graph(landscape.as_ref(), &run.run_id, &prepared);
    for index in 0..5u64 {
        landscape
            .create_row(
                &run.run_id,
                &prepared.source_node,
                index,
                &json!({"id": index}),
                None,
            )
            .unwrap();
    }
    // The checkpoint marks row 2 as the last processed row.
    let rows = landscape.get_rows(&run.run_id).unwrap();
    let token = landscape.create_token(&rows[2].row_id, TokenSpec::default()).unwrap();
    let mut checkpoints = CheckpointManager::new(
        Arc::<InMemoryLandscape>::clone(&landscape),
        clock.clone(),
        &run.run_id,
    );
    checkpoints
        .create_checkpoint(&run.run_id, &token.token_id, &prepared.entry_node, 2, &prepared.graph, None)
        .unwrap();
    (landscape, clock, run.run_id)
}

// ============================================================================
// SECTION: Resume Replay
// ============================================================================

/// Tests resume processes exactly the rows past the checkpoint.
#[test]
fn test_resume_processes_only_unprocessed_rows() {
    let (landscape, clock, run_id) = stage_crashed_run(false);
    let sink = CollectingSink::new("output");
    let (rows, _): (SinkBuffer, _) = sink.handles();
    let orchestrator = Orchestrator::new(landscape.clone(), clock);
    let summary = orchestrator.resume(&run_id, make_pipeline(false, sink)).unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.rows_completed, 2);
    let written = rows.lock().unwrap();
    assert_eq!(written.len(), 2);
    assert_eq!(written[0].get("id"), Some(&json!(3)));
    assert_eq!(written[1].get("id"), Some(&json!(4)));

    let run = landscape.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

/// Tests the recovery manager reports exactly the rows with an index
/// strictly greater than the checkpoint sequence number.
#[test]
fn test_unprocessed_rows_strictly_greater() {
    let (landscape, _, run_id) = stage_crashed_run(false);
    let recovery = RecoveryManager::new(landscape);
    let rows = recovery.get_unprocessed_rows(&run_id).unwrap();
    let indexes: Vec<u64> = rows.iter().map(|row| row.row_index).collect();
    assert_eq!(indexes, vec![3, 4]);
}

// ============================================================================
// SECTION: Compatibility
// ============================================================================

/// Tests an identical graph is accepted.
#[test]
fn test_can_resume_identical_graph() {
    let (landscape, _, run_id) = stage_crashed_run(false);
    let prepared = make_pipeline(false, CollectingSink::new("output")).prepare().unwrap();
    let recovery = RecoveryManager::new(landscape);
    let verdict = recovery.can_resume(&run_id, &prepared.graph, &[]).unwrap();
    assert!(verdict.can_resume);
    assert!(verdict.reason.is_none());
}

/// Tests a graph with an inserted transform is refused with a reason and the
/// orchestrator writes nothing.
#[test]
fn test_topology_mismatch_refuses_resume() {
    let (landscape, clock, run_id) = stage_crashed_run(false);
    let sink = CollectingSink::new("output");
    let (rows, flushed) = sink.handles();
    let orchestrator = Orchestrator::new(landscape.clone(), clock);
    let error = orchestrator.resume(&run_id, make_pipeline(true, sink)).unwrap_err();
    assert!(matches!(error, EngineError::TopologyMismatch(_)));

    // No data written and the run is still executing, so a corrected graph
    // can still resume it.
    assert!(rows.lock().unwrap().is_empty());
    assert!(!flushed.load(std::sync::atomic::Ordering::SeqCst));
    let run = landscape.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Executing);
}

/// Tests a non-resumable sink refuses resume with a reason naming the sink.
#[test]
fn test_non_resumable_sink_refuses_resume() {
    let (landscape, _, run_id) = stage_crashed_run(false);
    let prepared = make_pipeline(false, CollectingSink::new("output")).prepare().unwrap();
    let recovery = RecoveryManager::new(landscape);
    let verdict = recovery
        .can_resume(&run_id, &prepared.graph, &[("output".to_string(), false)])
        .unwrap();
    assert!(!verdict.can_resume);
    assert!(verdict.reason.unwrap().contains("output"));
}

/// Tests a run without checkpoints cannot resume.
#[test]
fn test_no_checkpoint_refuses_resume() {
    let clock = Arc::new(LogicalClock::default());
    let landscape = Arc::new(InMemoryLandscape::new(clock));
    let run = landscape.begin_run(&json!({}), "jcs-sha256/1").unwrap();
    let prepared = make_pipeline(false, CollectingSink::new("output")).prepare().unwrap();
    let recovery = RecoveryManager::new(landscape);
    let verdict = recovery.can_resume(&run.run_id, &prepared.graph, &[]).unwrap();
    assert!(!verdict.can_resume);
    assert!(verdict.reason.unwrap().contains("no checkpoint"));
}

/// Tests checkpoints carry the current format version and both hashes.
#[test]
fn test_checkpoint_fields() {
    let (landscape, _, run_id) = stage_crashed_run(false);
    let checkpoint = landscape.get_latest_checkpoint(&run_id).unwrap().unwrap();
    assert_eq!(checkpoint.format_version, CHECKPOINT_FORMAT_VERSION);
    assert_eq!(checkpoint.sequence_number, 2);
    assert!(!checkpoint.upstream_topology_hash.is_empty());
    assert!(!checkpoint.checkpoint_node_config_hash.is_empty());
}
