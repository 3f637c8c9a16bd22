// crates/datatrail-core/src/runtime/orchestrator.rs
// ============================================================================
// Module: Datatrail Orchestrator
// Description: Run lifecycle driver from source load to sink durability.
// Purpose: Wire a prepared pipeline onto a run, drive rows through the
//          processor, enforce flush-before-checkpoint, and finalize status.
// Dependencies: crate::{core, interfaces, runtime}, serde_json, tracing
// ============================================================================

//! ## Overview
//! The orchestrator owns the run: it registers every node and edge, loads the
//! source under a `source_load` operation, drives one token per row through
//! the processor, checks aggregation timeouts before buffering each arriving
//! row, flushes remaining buffers at end-of-source, and commits pending rows
//! to sinks with `flush()` observed before any checkpoint is acknowledged.
//! Terminal run status is set exactly once; unhandled errors mark the run
//! failed and propagate.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Map;
use serde_json::Value;
use tracing::info;
use tracing::warn;

use crate::core::contract::PipelineRow;
use crate::core::contract::SchemaContract;
use crate::core::hashing::CANONICAL_VERSION;
use crate::core::identifiers::EdgeId;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;
use crate::core::outcome::OutcomeContext;
use crate::core::outcome::RowOutcome;
use crate::core::records::Artifact;
use crate::core::records::CallParent;
use crate::core::records::OperationStatus;
use crate::core::records::OperationType;
use crate::core::records::Row;
use crate::core::records::RunStatus;
use crate::core::records::TriggerType;
use crate::core::time::Clock;
use crate::interfaces::Landscape;
use crate::interfaces::NodeRegistration;
use crate::interfaces::PluginContext;
use crate::interfaces::RouteTarget;
use crate::interfaces::SinkPlugin;
use crate::interfaces::SourcePlugin;
use crate::interfaces::SourceRow;
use crate::interfaces::TokenSpec;
use crate::runtime::EngineError;
use crate::runtime::aggregation::AggregationManager;
use crate::runtime::aggregation::CoalesceManager;
use crate::runtime::call_recorder::LandscapeCallRecorder;
use crate::runtime::checkpoint::CheckpointManager;
use crate::runtime::checkpoint::RecoveryManager;
use crate::runtime::checkpoint::ResumePoint;
use crate::runtime::export::ExportReport;
use crate::runtime::export::run_export;
use crate::runtime::pipeline::PipelineConfig;
use crate::runtime::pipeline::PreparedPipeline;
use crate::runtime::processor::RowProcessor;
use crate::runtime::processor::RowResult;

// ============================================================================
// SECTION: Summaries
// ============================================================================

/// Final accounting for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: RunId,
    /// Final run status.
    pub status: RunStatus,
    /// Rows yielded by the source (valid and quarantined).
    pub rows_loaded: u64,
    /// Tokens that completed at their success sink.
    pub rows_completed: u64,
    /// Tokens routed to an error or quarantine sink.
    pub rows_routed: u64,
    /// Tokens that failed.
    pub rows_failed: u64,
    /// Rows quarantined without a sink.
    pub rows_quarantined: u64,
    /// Artifacts produced by sinks.
    pub artifacts: Vec<Artifact>,
    /// Audit export report, when an export was configured.
    pub export_report: Option<ExportReport>,
}

/// A row waiting to be written to a sink.
struct PendingWrite {
    /// Token the row belongs to.
    #[allow(dead_code, reason = "retained alongside row for future diagnostics; not read yet")]
    token_id: TokenId,
    /// The row to write.
    row: PipelineRow,
    /// Node state that produced the row, for artifact linkage.
    state_id: Option<StateId>,
}

/// Mutable run-loop counters.
#[derive(Debug, Default)]
struct Counters {
    /// Rows yielded by the source.
    rows_loaded: u64,
    /// Completed tokens.
    completed: u64,
    /// Routed tokens.
    routed: u64,
    /// Failed tokens.
    failed: u64,
    /// Quarantined rows.
    quarantined: u64,
}

// ============================================================================
// SECTION: Orchestrator
// ============================================================================

/// Drives pipeline runs against a Landscape store.
pub struct Orchestrator {
    /// Backing audit store.
    landscape: Arc<dyn Landscape>,
    /// Time source.
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(landscape: Arc<dyn Landscape>, clock: Arc<dyn Clock>) -> Self {
        Self { landscape, clock }
    }

    /// Executes a pipeline to completion.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on fatal failures; the run status is set to
    /// failed before the error propagates.
    pub fn run(&self, config: PipelineConfig) -> Result<RunSummary, EngineError> {
        let prepared = config.prepare()?;
        let run = self.landscape.begin_run(&prepared.settings, CANONICAL_VERSION)?;
        let run_id = run.run_id.clone();
        info!(run_id = %run_id, pipeline = %prepared.pipeline_name, "run started");
        match self.execute(&run_id, prepared, None) {
            Ok(summary) => Ok(summary),
            Err(error) => {
                if let Err(status_error) =
                    self.landscape.set_run_status(&run_id, RunStatus::Failed)
                {
                    warn!(run_id = %run_id, error = %status_error, "failed to mark run failed");
                }
                Err(error)
            }
        }
    }

    /// Resumes a crashed run from its latest checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TopologyMismatch`] when the checkpoint refuses
    /// the current graph, [`EngineError::ResumeUnavailable`] when payloads
    /// cannot be rehydrated, and other [`EngineError`]s on fatal failures.
    pub fn resume(
        &self,
        run_id: &RunId,
        config: PipelineConfig,
    ) -> Result<RunSummary, EngineError> {
        let prepared = config.prepare()?;
        let recovery = RecoveryManager::new(Arc::clone(&self.landscape));
        let sink_support: Vec<(String, bool)> = prepared
            .sinks
            .iter()
            .map(|(name, (_, sink))| (name.clone(), sink.supports_resume()))
            .collect();
        let compatibility = recovery.can_resume(run_id, &prepared.graph, &sink_support)?;
        if !compatibility.can_resume {
            return Err(EngineError::TopologyMismatch(
                compatibility.reason.unwrap_or_else(|| "resume refused".to_string()),
            ));
        }
        let resume_point = recovery.get_resume_point(run_id)?;
        recovery.handle_incomplete_batches(run_id)?;
        info!(
            run_id = %run_id,
            sequence = resume_point.sequence_number,
            "resuming from checkpoint"
        );
        match self.execute(run_id, prepared, Some(resume_point)) {
            Ok(summary) => Ok(summary),
            Err(error) => {
                if let Err(status_error) =
                    self.landscape.set_run_status(run_id, RunStatus::Failed)
                {
                    warn!(run_id = %run_id, error = %status_error, "failed to mark run failed");
                }
                Err(error)
            }
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Shared body of run and resume.
    #[expect(clippy::too_many_lines, reason = "One pass over the full run lifecycle.")]
    fn execute(
        &self,
        run_id: &RunId,
        prepared: PreparedPipeline,
        resume_point: Option<ResumePoint>,
    ) -> Result<RunSummary, EngineError> {
        let PreparedPipeline {
            pipeline_name: _,
            mut source,
            settings: _,
            checkpoint_every_rows,
            export,
            graph,
            source_node,
            entry_node,
            transforms,
            gates,
            aggregations,
            coalesces,
            mut sinks,
        } = prepared;

        // Register every node and edge; registration is idempotent so resume
        // re-registers cleanly.
        let order = graph.topological_order()?;
        for (sequence, node_id) in order.iter().enumerate() {
            let Some(info) = graph.node(node_id) else {
                continue;
            };
            self.landscape.register_node(
                run_id,
                NodeRegistration {
                    node_id: Some(info.node_id.clone()),
                    plugin_name: info.plugin_name.clone(),
                    node_type: info.node_type,
                    plugin_version: info.plugin_version.clone(),
                    determinism: info.determinism,
                    config: info.config.clone(),
                    schema_mode: info
                        .output_schema
                        .as_ref()
                        .map(|schema| format!("{:?}", schema.mode).to_lowercase()),
                    schema_fields_json: info
                        .output_schema
                        .as_ref()
                        .and_then(crate::runtime::pipeline::schema_fields_json),
                    sequence_in_pipeline: u32::try_from(sequence).ok(),
                },
            )?;
        }
        let mut edge_ids: BTreeMap<(NodeId, String), EdgeId> = BTreeMap::new();
        for edge in graph.edges() {
            let registered = self.landscape.register_edge(
                run_id,
                &edge.from,
                &edge.to,
                &edge.label,
                edge.mode,
            )?;
            edge_ids.insert((edge.from.clone(), edge.label.clone()), registered.edge_id);
        }

        let mut aggregation_manager = AggregationManager::new();
        for settings in aggregations {
            aggregation_manager.register(settings);
        }
        let mut coalesce_manager = CoalesceManager::new();
        for settings in coalesces {
            coalesce_manager.register(settings);
        }
        let mut processor = RowProcessor::new(
            run_id.clone(),
            Arc::clone(&self.landscape),
            Arc::clone(&self.clock),
            graph.clone(),
            transforms,
            gates,
            aggregation_manager,
            coalesce_manager,
            edge_ids,
        );
        if let Some(point) = &resume_point
            && let Some(state) = &point.aggregation_state
        {
            processor.restore_aggregation_state(state)?;
        }

        let mut checkpoints =
            CheckpointManager::new(Arc::clone(&self.landscape), Arc::clone(&self.clock), run_id);
        let mut pending: BTreeMap<String, Vec<PendingWrite>> =
            sinks.keys().map(|name| (name.clone(), Vec::new())).collect();
        let mut counters = Counters::default();
        let mut artifacts: Vec<Artifact> = Vec::new();

        // Plugin lifecycle starts.
        let detached_ctx = |node_id: &NodeId| {
            PluginContext::detached(run_id.clone(), node_id.clone(), Arc::new(Value::Null))
        };
        source.on_start(&detached_ctx(&source_node));
        for (node_id, sink) in sinks.values_mut() {
            let ctx = PluginContext::detached(run_id.clone(), node_id.clone(), Arc::new(Value::Null));
            sink.on_start(&ctx);
        }
        if resume_point.is_some() {
            for (name, (_, sink)) in &mut sinks {
                sink.configure_for_resume().map_err(|err| {
                    EngineError::ResumeUnavailable(format!(
                        "sink '{name}' could not enter resume mode: {err}"
                    ))
                })?;
                let validation = sink
                    .validate_output_target()
                    .map_err(|err| EngineError::ResumeUnavailable(err.to_string()))?;
                if !validation.matches {
                    return Err(EngineError::ResumeUnavailable(format!(
                        "sink '{name}' output target mismatch: {}",
                        validation.reason.unwrap_or_else(|| "unknown".to_string())
                    )));
                }
                if let Some(resolution) = source.get_field_resolution() {
                    sink.set_resume_field_resolution(resolution);
                }
            }
        }

        // Load rows: fresh runs drive the source; resumed runs rehydrate
        // unprocessed rows from the payload store.
        let loaded: Vec<(Row, Map<String, Value>)> = if resume_point.is_some() {
            let recovery = RecoveryManager::new(Arc::clone(&self.landscape));
            let rows = recovery.get_unprocessed_rows(run_id)?;
            let mut rehydrated = Vec::with_capacity(rows.len());
            for row in rows {
                let payload = self.landscape.load_row_payload(&row)?.ok_or_else(|| {
                    EngineError::ResumeUnavailable(format!(
                        "payload for row '{}' is unavailable; a payload store is required to \
                         resume",
                        row.row_id
                    ))
                })?;
                let Value::Object(map) = payload else {
                    return Err(EngineError::ResumeUnavailable(format!(
                        "payload for row '{}' is not an object",
                        row.row_id
                    )));
                };
                rehydrated.push((row, map));
            }
            rehydrated
        } else {
            self.load_source(
                run_id,
                &mut source,
                &source_node,
                &mut pending,
                &mut counters,
            )?
        };

        // The contract is read after load so sources that lock their
        // contract (or learn original headers) during load are reflected.
        let contract = source
            .get_schema_contract()
            .unwrap_or_else(|| source.output_schema().clone());

        // Per-row processing: timeout checks fire before the arriving row is
        // buffered, so a timed-out batch never contains it.
        let mut last_token: Option<TokenId> = None;
        for (row, map) in loaded {
            for node_id in processor.aggregation_nodes() {
                if processor.check_aggregation_timeout(&node_id)
                    && processor.aggregation_buffer_count(&node_id) > 0
                {
                    let results = processor.flush_aggregation(&node_id, TriggerType::Time)?;
                    Self::collect(results, &mut pending, &mut counters);
                }
            }
            let token = self.landscape.create_token(&row.row_id, TokenSpec::default())?;
            last_token = Some(token.token_id.clone());
            let pipeline_row = PipelineRow::new(map, contract.clone());
            let results =
                processor.process_token(token, pipeline_row, entry_node.clone(), 1)?;
            Self::collect(results, &mut pending, &mut counters);

            if let Some(frequency) = checkpoint_every_rows
                && frequency > 0
                && (row.row_index + 1) % frequency == 0
                && let Some(token_id) = &last_token
            {
                // Sinks must be durable before the checkpoint exists.
                self.commit_pending(run_id, &mut pending, &mut sinks, &mut artifacts)?;
                let state = processor.serialize_aggregation_state();
                checkpoints.create_checkpoint(
                    run_id,
                    token_id,
                    &entry_node,
                    row.row_index,
                    processor.graph(),
                    state.as_ref(),
                )?;
            }
        }

        // End of source: flush buffers and pending joins.
        let results = processor.flush_remaining_aggregations()?;
        Self::collect(results, &mut pending, &mut counters);
        let results = processor.flush_remaining_coalesces()?;
        Self::collect(results, &mut pending, &mut counters);

        self.commit_pending(run_id, &mut pending, &mut sinks, &mut artifacts)?;
        processor.shutdown();

        // Lifecycle completion.
        source.on_complete(&detached_ctx(&source_node));
        source.close();
        for (node_id, sink) in sinks.values_mut() {
            let ctx = PluginContext::detached(run_id.clone(), node_id.clone(), Arc::new(Value::Null));
            sink.on_complete(&ctx);
            sink.close();
        }

        self.landscape.set_run_status(run_id, RunStatus::Completed)?;
        info!(
            run_id = %run_id,
            rows = counters.rows_loaded,
            completed = counters.completed,
            routed = counters.routed,
            failed = counters.failed,
            "run completed"
        );

        let export_report = match export {
            Some(export_settings) => Some(run_export(
                self.landscape.as_ref(),
                self.clock.as_ref(),
                run_id,
                &export_settings,
            )?),
            None => None,
        };

        Ok(RunSummary {
            run_id: run_id.clone(),
            status: RunStatus::Completed,
            rows_loaded: counters.rows_loaded,
            rows_completed: counters.completed,
            rows_routed: counters.routed,
            rows_failed: counters.failed,
            rows_quarantined: counters.quarantined,
            artifacts,
            export_report,
        })
    }

    /// Drives the source under a `source_load` operation, creating row
    /// records and routing quarantined rows.
    fn load_source(
        &self,
        run_id: &RunId,
        source: &mut Box<dyn SourcePlugin>,
        source_node: &NodeId,
        pending: &mut BTreeMap<String, Vec<PendingWrite>>,
        counters: &mut Counters,
    ) -> Result<Vec<(Row, Map<String, Value>)>, EngineError> {
        let operation =
            self.landscape.begin_operation(run_id, source_node, OperationType::SourceLoad)?;
        let ctx = PluginContext::recording(
            run_id.clone(),
            source_node.clone(),
            Arc::new(Value::Null),
            Arc::new(LandscapeCallRecorder::new(Arc::clone(&self.landscape))),
            CallParent::Operation(operation.operation_id.clone()),
        );
        let started = self.clock.now();
        let schema_mode = format!("{:?}", source.output_schema().mode).to_lowercase();
        let mut loaded = Vec::new();
        let mut row_index: u64 = 0;
        let load_result: Result<(), EngineError> = (|| {
            let stream = source.load(&ctx)?;
            for item in stream {
                let source_row = item?;
                match source_row {
                    SourceRow::Valid(map) => {
                        let row = self.landscape.create_row(
                            run_id,
                            source_node,
                            row_index,
                            &Value::Object(map.clone()),
                            None,
                        )?;
                        loaded.push((row, map));
                    }
                    SourceRow::Quarantined { row, destination, error } => {
                        self.quarantine_row(
                            run_id,
                            source_node,
                            row_index,
                            row,
                            &destination,
                            &error,
                            &schema_mode,
                            pending,
                            counters,
                        )?;
                    }
                }
                row_index += 1;
                counters.rows_loaded += 1;
            }
            Ok(())
        })();
        let duration =
            (self.clock.now().as_unix_millis() - started.as_unix_millis()).max(0);
        #[expect(clippy::cast_precision_loss, reason = "Durations are far below 2^52 ms.")]
        let duration_ms = Some(duration as f64);
        match load_result {
            Ok(()) => {
                self.landscape.complete_operation(
                    &operation.operation_id,
                    OperationStatus::Completed,
                    duration_ms,
                    None,
                )?;
                Ok(loaded)
            }
            Err(error) => {
                self.landscape.complete_operation(
                    &operation.operation_id,
                    OperationStatus::Failed,
                    duration_ms,
                    Some(error.to_string()),
                )?;
                Err(error)
            }
        }
    }

    /// Records a quarantined source row and routes it per configuration.
    #[expect(clippy::too_many_arguments, reason = "Quarantine context is inherently wide.")]
    fn quarantine_row(
        &self,
        run_id: &RunId,
        source_node: &NodeId,
        row_index: u64,
        row_value: Value,
        destination: &RouteTarget,
        error: &str,
        schema_mode: &str,
        pending: &mut BTreeMap<String, Vec<PendingWrite>>,
        counters: &mut Counters,
    ) -> Result<(), EngineError> {
        let row = self.landscape.create_row(run_id, source_node, row_index, &row_value, None)?;
        let destination_label = match destination {
            RouteTarget::Sink(name) => name.clone(),
            RouteTarget::Discard => "discard".to_string(),
        };
        self.landscape.record_validation_error(
            run_id,
            Some(source_node),
            &row_value,
            error,
            schema_mode,
            &destination_label,
        )?;
        let token = self.landscape.create_token(&row.row_id, TokenSpec::default())?;
        match destination {
            RouteTarget::Sink(sink_name) => {
                self.landscape.record_token_outcome(
                    run_id,
                    &token.token_id,
                    &OutcomeContext::Routed { sink_name: sink_name.clone() },
                    None,
                )?;
                counters.routed += 1;
                let map = match row_value {
                    Value::Object(map) => map,
                    other => {
                        let mut wrapped = Map::new();
                        wrapped.insert("raw".to_string(), other);
                        wrapped
                    }
                };
                if let Some(queue) = pending.get_mut(sink_name) {
                    queue.push(PendingWrite {
                        token_id: token.token_id,
                        row: PipelineRow::new(map, SchemaContract::free()),
                        state_id: None,
                    });
                }
            }
            RouteTarget::Discard => {
                self.landscape.record_token_outcome(
                    run_id,
                    &token.token_id,
                    &OutcomeContext::Quarantined,
                    None,
                )?;
                counters.quarantined += 1;
            }
        }
        Ok(())
    }

    /// Folds processor results into pending sink writes and counters.
    fn collect(
        results: Vec<RowResult>,
        pending: &mut BTreeMap<String, Vec<PendingWrite>>,
        counters: &mut Counters,
    ) {
        for result in results {
            match result.outcome {
                RowOutcome::Completed => counters.completed += 1,
                RowOutcome::Routed => counters.routed += 1,
                RowOutcome::Failed => counters.failed += 1,
                RowOutcome::Quarantined => counters.quarantined += 1,
                RowOutcome::Coalesced
                | RowOutcome::Forked
                | RowOutcome::Expanded
                | RowOutcome::Buffered
                | RowOutcome::ConsumedInBatch => {}
            }
            if let (Some(sink_name), Some(row)) = (result.sink_name, result.row)
                && let Some(queue) = pending.get_mut(&sink_name)
            {
                queue.push(PendingWrite {
                    token_id: result.token.token_id,
                    row,
                    state_id: result.state_id,
                });
            }
        }
    }

    /// Writes pending rows to their sinks and observes `flush()` before
    /// returning; called at checkpoint boundaries and end-of-run.
    fn commit_pending(
        &self,
        run_id: &RunId,
        pending: &mut BTreeMap<String, Vec<PendingWrite>>,
        sinks: &mut BTreeMap<String, (NodeId, Box<dyn SinkPlugin>)>,
        artifacts: &mut Vec<Artifact>,
    ) -> Result<(), EngineError> {
        for (sink_name, queue) in pending.iter_mut() {
            if queue.is_empty() {
                continue;
            }
            let Some((sink_node, sink)) = sinks.get_mut(sink_name) else {
                return Err(EngineError::OrchestrationInvariant(format!(
                    "pending rows for unconfigured sink '{sink_name}'"
                )));
            };
            let operation =
                self.landscape.begin_operation(run_id, sink_node, OperationType::SinkWrite)?;
            let ctx = PluginContext::recording(
                run_id.clone(),
                sink_node.clone(),
                Arc::new(Value::Null),
                Arc::new(LandscapeCallRecorder::new(Arc::clone(&self.landscape))),
                CallParent::Operation(operation.operation_id.clone()),
            );
            let writes: Vec<PendingWrite> = std::mem::take(queue);
            let rows: Vec<PipelineRow> = writes.iter().map(|write| write.row.clone()).collect();
            let write_result = sink.write(&rows, &ctx);
            match write_result {
                Ok(descriptor) => {
                    let artifact = self.landscape.record_artifact(
                        run_id,
                        sink_node,
                        writes.iter().find_map(|write| write.state_id.clone()),
                        &descriptor,
                    )?;
                    artifacts.push(artifact);
                    sink.flush().map_err(|err| {
                        EngineError::Durability {
                            sink: sink_name.clone(),
                            message: err.to_string(),
                        }
                    })?;
                    self.landscape.complete_operation(
                        &operation.operation_id,
                        OperationStatus::Completed,
                        None,
                        None,
                    )?;
                }
                Err(error) => {
                    self.landscape.complete_operation(
                        &operation.operation_id,
                        OperationStatus::Failed,
                        None,
                        Some(error.to_string()),
                    )?;
                    return Err(EngineError::SinkWrite {
                        sink: sink_name.clone(),
                        message: error.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
