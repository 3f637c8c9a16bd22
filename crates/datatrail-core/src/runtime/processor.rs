// crates/datatrail-core/src/runtime/processor.rs
// ============================================================================
// Module: Datatrail Row Processor
// Description: Per-token execution state machine over the execution graph.
// Purpose: Drive each token through transforms, gates, aggregations,
//          coalesces, and sinks, recording every transition in the Landscape.
// Dependencies: crate::{core, interfaces, runtime}, serde_json
// ============================================================================

//! ## Overview
//! The processor is the single canonical execution path for tokens. It works
//! a queue of (token, row, node) items: transforms run and propagate
//! contracts, gates evaluate compiled rules and record routing events,
//! aggregations buffer and flush batches, coalesces join branches, and sinks
//! terminate tokens. Every state transition lands in the Landscape store
//! before the next item is taken; nothing here swallows unknown errors.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Map;
use serde_json::Value;

use crate::core::contract::PipelineRow;
use crate::core::contract::SchemaContract;
use crate::core::hashing::DEFAULT_HASH_ALGORITHM;
use crate::core::hashing::hash_canonical_json;
use crate::core::identifiers::BatchId;
use crate::core::identifiers::EdgeId;
use crate::core::identifiers::GroupId;
use crate::core::identifiers::IdGenerator;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::outcome::OutcomeContext;
use crate::core::outcome::RowOutcome;
use crate::core::records::BatchOutputType;
use crate::core::records::BatchStatus;
use crate::core::records::CallParent;
use crate::core::records::NodeType;
use crate::core::records::RoutingMode;
use crate::core::records::Token;
use crate::core::records::TriggerType;
use crate::core::state::NodeStateOpen;
use crate::core::time::Clock;
use crate::core::time::Timestamp;
use crate::interfaces::CompletionRequest;
use crate::interfaces::Landscape;
use crate::interfaces::PluginContext;
use crate::interfaces::RouteTarget;
use crate::interfaces::TokenSpec;
use crate::interfaces::TransformPlugin;
use crate::interfaces::TransformResult;
use crate::runtime::EngineError;
use crate::runtime::adapter::AdapterConfig;
use crate::runtime::adapter::AdapterError;
use crate::runtime::adapter::BatchAdapter;
use crate::runtime::adapter::MutexWorker;
use crate::runtime::aggregation::AggregationManager;
use crate::runtime::aggregation::ArrivalDisposition;
use crate::runtime::aggregation::BufferedRow;
use crate::runtime::aggregation::BranchArrival;
use crate::runtime::aggregation::CoalesceManager;
use crate::runtime::aggregation::CoalesceSettings;
use crate::runtime::aggregation::CoalescePolicy;
use crate::runtime::aggregation::OutputMode;
use crate::runtime::call_recorder::LandscapeCallRecorder;
use crate::runtime::graph::ExecutionGraph;
use crate::runtime::pipeline::CompiledGate;
use crate::runtime::pipeline::CONTINUE_LABEL;
use crate::runtime::pipeline::NO_MATCH_LABEL;

// ============================================================================
// SECTION: Results
// ============================================================================

/// Outcome of driving one token (or one of its descendants) to a recorded
/// state.
#[derive(Debug, Clone)]
pub struct RowResult {
    /// The token the result describes.
    pub token: Token,
    /// The recorded outcome kind.
    pub outcome: RowOutcome,
    /// Destination sink for Completed/Routed results.
    pub sink_name: Option<String>,
    /// Final row for sink-bound results.
    pub row: Option<PipelineRow>,
    /// Node state that produced the result, for artifact linkage.
    pub state_id: Option<StateId>,
}

/// Per-row wait budget for adapter-pooled transforms, in milliseconds.
const ADAPTER_ROW_TIMEOUT_MS: u64 = 300_000;

/// Routing metadata captured from a transform before its result is applied.
#[derive(Debug, Clone)]
struct TransformMeta {
    /// Whether the transform adds fields to its input contract.
    adds_fields: bool,
    /// Whether `success_multi` may create new tokens.
    creates_tokens: bool,
    /// Destination for rejected rows.
    on_error: RouteTarget,
    /// Explicit output contract, when the transform reshapes schemas.
    mapped_contract: Option<SchemaContract>,
}

/// One queued unit of work.
struct WorkItem {
    /// The token being driven.
    token: Token,
    /// The token's current row.
    row: PipelineRow,
    /// Node to execute next.
    node_id: NodeId,
    /// Step index of that node on the token's path.
    step: u32,
    /// Label of the edge the token arrived on, when not the default.
    via_label: Option<String>,
}

// ============================================================================
// SECTION: Processor
// ============================================================================

/// Per-token execution state machine.
pub struct RowProcessor {
    /// Run being executed.
    run_id: RunId,
    /// Landscape store recording every transition.
    landscape: Arc<dyn Landscape>,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// The validated execution graph.
    graph: ExecutionGraph,
    /// Transforms keyed by node id (aggregation batch transforms included).
    transforms: BTreeMap<NodeId, Box<dyn TransformPlugin>>,
    /// Compiled gates keyed by node id.
    gates: BTreeMap<NodeId, CompiledGate>,
    /// Aggregation buffers.
    aggregations: AggregationManager,
    /// Coalesce join bookkeeping.
    coalesces: CoalesceManager,
    /// Registered edge ids keyed by (from node, label).
    edge_ids: BTreeMap<(NodeId, String), EdgeId>,
    /// Concurrency adapters for batch-aware transforms at transform nodes.
    adapters: BTreeMap<NodeId, BatchAdapter>,
    /// Routing metadata for transforms that moved into an adapter.
    adapter_meta: BTreeMap<NodeId, TransformMeta>,
    /// Group id generator for fork/join/expand groups.
    groups: IdGenerator,
}

impl RowProcessor {
    /// Creates a processor over prepared pipeline parts.
    #[expect(clippy::too_many_arguments, reason = "Wired once by the orchestrator.")]
    #[must_use]
    pub fn new(
        run_id: RunId,
        landscape: Arc<dyn Landscape>,
        clock: Arc<dyn Clock>,
        graph: ExecutionGraph,
        transforms: BTreeMap<NodeId, Box<dyn TransformPlugin>>,
        gates: BTreeMap<NodeId, CompiledGate>,
        aggregations: AggregationManager,
        coalesces: CoalesceManager,
        edge_ids: BTreeMap<(NodeId, String), EdgeId>,
    ) -> Self {
        let groups = IdGenerator::new(format!("{run_id}/groups"));
        Self {
            run_id,
            landscape,
            clock,
            graph,
            transforms,
            gates,
            aggregations,
            coalesces,
            edge_ids,
            adapters: BTreeMap::new(),
            adapter_meta: BTreeMap::new(),
            groups,
        }
    }

    /// Drains and joins every adapter's worker pool.
    pub fn shutdown(&mut self) {
        let adapters = std::mem::take(&mut self.adapters);
        for (_, adapter) in adapters {
            adapter.shutdown_batch_processing();
        }
    }

    /// Returns the execution graph.
    #[must_use]
    pub const fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    /// Drives a token from the given node until every descendant work item
    /// reaches a recorded state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for fatal failures; routed and failed rows are
    /// results, not errors.
    pub fn process_token(
        &mut self,
        token: Token,
        row: PipelineRow,
        node_id: NodeId,
        step: u32,
    ) -> Result<Vec<RowResult>, EngineError> {
        let branch = token.branch_name.clone();
        let queue = VecDeque::from([WorkItem { token, row, node_id, step, via_label: branch }]);
        self.drive(queue)
    }

    /// Reports whether an aggregation's time trigger has expired.
    #[must_use]
    pub fn check_aggregation_timeout(&self, node_id: &NodeId) -> bool {
        self.aggregations.timeout_expired(node_id, self.clock.now())
    }

    /// Returns the buffered row count for an aggregation node.
    #[must_use]
    pub fn aggregation_buffer_count(&self, node_id: &NodeId) -> usize {
        self.aggregations.buffer_count(node_id)
    }

    /// Returns all registered aggregation node ids.
    #[must_use]
    pub fn aggregation_nodes(&self) -> Vec<NodeId> {
        self.aggregations.node_ids()
    }

    /// Serializes non-empty aggregation buffers for checkpointing.
    #[must_use]
    pub fn serialize_aggregation_state(&self) -> Option<Value> {
        self.aggregations.serialize_state()
    }

    /// Restores aggregation buffers from checkpoint state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Aggregation`] when the blob is invalid.
    pub fn restore_aggregation_state(&mut self, state: &Value) -> Result<(), EngineError> {
        self.aggregations.restore_state(state)?;
        Ok(())
    }

    /// Flushes one aggregation's buffer with the given trigger.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for fatal failures.
    pub fn flush_aggregation(
        &mut self,
        node_id: &NodeId,
        trigger: TriggerType,
    ) -> Result<Vec<RowResult>, EngineError> {
        let mut queue = VecDeque::new();
        let mut results = Vec::new();
        self.flush_aggregation_into(node_id, trigger, &mut queue, &mut results)?;
        let mut driven = self.drive(queue)?;
        results.append(&mut driven);
        Ok(results)
    }

    /// Flushes every non-empty aggregation buffer at end-of-source.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for fatal failures.
    pub fn flush_remaining_aggregations(&mut self) -> Result<Vec<RowResult>, EngineError> {
        let mut results = Vec::new();
        for node_id in self.aggregations.node_ids() {
            if self.aggregations.buffer_count(&node_id) == 0 {
                continue;
            }
            let mut flushed = self.flush_aggregation(&node_id, TriggerType::EndOfSource)?;
            results.append(&mut flushed);
        }
        Ok(results)
    }

    /// Fires pending coalesce joins at end-of-source.
    ///
    /// Best-effort joins merge whatever arrived; joins whose policy could not
    /// be satisfied fail their waiting tokens.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for fatal failures.
    pub fn flush_remaining_coalesces(&mut self) -> Result<Vec<RowResult>, EngineError> {
        let mut queue = VecDeque::new();
        let mut results = Vec::new();
        let node_ids: Vec<NodeId> = self.coalesces.node_ids();
        for node_id in node_ids {
            let Some(settings) = self.coalesces.settings(&node_id).cloned() else {
                continue;
            };
            let pending = self.coalesces.drain_node(&node_id);
            for (row_id, arrivals) in pending {
                let satisfiable = match &settings.policy {
                    CoalescePolicy::BestEffort => true,
                    CoalescePolicy::Quorum(quorum) => arrivals.len() >= *quorum,
                    CoalescePolicy::RequireAll => {
                        arrivals.len() >= settings.expected_branches.len()
                    }
                    CoalescePolicy::First => !arrivals.is_empty(),
                };
                if satisfiable {
                    self.join_arrivals(&settings, &row_id, arrivals, &mut queue, &mut results)?;
                } else {
                    for arrival in arrivals {
                        let error = serde_json::json!({
                            "error": "coalesce policy unsatisfied at end of source",
                            "coalesce": settings.name,
                            "branch": arrival.branch,
                        });
                        let error_hash =
                            hash_canonical_json(DEFAULT_HASH_ALGORITHM, &error)?.value;
                        self.landscape.record_token_outcome(
                            &self.run_id,
                            &arrival.token.token_id,
                            &OutcomeContext::Failed { error_hash: Some(error_hash) },
                            Some(error.to_string()),
                        )?;
                        results.push(RowResult {
                            token: arrival.token,
                            outcome: RowOutcome::Failed,
                            sink_name: None,
                            row: None,
                            state_id: None,
                        });
                    }
                }
            }
        }
        let mut driven = self.drive(queue)?;
        results.append(&mut driven);
        Ok(results)
    }

    // ------------------------------------------------------------------
    // Work loop
    // ------------------------------------------------------------------

    /// Works the queue until empty, collecting recorded results.
    fn drive(&mut self, mut queue: VecDeque<WorkItem>) -> Result<Vec<RowResult>, EngineError> {
        let mut results = Vec::new();
        while let Some(item) = queue.pop_front() {
            let node_type = self
                .graph
                .node(&item.node_id)
                .ok_or_else(|| {
                    EngineError::OrchestrationInvariant(format!(
                        "work item references unknown node '{}'",
                        item.node_id
                    ))
                })?
                .node_type;
            match node_type {
                NodeType::Transform => self.run_transform(item, &mut queue, &mut results)?,
                NodeType::Gate => self.run_gate(item, &mut queue, &mut results)?,
                NodeType::Aggregation => {
                    self.buffer_at_aggregation(item, &mut queue, &mut results)?;
                }
                NodeType::Coalesce => self.arrive_at_coalesce(item, &mut queue, &mut results)?,
                NodeType::Sink => self.finish_at_sink(item, &mut results)?,
                NodeType::Source => {
                    return Err(EngineError::OrchestrationInvariant(
                        "a token cannot be driven into a source node".to_string(),
                    ));
                }
            }
        }
        Ok(results)
    }

    /// Elapsed milliseconds between two timestamps.
    #[expect(clippy::cast_precision_loss, reason = "Durations are far below 2^52 ms.")]
    fn elapsed_ms(started: Timestamp, finished: Timestamp) -> f64 {
        (finished.as_unix_millis() - started.as_unix_millis()).max(0) as f64
    }

    /// Builds a recording plugin context scoped to a node state.
    fn recording_ctx(&self, node_id: &NodeId, state: &NodeStateOpen) -> PluginContext {
        let config = self
            .graph
            .node(node_id)
            .map_or(Value::Null, |node| node.config.clone());
        PluginContext::recording(
            self.run_id.clone(),
            node_id.clone(),
            Arc::new(config),
            Arc::new(LandscapeCallRecorder::new(Arc::clone(&self.landscape))),
            CallParent::State(state.head.state_id.clone()),
        )
    }

    // ------------------------------------------------------------------
    // Transforms
    // ------------------------------------------------------------------

    /// Runs a single-row transform for one token.
    fn run_transform(
        &mut self,
        item: WorkItem,
        queue: &mut VecDeque<WorkItem>,
        results: &mut Vec<RowResult>,
    ) -> Result<(), EngineError> {
        let state = self.landscape.begin_node_state(
            &item.token.token_id,
            &item.node_id,
            item.step,
            &item.row.to_value(),
            1,
        )?;
        let ctx = self.recording_ctx(&item.node_id, &state);
        let started = self.clock.now();
        let batch_aware = self.adapters.contains_key(&item.node_id)
            || self
                .transforms
                .get(&item.node_id)
                .is_some_and(|transform| transform.is_batch_aware());
        let (result, meta) = if batch_aware {
            // Batch-aware transforms at a transform node run through the
            // concurrency adapter; the orchestrator still observes one
            // result at a time, in submission order.
            self.process_via_adapter(&item)?
        } else {
            let transform = self.transforms.get_mut(&item.node_id).ok_or_else(|| {
                EngineError::OrchestrationInvariant(format!(
                    "no transform registered for node '{}'",
                    item.node_id
                ))
            })?;
            let result = transform.process(item.row.clone(), &ctx);
            let meta = TransformMeta {
                adds_fields: transform.transform_adds_fields(),
                creates_tokens: transform.creates_tokens(),
                on_error: transform.on_error().clone(),
                mapped_contract: transform.map_contract(item.row.contract()),
            };
            (result, meta)
        };
        let TransformMeta { adds_fields, creates_tokens, on_error, mapped_contract } = meta;
        let duration_ms = Self::elapsed_ms(started, self.clock.now());
        match result {
            TransformResult::Error(failure) => {
                let error_value = serde_json::json!({
                    "reason": failure.reason,
                    "kind": failure.kind,
                    "retryable": failure.retryable,
                });
                self.landscape.complete_node_state(
                    &state.head.state_id,
                    CompletionRequest::Failed { error: Some(error_value.clone()), partial_output: None },
                    duration_ms,
                )?;
                self.route_failed_row(
                    &item,
                    &on_error,
                    &error_value,
                    Some(state.head.state_id),
                    results,
                )?;
            }
            TransformResult::Success { row: output, success_reason } => {
                self.landscape.complete_node_state(
                    &state.head.state_id,
                    CompletionRequest::Completed {
                        output: Value::Object(output.clone()),
                        success_reason,
                    },
                    duration_ms,
                )?;
                let contract = mapped_contract.unwrap_or_else(|| {
                    item.row.contract().propagate(&output, adds_fields)
                });
                let next_row = PipelineRow::new(output, contract);
                self.advance(
                    item.token,
                    next_row,
                    &item.node_id,
                    item.step,
                    Some(state.head.state_id),
                    queue,
                    results,
                )?;
            }
            TransformResult::SuccessMulti { rows } => {
                if !creates_tokens {
                    return Err(EngineError::OrchestrationInvariant(format!(
                        "transform at '{}' returned multiple rows without creates_tokens",
                        item.node_id
                    )));
                }
                self.landscape.complete_node_state(
                    &state.head.state_id,
                    CompletionRequest::Completed {
                        output: Value::Array(rows.iter().cloned().map(Value::Object).collect()),
                        success_reason: None,
                    },
                    duration_ms,
                )?;
                self.expand_rows(&item, rows, adds_fields, queue, results)?;
            }
        }
        Ok(())
    }

    /// Submits a row to the node's adapter and waits for its FIFO result.
    ///
    /// The transform moves into the adapter's worker on first use; a timed
    /// out submission is evicted so the queue drains, and the row fails with
    /// a timeout error.
    fn process_via_adapter(
        &mut self,
        item: &WorkItem,
    ) -> Result<(TransformResult, TransformMeta), EngineError> {
        if !self.adapters.contains_key(&item.node_id) {
            let transform = self.transforms.remove(&item.node_id).ok_or_else(|| {
                EngineError::OrchestrationInvariant(format!(
                    "no transform registered for node '{}'",
                    item.node_id
                ))
            })?;
            let meta = TransformMeta {
                adds_fields: transform.transform_adds_fields(),
                creates_tokens: transform.creates_tokens(),
                on_error: transform.on_error().clone(),
                mapped_contract: None,
            };
            // Worker threads cannot append to a token-scoped call parent;
            // pooled transforms record their calls through their own clients.
            let worker_ctx = PluginContext::detached(
                self.run_id.clone(),
                item.node_id.clone(),
                Arc::new(
                    self.graph
                        .node(&item.node_id)
                        .map_or(Value::Null, |node| node.config.clone()),
                ),
            );
            self.adapter_meta.insert(item.node_id.clone(), meta);
            self.adapters.insert(
                item.node_id.clone(),
                BatchAdapter::start(
                    AdapterConfig::default(),
                    Arc::new(MutexWorker::new(transform, worker_ctx)),
                ),
            );
        }
        let meta = self.adapter_meta.get(&item.node_id).cloned().ok_or_else(|| {
            EngineError::OrchestrationInvariant("adapter metadata missing".to_string())
        })?;
        let adapter = self.adapters.get(&item.node_id).ok_or_else(|| {
            EngineError::OrchestrationInvariant("adapter missing after creation".to_string())
        })?;
        adapter
            .accept(item.token.token_id.clone(), item.row.clone())
            .map_err(|err| EngineError::OrchestrationInvariant(err.to_string()))?;
        match adapter.wait(
            &item.token.token_id,
            std::time::Duration::from_millis(ADAPTER_ROW_TIMEOUT_MS),
        ) {
            Ok(result) => Ok((result, meta)),
            Err(AdapterError::Timeout(token_id)) => {
                adapter
                    .evict_submission(&token_id)
                    .map_err(|err| EngineError::OrchestrationInvariant(err.to_string()))?;
                Ok((
                    TransformResult::timeout(serde_json::json!({
                        "error": "row processing timed out in the adapter",
                        "timeout_ms": ADAPTER_ROW_TIMEOUT_MS,
                    })),
                    meta,
                ))
            }
            Err(err) => Err(EngineError::OrchestrationInvariant(err.to_string())),
        }
    }

    /// Routes a failed row to its on-error destination.
    fn route_failed_row(
        &mut self,
        item: &WorkItem,
        on_error: &RouteTarget,
        error_value: &Value,
        state_id: Option<StateId>,
        results: &mut Vec<RowResult>,
    ) -> Result<(), EngineError> {
        let destination = match on_error {
            RouteTarget::Sink(sink) => sink.clone(),
            RouteTarget::Discard => "discard".to_string(),
        };
        self.landscape.record_transform_error(
            &self.run_id,
            &item.token.token_id,
            &item.node_id,
            &item.row.to_value(),
            &destination,
            Some(error_value),
        )?;
        match on_error {
            RouteTarget::Sink(sink) => {
                self.landscape.record_token_outcome(
                    &self.run_id,
                    &item.token.token_id,
                    &OutcomeContext::Routed { sink_name: sink.clone() },
                    None,
                )?;
                results.push(RowResult {
                    token: item.token.clone(),
                    outcome: RowOutcome::Routed,
                    sink_name: Some(sink.clone()),
                    row: Some(item.row.clone()),
                    state_id,
                });
            }
            RouteTarget::Discard => {
                let error_hash = hash_canonical_json(DEFAULT_HASH_ALGORITHM, error_value)?.value;
                self.landscape.record_token_outcome(
                    &self.run_id,
                    &item.token.token_id,
                    &OutcomeContext::Failed { error_hash: Some(error_hash) },
                    Some(error_value.to_string()),
                )?;
                results.push(RowResult {
                    token: item.token.clone(),
                    outcome: RowOutcome::Failed,
                    sink_name: None,
                    row: None,
                    state_id,
                });
            }
        }
        Ok(())
    }

    /// Expands a multi-row result into child tokens.
    fn expand_rows(
        &mut self,
        item: &WorkItem,
        rows: Vec<Map<String, Value>>,
        adds_fields: bool,
        queue: &mut VecDeque<WorkItem>,
        results: &mut Vec<RowResult>,
    ) -> Result<(), EngineError> {
        let expand_group = GroupId::new(self.groups.next_id("expand"));
        let branches: Vec<String> =
            (0..rows.len()).map(|index| format!("expand_{index}")).collect();
        self.landscape.record_token_outcome(
            &self.run_id,
            &item.token.token_id,
            &OutcomeContext::Expanded {
                expand_group_id: expand_group.clone(),
                expected_branches: branches.clone(),
            },
            None,
        )?;
        results.push(RowResult {
            token: item.token.clone(),
            outcome: RowOutcome::Expanded,
            sink_name: None,
            row: None,
            state_id: None,
        });
        for (index, output) in rows.into_iter().enumerate() {
            let child = self.landscape.create_token(
                &item.token.row_id,
                TokenSpec {
                    token_id: None,
                    parents: vec![item.token.token_id.clone()],
                    fork_group_id: None,
                    join_group_id: None,
                    expand_group_id: Some(expand_group.clone()),
                    branch_name: Some(branches[index].clone()),
                    step_in_pipeline: Some(item.step + 1),
                },
            )?;
            let contract = item.row.contract().propagate(&output, adds_fields);
            let child_row = PipelineRow::new(output, contract);
            self.push_continuations(child, child_row, &item.node_id, item.step, queue, results)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Gates
    // ------------------------------------------------------------------

    /// Evaluates a gate's rules for one token and routes accordingly.
    fn run_gate(
        &mut self,
        item: WorkItem,
        queue: &mut VecDeque<WorkItem>,
        results: &mut Vec<RowResult>,
    ) -> Result<(), EngineError> {
        let state = self.landscape.begin_node_state(
            &item.token.token_id,
            &item.node_id,
            item.step,
            &item.row.to_value(),
            1,
        )?;
        let started = self.clock.now();
        let gate = self.gates.get(&item.node_id).ok_or_else(|| {
            EngineError::OrchestrationInvariant(format!(
                "no gate registered for node '{}'",
                item.node_id
            ))
        })?;
        let mode = gate.default_mode;
        let mut selected: Vec<(String, String)> = Vec::new();
        let mut eval_error: Option<Value> = None;
        for (label, condition) in &gate.rules {
            match condition.evaluate_bool(item.row.data()) {
                Ok(true) => {
                    selected.push((label.clone(), condition.source().to_string()));
                    if mode == RoutingMode::Move {
                        break;
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    eval_error = Some(serde_json::json!({
                        "error": err.to_string(),
                        "rule": label,
                        "condition": condition.source(),
                    }));
                    break;
                }
            }
        }
        let on_no_match = gate.on_no_match.clone();
        let duration_ms = Self::elapsed_ms(started, self.clock.now());

        if let Some(error_value) = eval_error {
            self.landscape.complete_node_state(
                &state.head.state_id,
                CompletionRequest::Failed { error: Some(error_value.clone()), partial_output: None },
                duration_ms,
            )?;
            let on_error = on_no_match.unwrap_or(RouteTarget::Discard);
            self.route_failed_row(&item, &on_error, &error_value, Some(state.head.state_id), results)?;
            return Ok(());
        }

        self.landscape.complete_node_state(
            &state.head.state_id,
            CompletionRequest::Completed { output: item.row.to_value(), success_reason: None },
            duration_ms,
        )?;

        if selected.is_empty() {
            return self.route_no_match(item, &state.head.state_id, on_no_match, queue, results);
        }

        let routing_group = GroupId::new(self.groups.next_id("route"));
        for (ordinal, (label, condition)) in selected.iter().enumerate() {
            let edge_id = self.edge_id(&item.node_id, label)?;
            let reason = serde_json::json!({ "rule": label, "condition": condition });
            self.landscape.record_routing_event(
                &state.head.state_id,
                &edge_id,
                &routing_group,
                u32::try_from(ordinal).unwrap_or(u32::MAX),
                mode,
                Some(&reason),
            )?;
        }

        if selected.len() == 1 {
            let (label, _) = &selected[0];
            let edge = self.graph.outgoing_labeled(&item.node_id, label).ok_or_else(|| {
                EngineError::OrchestrationInvariant(format!(
                    "gate '{}' has no edge labeled '{label}'",
                    item.node_id
                ))
            })?;
            queue.push_back(WorkItem {
                token: item.token,
                row: item.row,
                node_id: edge.to.clone(),
                step: item.step + 1,
                via_label: Some(label.clone()),
            });
            return Ok(());
        }

        // COPY gates fork one child per selected edge.
        let fork_group = GroupId::new(self.groups.next_id("fork"));
        let labels: Vec<String> = selected.iter().map(|(label, _)| label.clone()).collect();
        self.landscape.record_token_outcome(
            &self.run_id,
            &item.token.token_id,
            &OutcomeContext::Forked {
                fork_group_id: fork_group.clone(),
                expected_branches: labels.clone(),
            },
            None,
        )?;
        results.push(RowResult {
            token: item.token.clone(),
            outcome: RowOutcome::Forked,
            sink_name: None,
            row: None,
            state_id: Some(state.head.state_id.clone()),
        });
        for label in labels {
            let edge = self.graph.outgoing_labeled(&item.node_id, &label).ok_or_else(|| {
                EngineError::OrchestrationInvariant(format!(
                    "gate '{}' has no edge labeled '{label}'",
                    item.node_id
                ))
            })?;
            let child = self.landscape.create_token(
                &item.token.row_id,
                TokenSpec {
                    token_id: None,
                    parents: vec![item.token.token_id.clone()],
                    fork_group_id: Some(fork_group.clone()),
                    join_group_id: None,
                    expand_group_id: None,
                    branch_name: Some(label.clone()),
                    step_in_pipeline: Some(item.step + 1),
                },
            )?;
            queue.push_back(WorkItem {
                token: child,
                row: item.row.clone(),
                node_id: edge.to.clone(),
                step: item.step + 1,
                via_label: Some(label),
            });
        }
        Ok(())
    }

    /// Handles a gate pass in which no rule matched.
    fn route_no_match(
        &mut self,
        item: WorkItem,
        state_id: &StateId,
        on_no_match: Option<RouteTarget>,
        queue: &mut VecDeque<WorkItem>,
        results: &mut Vec<RowResult>,
    ) -> Result<(), EngineError> {
        match on_no_match {
            Some(RouteTarget::Sink(_)) => {
                let edge_id = self.edge_id(&item.node_id, NO_MATCH_LABEL)?;
                let edge =
                    self.graph.outgoing_labeled(&item.node_id, NO_MATCH_LABEL).ok_or_else(|| {
                        EngineError::OrchestrationInvariant(format!(
                            "gate '{}' has no no-match edge",
                            item.node_id
                        ))
                    })?;
                let routing_group = GroupId::new(self.groups.next_id("route"));
                let reason = serde_json::json!({ "rule": NO_MATCH_LABEL });
                self.landscape.record_routing_event(
                    state_id,
                    &edge_id,
                    &routing_group,
                    0,
                    RoutingMode::Move,
                    Some(&reason),
                )?;
                queue.push_back(WorkItem {
                    token: item.token,
                    row: item.row,
                    node_id: edge.to.clone(),
                    step: item.step + 1,
                    via_label: Some(NO_MATCH_LABEL.to_string()),
                });
            }
            Some(RouteTarget::Discard) | None => {
                self.landscape.record_token_outcome(
                    &self.run_id,
                    &item.token.token_id,
                    &OutcomeContext::Failed { error_hash: None },
                    Some(
                        serde_json::json!({ "error": "no gate rule matched" }).to_string(),
                    ),
                )?;
                results.push(RowResult {
                    token: item.token,
                    outcome: RowOutcome::Failed,
                    sink_name: None,
                    row: None,
                    state_id: Some(state_id.clone()),
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Aggregation
    // ------------------------------------------------------------------

    /// Buffers a token at an aggregation node, flushing on a count trigger.
    fn buffer_at_aggregation(
        &mut self,
        item: WorkItem,
        queue: &mut VecDeque<WorkItem>,
        results: &mut Vec<RowResult>,
    ) -> Result<(), EngineError> {
        if self.aggregations.batch_id(&item.node_id).is_none() {
            let batch = self.landscape.create_batch(&self.run_id, &item.node_id)?;
            self.aggregations.assign_batch(&item.node_id, batch.batch_id)?;
        }
        let batch_id = self
            .aggregations
            .batch_id(&item.node_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::OrchestrationInvariant("aggregation lost its draft batch".to_string())
            })?;
        let action = self.aggregations.buffer_row(
            &item.node_id,
            item.token.clone(),
            item.row.clone(),
            item.step,
            self.clock.now(),
        )?;
        self.landscape.add_batch_member(&batch_id, &item.token.token_id, action.ordinal)?;
        self.landscape.record_token_outcome(
            &self.run_id,
            &item.token.token_id,
            &OutcomeContext::Buffered { batch_id: batch_id.clone() },
            None,
        )?;
        results.push(RowResult {
            token: item.token,
            outcome: RowOutcome::Buffered,
            sink_name: None,
            row: None,
            state_id: None,
        });
        if action.count_fired {
            self.flush_aggregation_into(&item.node_id, TriggerType::Count, queue, results)?;
        }
        Ok(())
    }

    /// Flushes one aggregation buffer, pushing continuations onto the queue.
    #[expect(clippy::too_many_lines, reason = "One flush covers all three output modes.")]
    fn flush_aggregation_into(
        &mut self,
        node_id: &NodeId,
        trigger: TriggerType,
        queue: &mut VecDeque<WorkItem>,
        results: &mut Vec<RowResult>,
    ) -> Result<(), EngineError> {
        let (entries, batch_id) = self.aggregations.take_buffer(node_id)?;
        if entries.is_empty() {
            return Ok(());
        }
        let batch_id = batch_id.ok_or_else(|| {
            EngineError::OrchestrationInvariant(
                "aggregation buffer has entries but no draft batch".to_string(),
            )
        })?;
        let settings = self
            .aggregations
            .settings(node_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::OrchestrationInvariant(format!(
                    "no aggregation settings for node '{node_id}'"
                ))
            })?;
        self.landscape.update_batch_status(&batch_id, BatchStatus::Executing, Some(trigger))?;

        let anchor = &entries[0];
        let step = anchor.step;
        let input = Value::Array(entries.iter().map(|entry| entry.row.to_value()).collect());
        let state = self.landscape.begin_node_state(
            &anchor.token.token_id,
            node_id,
            step,
            &input,
            1,
        )?;
        let ctx = self.recording_ctx(node_id, &state);
        let transform = self.transforms.get_mut(node_id).ok_or_else(|| {
            EngineError::OrchestrationInvariant(format!(
                "no batch transform registered for aggregation '{node_id}'"
            ))
        })?;
        let started = self.clock.now();
        let rows: Vec<PipelineRow> = entries.iter().map(|entry| entry.row.clone()).collect();
        let result = transform.process_batch(rows, &ctx);
        let adds_fields = transform.transform_adds_fields();
        let on_error = transform.on_error().clone();
        let duration_ms = Self::elapsed_ms(started, self.clock.now());

        match result {
            TransformResult::Error(failure) => {
                let error_value = serde_json::json!({
                    "reason": failure.reason,
                    "kind": failure.kind,
                    "retryable": failure.retryable,
                });
                self.landscape.complete_node_state(
                    &state.head.state_id,
                    CompletionRequest::Failed { error: Some(error_value.clone()), partial_output: None },
                    duration_ms,
                )?;
                self.landscape.update_batch_status(&batch_id, BatchStatus::Failed, None)?;
                for entry in &entries {
                    let member_item = WorkItem {
                        token: entry.token.clone(),
                        row: entry.row.clone(),
                        node_id: node_id.clone(),
                        step,
                        via_label: None,
                    };
                    self.route_failed_row(
                        &member_item,
                        &on_error,
                        &error_value,
                        Some(state.head.state_id.clone()),
                        results,
                    )?;
                }
                return Ok(());
            }
            TransformResult::Success { row: output, success_reason } => {
                self.landscape.complete_node_state(
                    &state.head.state_id,
                    CompletionRequest::Completed {
                        output: Value::Object(output.clone()),
                        success_reason,
                    },
                    duration_ms,
                )?;
                self.emit_batch_output(
                    node_id,
                    &batch_id,
                    &settings.output_mode,
                    &entries,
                    vec![output],
                    adds_fields,
                    step,
                    queue,
                    results,
                )?;
            }
            TransformResult::SuccessMulti { rows: outputs } => {
                self.landscape.complete_node_state(
                    &state.head.state_id,
                    CompletionRequest::Completed {
                        output: Value::Array(
                            outputs.iter().cloned().map(Value::Object).collect(),
                        ),
                        success_reason: None,
                    },
                    duration_ms,
                )?;
                self.emit_batch_output(
                    node_id,
                    &batch_id,
                    &settings.output_mode,
                    &entries,
                    outputs,
                    adds_fields,
                    step,
                    queue,
                    results,
                )?;
            }
        }
        self.landscape.update_batch_status(&batch_id, BatchStatus::Completed, None)?;
        Ok(())
    }

    /// Emits flush outputs according to the aggregation's output mode.
    #[expect(clippy::too_many_arguments, reason = "Flush context is inherently wide.")]
    fn emit_batch_output(
        &mut self,
        node_id: &NodeId,
        batch_id: &BatchId,
        output_mode: &OutputMode,
        entries: &[BufferedRow],
        outputs: Vec<Map<String, Value>>,
        adds_fields: bool,
        step: u32,
        queue: &mut VecDeque<WorkItem>,
        results: &mut Vec<RowResult>,
    ) -> Result<(), EngineError> {
        // Buffered tokens are consumed by the batch regardless of mode.
        for entry in entries {
            self.landscape.record_token_outcome(
                &self.run_id,
                &entry.token.token_id,
                &OutcomeContext::ConsumedInBatch { batch_id: batch_id.clone() },
                None,
            )?;
        }
        match output_mode {
            OutputMode::Single => {
                let output = outputs.into_iter().next().ok_or_else(|| {
                    EngineError::OrchestrationInvariant(
                        "single-output aggregation produced no row".to_string(),
                    )
                })?;
                let mut contract = entries[0].row.contract().clone();
                for entry in &entries[1..] {
                    contract = contract.merge(entry.row.contract())?;
                }
                let contract = contract.propagate(&output, adds_fields);
                let join_group = GroupId::new(self.groups.next_id("join"));
                let child = self.landscape.create_token(
                    &entries[0].token.row_id,
                    TokenSpec {
                        token_id: None,
                        parents: entries.iter().map(|entry| entry.token.token_id.clone()).collect(),
                        fork_group_id: None,
                        join_group_id: Some(join_group),
                        expand_group_id: None,
                        branch_name: None,
                        step_in_pipeline: Some(step + 1),
                    },
                )?;
                self.landscape.record_batch_output(
                    batch_id,
                    BatchOutputType::Token,
                    child.token_id.as_str(),
                )?;
                let row = PipelineRow::new(output, contract);
                self.push_continuations(child, row, node_id, step, queue, results)?;
            }
            OutputMode::Passthrough => {
                let aligned = outputs.len() == entries.len();
                for (index, entry) in entries.iter().enumerate() {
                    let row = if aligned {
                        let output = outputs[index].clone();
                        let contract = entry.row.contract().propagate(&output, adds_fields);
                        PipelineRow::new(output, contract)
                    } else {
                        entry.row.clone()
                    };
                    self.landscape.record_batch_output(
                        batch_id,
                        BatchOutputType::Token,
                        entry.token.token_id.as_str(),
                    )?;
                    self.push_continuations(entry.token.clone(), row, node_id, step, queue, results)?;
                }
            }
            OutputMode::Transform => {
                let expand_group = GroupId::new(self.groups.next_id("expand"));
                let parents: Vec<_> =
                    entries.iter().map(|entry| entry.token.token_id.clone()).collect();
                for (index, output) in outputs.into_iter().enumerate() {
                    let contract = entries[0].row.contract().propagate(&output, adds_fields);
                    let child = self.landscape.create_token(
                        &entries[0].token.row_id,
                        TokenSpec {
                            token_id: None,
                            parents: parents.clone(),
                            fork_group_id: None,
                            join_group_id: None,
                            expand_group_id: Some(expand_group.clone()),
                            branch_name: Some(format!("batch_{index}")),
                            step_in_pipeline: Some(step + 1),
                        },
                    )?;
                    self.landscape.record_batch_output(
                        batch_id,
                        BatchOutputType::Token,
                        child.token_id.as_str(),
                    )?;
                    let row = PipelineRow::new(output, contract);
                    self.push_continuations(child, row, node_id, step, queue, results)?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Coalesce
    // ------------------------------------------------------------------

    /// Buffers a branch arrival at a coalesce node, joining when ready.
    fn arrive_at_coalesce(
        &mut self,
        item: WorkItem,
        queue: &mut VecDeque<WorkItem>,
        results: &mut Vec<RowResult>,
    ) -> Result<(), EngineError> {
        let branch = item
            .via_label
            .clone()
            .or_else(|| item.token.branch_name.clone())
            .unwrap_or_else(|| CONTINUE_LABEL.to_string());
        let row_id = item.token.row_id.clone();
        let late_branch = branch.clone();
        let disposition = self.coalesces.add_arrival(
            &item.node_id,
            &row_id,
            BranchArrival { branch, token: item.token.clone(), row: item.row },
        )?;
        match disposition {
            ArrivalDisposition::Held => {}
            ArrivalDisposition::Ready => {
                let settings = self
                    .coalesces
                    .settings(&item.node_id)
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::OrchestrationInvariant(format!(
                            "no coalesce settings for node '{}'",
                            item.node_id
                        ))
                    })?;
                let arrivals = self.coalesces.take_arrivals(&item.node_id, &row_id);
                self.join_arrivals(&settings, &row_id, arrivals, queue, results)?;
            }
            ArrivalDisposition::AlreadyJoined => {
                // The join for this row already fired; first wins and the
                // late branch is discarded with its own terminal record.
                let error = serde_json::json!({
                    "error": "coalesce already joined for this row; late arrival discarded",
                    "coalesce": item.node_id.as_str(),
                    "branch": late_branch,
                });
                let error_hash = hash_canonical_json(DEFAULT_HASH_ALGORITHM, &error)?.value;
                self.landscape.record_token_outcome(
                    &self.run_id,
                    &item.token.token_id,
                    &OutcomeContext::Failed { error_hash: Some(error_hash) },
                    Some(error.to_string()),
                )?;
                results.push(RowResult {
                    token: item.token,
                    outcome: RowOutcome::Failed,
                    sink_name: None,
                    row: None,
                    state_id: None,
                });
            }
        }
        Ok(())
    }

    /// Joins branch arrivals into a child token.
    fn join_arrivals(
        &mut self,
        settings: &CoalesceSettings,
        row_id: &RowId,
        arrivals: Vec<BranchArrival>,
        queue: &mut VecDeque<WorkItem>,
        results: &mut Vec<RowResult>,
    ) -> Result<(), EngineError> {
        let (data, contract) = CoalesceManager::merge_rows(settings, &arrivals)?;
        let join_group = GroupId::new(self.groups.next_id("join"));
        let step = arrivals
            .iter()
            .filter_map(|arrival| arrival.token.step_in_pipeline)
            .max()
            .unwrap_or(0);
        let child = self.landscape.create_token(
            row_id,
            TokenSpec {
                token_id: None,
                parents: arrivals.iter().map(|arrival| arrival.token.token_id.clone()).collect(),
                fork_group_id: None,
                join_group_id: Some(join_group.clone()),
                expand_group_id: None,
                branch_name: None,
                step_in_pipeline: Some(step + 1),
            },
        )?;
        let state = self.landscape.begin_node_state(
            &child.token_id,
            &settings.node_id,
            step,
            &Value::Array(arrivals.iter().map(|arrival| arrival.row.to_value()).collect()),
            1,
        )?;
        self.landscape.complete_node_state(
            &state.head.state_id,
            CompletionRequest::Completed {
                output: Value::Object(data.clone()),
                success_reason: None,
            },
            0.0,
        )?;
        for arrival in &arrivals {
            self.landscape.record_token_outcome(
                &self.run_id,
                &arrival.token.token_id,
                &OutcomeContext::Coalesced { join_group_id: join_group.clone() },
                None,
            )?;
            results.push(RowResult {
                token: arrival.token.clone(),
                outcome: RowOutcome::Coalesced,
                sink_name: None,
                row: None,
                state_id: Some(state.head.state_id.clone()),
            });
        }
        let row = PipelineRow::new(data, contract);
        self.push_continuations(child, row, &settings.node_id, step, queue, results)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sinks and continuation
    // ------------------------------------------------------------------

    /// Terminates a token at a sink node.
    fn finish_at_sink(
        &mut self,
        item: WorkItem,
        results: &mut Vec<RowResult>,
    ) -> Result<(), EngineError> {
        let sink_name = self
            .graph
            .node(&item.node_id)
            .map(|node| node.plugin_name.clone())
            .ok_or_else(|| {
                EngineError::OrchestrationInvariant(format!(
                    "sink node '{}' is not in the graph",
                    item.node_id
                ))
            })?;
        let state = self.landscape.begin_node_state(
            &item.token.token_id,
            &item.node_id,
            item.step,
            &item.row.to_value(),
            1,
        )?;
        self.landscape.complete_node_state(
            &state.head.state_id,
            CompletionRequest::Completed { output: item.row.to_value(), success_reason: None },
            0.0,
        )?;
        let routed = item.via_label.as_deref() == Some(NO_MATCH_LABEL);
        let context = if routed {
            OutcomeContext::Routed { sink_name: sink_name.clone() }
        } else {
            OutcomeContext::Completed { sink_name: sink_name.clone() }
        };
        self.landscape.record_token_outcome(&self.run_id, &item.token.token_id, &context, None)?;
        results.push(RowResult {
            token: item.token,
            outcome: if routed { RowOutcome::Routed } else { RowOutcome::Completed },
            sink_name: Some(sink_name),
            row: Some(item.row),
            state_id: Some(state.head.state_id),
        });
        Ok(())
    }

    /// Advances a token along its node's outgoing edges, forking when the
    /// node fans out.
    #[expect(clippy::too_many_arguments, reason = "Continuation context is inherently wide.")]
    fn advance(
        &mut self,
        token: Token,
        row: PipelineRow,
        from_node: &NodeId,
        step: u32,
        state_id: Option<StateId>,
        queue: &mut VecDeque<WorkItem>,
        results: &mut Vec<RowResult>,
    ) -> Result<(), EngineError> {
        let edges: Vec<(NodeId, String)> = self
            .graph
            .outgoing(from_node)
            .into_iter()
            .filter(|edge| edge.label != "quarantine")
            .map(|edge| (edge.to.clone(), edge.label.clone()))
            .collect();
        if edges.is_empty() {
            return Err(EngineError::OrchestrationInvariant(format!(
                "node '{from_node}' has no outgoing edges for a continuing token"
            )));
        }
        if edges.len() == 1 {
            let (to, label) = edges.into_iter().next().ok_or_else(|| {
                EngineError::OrchestrationInvariant("edge vanished during advance".to_string())
            })?;
            let via_label = (label != CONTINUE_LABEL).then_some(label);
            queue.push_back(WorkItem { token, row, node_id: to, step: step + 1, via_label });
            return Ok(());
        }
        // Fan-out: fork one child per edge.
        let fork_group = GroupId::new(self.groups.next_id("fork"));
        let labels: Vec<String> = edges.iter().map(|(_, label)| label.clone()).collect();
        self.landscape.record_token_outcome(
            &self.run_id,
            &token.token_id,
            &OutcomeContext::Forked {
                fork_group_id: fork_group.clone(),
                expected_branches: labels,
            },
            None,
        )?;
        results.push(RowResult {
            token: token.clone(),
            outcome: RowOutcome::Forked,
            sink_name: None,
            row: None,
            state_id,
        });
        for (to, label) in edges {
            let child = self.landscape.create_token(
                &token.row_id,
                TokenSpec {
                    token_id: None,
                    parents: vec![token.token_id.clone()],
                    fork_group_id: Some(fork_group.clone()),
                    join_group_id: None,
                    expand_group_id: None,
                    branch_name: Some(label.clone()),
                    step_in_pipeline: Some(step + 1),
                },
            )?;
            queue.push_back(WorkItem {
                token: child,
                row: row.clone(),
                node_id: to,
                step: step + 1,
                via_label: Some(label),
            });
        }
        Ok(())
    }

    /// Pushes a token's continuation past a node onto the queue.
    fn push_continuations(
        &mut self,
        token: Token,
        row: PipelineRow,
        from_node: &NodeId,
        step: u32,
        queue: &mut VecDeque<WorkItem>,
        results: &mut Vec<RowResult>,
    ) -> Result<(), EngineError> {
        self.advance(token, row, from_node, step, None, queue, results)
    }

    /// Looks up the registered edge id for (node, label).
    fn edge_id(&self, node_id: &NodeId, label: &str) -> Result<EdgeId, EngineError> {
        self.edge_ids
            .get(&(node_id.clone(), label.to_string()))
            .cloned()
            .ok_or_else(|| {
                EngineError::OrchestrationInvariant(format!(
                    "no registered edge for node '{node_id}' label '{label}'"
                ))
            })
    }
}
