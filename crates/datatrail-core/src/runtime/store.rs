// crates/datatrail-core/src/runtime/store.rs
// ============================================================================
// Module: Datatrail In-Memory Landscape
// Description: Reference Landscape store holding all audit records in memory.
// Purpose: Back tests and ephemeral runs with the full audit contract.
// Dependencies: crate::{core, interfaces}, serde_json
// ============================================================================

//! ## Overview
//! [`InMemoryLandscape`] implements the complete [`Landscape`] contract with
//! the same invariants the durable store enforces in SQL: referential
//! integrity checks on every write, at most one terminal outcome per token,
//! and node-state transitions only out of OPEN. It is the reference
//! implementation the engine's tests run against.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use serde_json::Value;

use crate::core::hashing::DEFAULT_HASH_ALGORITHM;
use crate::core::hashing::canonical_json_bytes;
use crate::core::hashing::hash_bytes;
use crate::core::hashing::hash_canonical_json;
use crate::core::identifiers::BatchId;
use crate::core::identifiers::EdgeId;
use crate::core::identifiers::GroupId;
use crate::core::identifiers::IdGenerator;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::OperationId;
use crate::core::identifiers::OutcomeId;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;
use crate::core::outcome::OutcomeContext;
use crate::core::outcome::TokenOutcome;
use crate::core::records::Artifact;
use crate::core::records::Batch;
use crate::core::records::BatchMember;
use crate::core::records::BatchOutput;
use crate::core::records::BatchOutputType;
use crate::core::records::BatchStatus;
use crate::core::records::Call;
use crate::core::records::CallParent;
use crate::core::records::Checkpoint;
use crate::core::records::Edge;
use crate::core::records::Node;
use crate::core::records::Operation;
use crate::core::records::OperationStatus;
use crate::core::records::OperationType;
use crate::core::records::RoutingEvent;
use crate::core::records::RoutingMode;
use crate::core::records::Row;
use crate::core::records::Run;
use crate::core::records::RunStatus;
use crate::core::records::Token;
use crate::core::records::TokenParent;
use crate::core::records::TransformErrorRecord;
use crate::core::records::TriggerType;
use crate::core::records::ValidationErrorRecord;
use crate::core::state::NodeState;
use crate::core::state::NodeStateCompleted;
use crate::core::state::NodeStateFailed;
use crate::core::state::NodeStateHead;
use crate::core::state::NodeStateOpen;
use crate::core::state::NodeStatePending;
use crate::core::time::Clock;
use crate::interfaces::ArtifactDescriptor;
use crate::interfaces::CallSpec;
use crate::interfaces::CompletionRequest;
use crate::interfaces::ExportUpdate;
use crate::interfaces::Landscape;
use crate::interfaces::LandscapeError;
use crate::interfaces::LandscapeSnapshot;
use crate::interfaces::LineageResult;
use crate::interfaces::NodeRegistration;
use crate::interfaces::PayloadRef;
use crate::interfaces::PayloadStore;
use crate::interfaces::RowLineage;
use crate::interfaces::TokenSpec;

// ============================================================================
// SECTION: Inner State
// ============================================================================

/// Mutable record tables guarded by the store mutex.
#[derive(Default)]
struct Inner {
    /// Deterministic id generator; seeded at construction.
    ids: Option<IdGenerator>,
    /// Run records keyed by id.
    runs: BTreeMap<RunId, Run>,
    /// Node records.
    nodes: Vec<Node>,
    /// Edge records.
    edges: Vec<Edge>,
    /// Row records.
    rows: Vec<Row>,
    /// Token records.
    tokens: Vec<Token>,
    /// Token parent records.
    token_parents: Vec<TokenParent>,
    /// Node state records.
    node_states: Vec<NodeState>,
    /// Call records.
    calls: Vec<Call>,
    /// Operation records.
    operations: Vec<Operation>,
    /// Artifact records.
    artifacts: Vec<Artifact>,
    /// Routing event records.
    routing_events: Vec<RoutingEvent>,
    /// Batch records.
    batches: Vec<Batch>,
    /// Batch member records.
    batch_members: Vec<BatchMember>,
    /// Batch output records.
    batch_outputs: Vec<BatchOutput>,
    /// Checkpoint records.
    checkpoints: Vec<Checkpoint>,
    /// Token outcome records.
    token_outcomes: Vec<TokenOutcome>,
    /// Validation error records.
    validation_errors: Vec<ValidationErrorRecord>,
    /// Transform error records.
    transform_errors: Vec<TransformErrorRecord>,
}

impl Inner {
    /// Returns the next generated identifier for a kind.
    fn next_id(&mut self, kind: &str) -> String {
        match self.ids.as_mut() {
            Some(ids) => ids.next_id(kind),
            None => {
                let mut ids = IdGenerator::new("landscape");
                let id = ids.next_id(kind);
                self.ids = Some(ids);
                id
            }
        }
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// In-memory Landscape store enforcing the full audit contract.
pub struct InMemoryLandscape {
    /// Time source for record timestamps.
    clock: Arc<dyn Clock>,
    /// Optional content-addressed payload store.
    payloads: Option<Arc<dyn PayloadStore>>,
    /// Record tables.
    inner: Mutex<Inner>,
}

impl InMemoryLandscape {
    /// Creates a store with the given clock and no payload store.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, payloads: None, inner: Mutex::new(Inner::default()) }
    }

    /// Creates a store with the given clock and payload store.
    #[must_use]
    pub fn with_payload_store(clock: Arc<dyn Clock>, payloads: Arc<dyn PayloadStore>) -> Self {
        Self { clock, payloads: Some(payloads), inner: Mutex::new(Inner::default()) }
    }

    /// Seeds the deterministic id generator; call before `begin_run`.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::Io`] when the store mutex is poisoned.
    pub fn seed_ids(&self, seed: &str) -> Result<(), LandscapeError> {
        let mut inner = self.lock()?;
        inner.ids = Some(IdGenerator::new(seed));
        Ok(())
    }

    /// Acquires the inner lock.
    fn lock(&self) -> Result<MutexGuard<'_, Inner>, LandscapeError> {
        self.inner.lock().map_err(|_| LandscapeError::Io("landscape mutex poisoned".to_string()))
    }

    /// Verifies that a run exists.
    fn require_run(inner: &Inner, run_id: &RunId) -> Result<(), LandscapeError> {
        if inner.runs.contains_key(run_id) {
            return Ok(());
        }
        Err(LandscapeError::MissingParent { entity: "run", id: run_id.to_string() })
    }

    /// Verifies that a node exists on a run.
    fn require_node(inner: &Inner, run_id: &RunId, node_id: &NodeId) -> Result<(), LandscapeError> {
        if inner.nodes.iter().any(|node| node.run_id == *run_id && node.node_id == *node_id) {
            return Ok(());
        }
        Err(LandscapeError::MissingParent { entity: "node", id: node_id.to_string() })
    }

    /// Verifies that a token exists.
    fn require_token(inner: &Inner, token_id: &TokenId) -> Result<(), LandscapeError> {
        if inner.tokens.iter().any(|token| token.token_id == *token_id) {
            return Ok(());
        }
        Err(LandscapeError::MissingParent { entity: "token", id: token_id.to_string() })
    }

    /// Stores a payload when a payload store is configured.
    fn store_payload(&self, data: &Value) -> Result<Option<PayloadRef>, LandscapeError> {
        let Some(payloads) = &self.payloads else {
            return Ok(None);
        };
        let bytes = canonical_json_bytes(data)?;
        let reference = payloads
            .store(&bytes)
            .map_err(|err| LandscapeError::Io(err.to_string()))?;
        Ok(Some(reference))
    }

    /// Canonically hashes a value into its lowercase hex digest.
    fn hash_value(data: &Value) -> Result<String, LandscapeError> {
        Ok(hash_canonical_json(DEFAULT_HASH_ALGORITHM, data)?.value)
    }

    /// Serializes a value to compact JSON for blob columns.
    fn to_json(data: &Value) -> String {
        data.to_string()
    }

    /// Builds a lineage result for one token chain.
    fn build_lineage(
        &self,
        inner: &Inner,
        token: &Token,
    ) -> Result<LineageResult, LandscapeError> {
        // Walk ancestors so forked and coalesced chains explain end to end.
        let mut chain: Vec<Token> = Vec::new();
        let mut pending = vec![token.token_id.clone()];
        let mut seen = std::collections::BTreeSet::new();
        while let Some(token_id) = pending.pop() {
            if !seen.insert(token_id.clone()) {
                continue;
            }
            if let Some(found) = inner.tokens.iter().find(|candidate| candidate.token_id == token_id)
            {
                chain.push(found.clone());
            }
            for parent in
                inner.token_parents.iter().filter(|parent| parent.token_id == token_id)
            {
                pending.push(parent.parent_token_id.clone());
            }
        }
        chain.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let row = chain
            .first()
            .and_then(|first| inner.rows.iter().find(|row| row.row_id == first.row_id))
            .or_else(|| inner.rows.iter().find(|row| row.row_id == token.row_id))
            .cloned()
            .ok_or_else(|| LandscapeError::NotFound {
                entity: "row",
                id: token.row_id.to_string(),
            })?;

        let mut node_states: Vec<NodeState> = inner
            .node_states
            .iter()
            .filter(|state| chain.iter().any(|member| member.token_id == state.head().token_id))
            .cloned()
            .collect();
        node_states.sort_by(|a, b| {
            (a.head().step_index, a.head().attempt).cmp(&(b.head().step_index, b.head().attempt))
        });

        let mut calls: Vec<Call> = inner
            .calls
            .iter()
            .filter(|call| match &call.parent {
                CallParent::State(state_id) => {
                    node_states.iter().any(|state| state.head().state_id == *state_id)
                }
                CallParent::Operation(_) => false,
            })
            .cloned()
            .collect();
        calls.sort_by_key(|call| call.call_index);

        let outcome = inner
            .token_outcomes
            .iter()
            .filter(|outcome| outcome.token_id == token.token_id)
            .rev()
            .find(|outcome| outcome.is_terminal)
            .cloned();

        let (source_data, payload_available) = match (&self.payloads, &row.payload_ref) {
            (Some(payloads), Some(reference)) => {
                match payloads
                    .load(&PayloadRef::new(reference.clone()))
                    .map_err(|err| LandscapeError::Io(err.to_string()))?
                {
                    Some(bytes) => {
                        let value: Value = serde_json::from_slice(&bytes).map_err(|err| {
                            LandscapeError::Integrity(format!("stored payload is not JSON: {err}"))
                        })?;
                        (Some(value), true)
                    }
                    None => (None, false),
                }
            }
            _ => (None, false),
        };

        Ok(LineageResult {
            source_row: RowLineage { row, source_data, payload_available },
            tokens: chain,
            node_states,
            calls,
            outcome,
        })
    }
}

// ============================================================================
// SECTION: Landscape Implementation
// ============================================================================

impl Landscape for InMemoryLandscape {
    fn begin_run(&self, settings: &Value, canonical_version: &str) -> Result<Run, LandscapeError> {
        let config_hash = Self::hash_value(settings)?;
        let mut inner = self.lock()?;
        let run_id = RunId::new(inner.next_id("run"));
        let run = Run {
            run_id: run_id.clone(),
            started_at: self.clock.now(),
            canonical_version: canonical_version.to_string(),
            config_hash,
            settings_json: Self::to_json(settings),
            status: RunStatus::Executing,
            completed_at: None,
            export_status: None,
            export_error: None,
            exported_at: None,
            export_format: None,
            export_sink: None,
        };
        inner.runs.insert(run_id, run.clone());
        Ok(run)
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, LandscapeError> {
        Ok(self.lock()?.runs.get(run_id).cloned())
    }

    fn set_run_status(&self, run_id: &RunId, status: RunStatus) -> Result<(), LandscapeError> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let run = inner.runs.get_mut(run_id).ok_or_else(|| LandscapeError::NotFound {
            entity: "run",
            id: run_id.to_string(),
        })?;
        if run.status != RunStatus::Executing {
            return Err(LandscapeError::RunAlreadyTerminal(run_id.clone()));
        }
        run.status = status;
        if status != RunStatus::Executing {
            run.completed_at = Some(now);
        }
        Ok(())
    }

    fn update_run_export(
        &self,
        run_id: &RunId,
        update: ExportUpdate,
    ) -> Result<(), LandscapeError> {
        let mut inner = self.lock()?;
        let run = inner.runs.get_mut(run_id).ok_or_else(|| LandscapeError::NotFound {
            entity: "run",
            id: run_id.to_string(),
        })?;
        if let Some(status) = update.export_status {
            run.export_status = Some(status);
        }
        if let Some(at) = update.exported_at {
            run.exported_at = Some(at);
        }
        if let Some(error) = update.export_error {
            run.export_error = Some(error);
        }
        if let Some(format) = update.export_format {
            run.export_format = Some(format);
        }
        if let Some(sink) = update.export_sink {
            run.export_sink = Some(sink);
        }
        Ok(())
    }

    fn register_node(
        &self,
        run_id: &RunId,
        registration: NodeRegistration,
    ) -> Result<Node, LandscapeError> {
        let config_hash = Self::hash_value(&registration.config)?;
        let mut inner = self.lock()?;
        Self::require_run(&inner, run_id)?;
        let node_id = match registration.node_id {
            Some(node_id) => node_id,
            None => NodeId::new(inner.next_id("node")),
        };
        if let Some(existing) = inner
            .nodes
            .iter()
            .find(|node| node.run_id == *run_id && node.node_id == node_id)
        {
            if existing.config_hash == config_hash
                && existing.plugin_name == registration.plugin_name
            {
                return Ok(existing.clone());
            }
            return Err(LandscapeError::Integrity(format!(
                "node '{node_id}' re-registered with different configuration"
            )));
        }
        let node = Node {
            node_id,
            run_id: run_id.clone(),
            plugin_name: registration.plugin_name,
            node_type: registration.node_type,
            plugin_version: registration.plugin_version,
            determinism: registration.determinism,
            config_hash,
            config_json: Self::to_json(&registration.config),
            registered_at: self.clock.now(),
            schema_mode: registration.schema_mode,
            schema_fields_json: registration.schema_fields_json,
            sequence_in_pipeline: registration.sequence_in_pipeline,
        };
        inner.nodes.push(node.clone());
        Ok(node)
    }

    fn register_edge(
        &self,
        run_id: &RunId,
        from_node_id: &NodeId,
        to_node_id: &NodeId,
        label: &str,
        default_mode: RoutingMode,
    ) -> Result<Edge, LandscapeError> {
        let mut inner = self.lock()?;
        Self::require_run(&inner, run_id)?;
        Self::require_node(&inner, run_id, from_node_id)?;
        Self::require_node(&inner, run_id, to_node_id)?;
        // Re-registration on resume is idempotent.
        if let Some(existing) = inner.edges.iter().find(|edge| {
            edge.run_id == *run_id
                && edge.from_node_id == *from_node_id
                && edge.to_node_id == *to_node_id
                && edge.label == label
        }) {
            return Ok(existing.clone());
        }
        let edge = Edge {
            edge_id: EdgeId::new(inner.next_id("edge")),
            run_id: run_id.clone(),
            from_node_id: from_node_id.clone(),
            to_node_id: to_node_id.clone(),
            label: label.to_string(),
            default_mode,
            created_at: self.clock.now(),
        };
        inner.edges.push(edge.clone());
        Ok(edge)
    }

    fn create_row(
        &self,
        run_id: &RunId,
        source_node_id: &NodeId,
        row_index: u64,
        data: &Value,
        row_id: Option<RowId>,
    ) -> Result<Row, LandscapeError> {
        let source_data_hash = Self::hash_value(data)?;
        let payload_ref = self.store_payload(data)?;
        let mut inner = self.lock()?;
        Self::require_run(&inner, run_id)?;
        Self::require_node(&inner, run_id, source_node_id)?;
        let row_id = match row_id {
            Some(row_id) => row_id,
            None => RowId::new(inner.next_id("row")),
        };
        let row = Row {
            row_id,
            run_id: run_id.clone(),
            source_node_id: source_node_id.clone(),
            row_index,
            source_data_hash,
            created_at: self.clock.now(),
            payload_ref: payload_ref.map(|reference| reference.as_str().to_string()),
        };
        inner.rows.push(row.clone());
        Ok(row)
    }

    fn get_rows(&self, run_id: &RunId) -> Result<Vec<Row>, LandscapeError> {
        let inner = self.lock()?;
        let mut rows: Vec<Row> =
            inner.rows.iter().filter(|row| row.run_id == *run_id).cloned().collect();
        rows.sort_by_key(|row| row.row_index);
        Ok(rows)
    }

    fn load_row_payload(&self, row: &Row) -> Result<Option<Value>, LandscapeError> {
        let Some(payloads) = &self.payloads else {
            return Ok(None);
        };
        let Some(reference) = &row.payload_ref else {
            return Ok(None);
        };
        let Some(bytes) = payloads
            .load(&PayloadRef::new(reference.clone()))
            .map_err(|err| LandscapeError::Io(err.to_string()))?
        else {
            return Ok(None);
        };
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|err| LandscapeError::Integrity(format!("stored payload is not JSON: {err}")))?;
        Ok(Some(value))
    }

    fn create_token(&self, row_id: &RowId, spec: TokenSpec) -> Result<Token, LandscapeError> {
        let mut inner = self.lock()?;
        if !inner.rows.iter().any(|row| row.row_id == *row_id) {
            return Err(LandscapeError::MissingParent { entity: "row", id: row_id.to_string() });
        }
        for parent in &spec.parents {
            Self::require_token(&inner, parent)?;
        }
        let token_id = match spec.token_id {
            Some(token_id) => token_id,
            None => TokenId::new(inner.next_id("tok")),
        };
        let token = Token {
            token_id: token_id.clone(),
            row_id: row_id.clone(),
            created_at: self.clock.now(),
            fork_group_id: spec.fork_group_id,
            join_group_id: spec.join_group_id,
            expand_group_id: spec.expand_group_id,
            branch_name: spec.branch_name,
            step_in_pipeline: spec.step_in_pipeline,
        };
        inner.tokens.push(token.clone());
        for (ordinal, parent) in spec.parents.iter().enumerate() {
            inner.token_parents.push(TokenParent {
                token_id: token_id.clone(),
                parent_token_id: parent.clone(),
                ordinal: u32::try_from(ordinal).map_err(|_| {
                    LandscapeError::Integrity("token parent ordinal overflow".to_string())
                })?,
            });
        }
        Ok(token)
    }

    fn get_tokens_for_row(&self, row_id: &RowId) -> Result<Vec<Token>, LandscapeError> {
        let inner = self.lock()?;
        Ok(inner.tokens.iter().filter(|token| token.row_id == *row_id).cloned().collect())
    }

    fn begin_node_state(
        &self,
        token_id: &TokenId,
        node_id: &NodeId,
        step_index: u32,
        input: &Value,
        attempt: u32,
    ) -> Result<NodeStateOpen, LandscapeError> {
        let input_hash = Self::hash_value(input)?;
        let mut inner = self.lock()?;
        Self::require_token(&inner, token_id)?;
        if !inner.nodes.iter().any(|node| node.node_id == *node_id) {
            return Err(LandscapeError::MissingParent { entity: "node", id: node_id.to_string() });
        }
        let state = NodeStateOpen {
            head: NodeStateHead {
                state_id: StateId::new(inner.next_id("st")),
                token_id: token_id.clone(),
                node_id: node_id.clone(),
                step_index,
                attempt,
                input_hash,
                started_at: self.clock.now(),
            },
        };
        inner.node_states.push(NodeState::Open(state.clone()));
        Ok(state)
    }

    fn complete_node_state(
        &self,
        state_id: &StateId,
        request: CompletionRequest,
        duration_ms: f64,
    ) -> Result<NodeState, LandscapeError> {
        let completed_at = self.clock.now();
        let new_state = {
            let inner = self.lock()?;
            let existing = inner
                .node_states
                .iter()
                .find(|state| state.head().state_id == *state_id)
                .ok_or_else(|| LandscapeError::NotFound {
                    entity: "node_state",
                    id: state_id.to_string(),
                })?;
            let NodeState::Open(open) = existing else {
                return Err(LandscapeError::InvalidTransition {
                    state_id: state_id.clone(),
                    status: existing.status_label().to_string(),
                });
            };
            let head = open.head.clone();
            match request {
                CompletionRequest::Completed { output, success_reason } => {
                    let output_hash = Self::hash_value(&output)?;
                    NodeState::Completed(NodeStateCompleted {
                        head,
                        output_hash,
                        completed_at,
                        duration_ms,
                        success_reason_json: success_reason.as_ref().map(Self::to_json),
                    })
                }
                CompletionRequest::Pending => {
                    NodeState::Pending(NodeStatePending { head, completed_at, duration_ms })
                }
                CompletionRequest::Failed { error, partial_output } => {
                    let output_hash = match &partial_output {
                        Some(output) => Some(Self::hash_value(output)?),
                        None => None,
                    };
                    NodeState::Failed(NodeStateFailed {
                        head,
                        completed_at,
                        duration_ms,
                        error_json: error.as_ref().map(Self::to_json),
                        output_hash,
                    })
                }
            }
        };
        let mut inner = self.lock()?;
        let slot = inner
            .node_states
            .iter_mut()
            .find(|state| state.head().state_id == *state_id)
            .ok_or_else(|| LandscapeError::NotFound {
                entity: "node_state",
                id: state_id.to_string(),
            })?;
        *slot = new_state.clone();
        Ok(new_state)
    }

    fn get_node_states_for_token(
        &self,
        token_id: &TokenId,
    ) -> Result<Vec<NodeState>, LandscapeError> {
        let inner = self.lock()?;
        let mut states: Vec<NodeState> = inner
            .node_states
            .iter()
            .filter(|state| state.head().token_id == *token_id)
            .cloned()
            .collect();
        states.sort_by(|a, b| {
            (a.head().step_index, a.head().attempt).cmp(&(b.head().step_index, b.head().attempt))
        });
        Ok(states)
    }

    fn record_call(&self, parent: &CallParent, spec: CallSpec) -> Result<Call, LandscapeError> {
        let request_hash = Self::hash_value(&spec.request_data)?;
        let response_hash = match &spec.response_data {
            Some(response) => Some(Self::hash_value(response)?),
            None => None,
        };
        let mut inner = self.lock()?;
        match parent {
            CallParent::State(state_id) => {
                if !inner.node_states.iter().any(|state| state.head().state_id == *state_id) {
                    return Err(LandscapeError::MissingParent {
                        entity: "node_state",
                        id: state_id.to_string(),
                    });
                }
            }
            CallParent::Operation(operation_id) => {
                if !inner.operations.iter().any(|op| op.operation_id == *operation_id) {
                    return Err(LandscapeError::MissingParent {
                        entity: "operation",
                        id: operation_id.to_string(),
                    });
                }
            }
        }
        if inner
            .calls
            .iter()
            .any(|call| call.parent == *parent && call.call_index == spec.call_index)
        {
            return Err(LandscapeError::Integrity(format!(
                "call index {} already recorded for this parent",
                spec.call_index
            )));
        }
        let call = Call {
            call_id: crate::core::identifiers::CallId::new(inner.next_id("call")),
            parent: parent.clone(),
            call_index: spec.call_index,
            call_type: spec.call_type,
            status: spec.status,
            request_hash,
            response_hash,
            error_json: spec.error.as_ref().map(Self::to_json),
            latency_ms: spec.latency_ms,
            created_at: self.clock.now(),
        };
        inner.calls.push(call.clone());
        Ok(call)
    }

    fn begin_operation(
        &self,
        run_id: &RunId,
        node_id: &NodeId,
        operation_type: OperationType,
    ) -> Result<Operation, LandscapeError> {
        let mut inner = self.lock()?;
        Self::require_run(&inner, run_id)?;
        Self::require_node(&inner, run_id, node_id)?;
        let operation = Operation {
            operation_id: OperationId::new(inner.next_id("op")),
            run_id: run_id.clone(),
            node_id: node_id.clone(),
            operation_type,
            status: OperationStatus::Open,
            started_at: self.clock.now(),
            completed_at: None,
            duration_ms: None,
            input_data_ref: None,
            output_data_ref: None,
            error_message: None,
        };
        inner.operations.push(operation.clone());
        Ok(operation)
    }

    fn complete_operation(
        &self,
        operation_id: &OperationId,
        status: OperationStatus,
        duration_ms: Option<f64>,
        error_message: Option<String>,
    ) -> Result<Operation, LandscapeError> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let operation = inner
            .operations
            .iter_mut()
            .find(|op| op.operation_id == *operation_id)
            .ok_or_else(|| LandscapeError::NotFound {
                entity: "operation",
                id: operation_id.to_string(),
            })?;
        if operation.status != OperationStatus::Open {
            return Err(LandscapeError::InvalidTransition {
                state_id: StateId::new(operation_id.as_str()),
                status: format!("{:?}", operation.status).to_lowercase(),
            });
        }
        operation.status = status;
        operation.completed_at = Some(now);
        operation.duration_ms = duration_ms;
        operation.error_message = error_message;
        Ok(operation.clone())
    }

    fn record_artifact(
        &self,
        run_id: &RunId,
        sink_node_id: &NodeId,
        produced_by_state_id: Option<StateId>,
        descriptor: &ArtifactDescriptor,
    ) -> Result<Artifact, LandscapeError> {
        let mut inner = self.lock()?;
        Self::require_run(&inner, run_id)?;
        Self::require_node(&inner, run_id, sink_node_id)?;
        let artifact = Artifact {
            artifact_id: crate::core::identifiers::ArtifactId::new(inner.next_id("art")),
            run_id: run_id.clone(),
            produced_by_state_id,
            sink_node_id: sink_node_id.clone(),
            artifact_type: descriptor.artifact_type.clone(),
            path_or_uri: descriptor.path_or_uri.clone(),
            content_hash: descriptor.content_hash.clone(),
            size_bytes: descriptor.size_bytes,
            created_at: self.clock.now(),
            idempotency_key: descriptor.idempotency_key.clone(),
        };
        inner.artifacts.push(artifact.clone());
        Ok(artifact)
    }

    fn record_routing_event(
        &self,
        state_id: &StateId,
        edge_id: &EdgeId,
        routing_group_id: &GroupId,
        ordinal: u32,
        mode: RoutingMode,
        reason: Option<&Value>,
    ) -> Result<RoutingEvent, LandscapeError> {
        let reason_hash = match reason {
            Some(reason) => Some(Self::hash_value(reason)?),
            None => None,
        };
        let mut inner = self.lock()?;
        if !inner.node_states.iter().any(|state| state.head().state_id == *state_id) {
            return Err(LandscapeError::MissingParent {
                entity: "node_state",
                id: state_id.to_string(),
            });
        }
        if !inner.edges.iter().any(|edge| edge.edge_id == *edge_id) {
            return Err(LandscapeError::MissingParent {
                entity: "edge",
                id: edge_id.to_string(),
            });
        }
        let event = RoutingEvent {
            event_id: crate::core::identifiers::EventId::new(inner.next_id("evt")),
            state_id: state_id.clone(),
            edge_id: edge_id.clone(),
            routing_group_id: routing_group_id.clone(),
            ordinal,
            mode,
            reason_hash,
            created_at: self.clock.now(),
        };
        inner.routing_events.push(event.clone());
        Ok(event)
    }

    fn create_batch(
        &self,
        run_id: &RunId,
        aggregation_node_id: &NodeId,
    ) -> Result<Batch, LandscapeError> {
        let mut inner = self.lock()?;
        Self::require_run(&inner, run_id)?;
        Self::require_node(&inner, run_id, aggregation_node_id)?;
        let batch = Batch {
            batch_id: BatchId::new(inner.next_id("batch")),
            run_id: run_id.clone(),
            aggregation_node_id: aggregation_node_id.clone(),
            attempt: 1,
            status: BatchStatus::Draft,
            created_at: self.clock.now(),
            trigger_type: None,
            completed_at: None,
        };
        inner.batches.push(batch.clone());
        Ok(batch)
    }

    fn add_batch_member(
        &self,
        batch_id: &BatchId,
        token_id: &TokenId,
        ordinal: u32,
    ) -> Result<(), LandscapeError> {
        let mut inner = self.lock()?;
        if !inner.batches.iter().any(|batch| batch.batch_id == *batch_id) {
            return Err(LandscapeError::MissingParent {
                entity: "batch",
                id: batch_id.to_string(),
            });
        }
        Self::require_token(&inner, token_id)?;
        inner.batch_members.push(BatchMember {
            batch_id: batch_id.clone(),
            token_id: token_id.clone(),
            ordinal,
        });
        Ok(())
    }

    fn update_batch_status(
        &self,
        batch_id: &BatchId,
        status: BatchStatus,
        trigger_type: Option<TriggerType>,
    ) -> Result<(), LandscapeError> {
        let now = self.clock.now();
        let mut inner = self.lock()?;
        let batch = inner
            .batches
            .iter_mut()
            .find(|batch| batch.batch_id == *batch_id)
            .ok_or_else(|| LandscapeError::NotFound {
                entity: "batch",
                id: batch_id.to_string(),
            })?;
        batch.status = status;
        if trigger_type.is_some() {
            batch.trigger_type = trigger_type;
        }
        if matches!(status, BatchStatus::Completed | BatchStatus::Failed) {
            batch.completed_at = Some(now);
        }
        Ok(())
    }

    fn record_batch_output(
        &self,
        batch_id: &BatchId,
        output_type: BatchOutputType,
        output_id: &str,
    ) -> Result<(), LandscapeError> {
        let mut inner = self.lock()?;
        if !inner.batches.iter().any(|batch| batch.batch_id == *batch_id) {
            return Err(LandscapeError::MissingParent {
                entity: "batch",
                id: batch_id.to_string(),
            });
        }
        inner.batch_outputs.push(BatchOutput {
            batch_id: batch_id.clone(),
            output_type,
            output_id: output_id.to_string(),
        });
        Ok(())
    }

    fn get_incomplete_batches(&self, run_id: &RunId) -> Result<Vec<Batch>, LandscapeError> {
        let inner = self.lock()?;
        Ok(inner
            .batches
            .iter()
            .filter(|batch| {
                batch.run_id == *run_id
                    && matches!(
                        batch.status,
                        BatchStatus::Draft | BatchStatus::Executing | BatchStatus::Failed
                    )
            })
            .cloned()
            .collect())
    }

    fn retry_batch(&self, batch_id: &BatchId) -> Result<Batch, LandscapeError> {
        let mut inner = self.lock()?;
        let batch = inner
            .batches
            .iter_mut()
            .find(|batch| batch.batch_id == *batch_id)
            .ok_or_else(|| LandscapeError::NotFound {
                entity: "batch",
                id: batch_id.to_string(),
            })?;
        batch.attempt += 1;
        batch.status = BatchStatus::Draft;
        batch.trigger_type = None;
        batch.completed_at = None;
        Ok(batch.clone())
    }

    fn record_token_outcome(
        &self,
        run_id: &RunId,
        token_id: &TokenId,
        context: &OutcomeContext,
        context_json: Option<String>,
    ) -> Result<TokenOutcome, LandscapeError> {
        let mut inner = self.lock()?;
        Self::require_run(&inner, run_id)?;
        Self::require_token(&inner, token_id)?;
        if context.is_terminal()
            && inner
                .token_outcomes
                .iter()
                .any(|outcome| outcome.token_id == *token_id && outcome.is_terminal)
        {
            return Err(LandscapeError::TerminalOutcomeExists(token_id.clone()));
        }
        let outcome = TokenOutcome::from_context(
            OutcomeId::new(inner.next_id("out")),
            run_id.clone(),
            token_id.clone(),
            self.clock.now(),
            context,
            context_json,
        );
        outcome.validate()?;
        inner.token_outcomes.push(outcome.clone());
        Ok(outcome)
    }

    fn get_token_outcome(
        &self,
        token_id: &TokenId,
    ) -> Result<Option<TokenOutcome>, LandscapeError> {
        let inner = self.lock()?;
        let outcomes: Vec<&TokenOutcome> = inner
            .token_outcomes
            .iter()
            .filter(|outcome| outcome.token_id == *token_id)
            .collect();
        let chosen = outcomes
            .iter()
            .find(|outcome| outcome.is_terminal)
            .or_else(|| outcomes.last())
            .map(|outcome| (*outcome).clone());
        if let Some(outcome) = &chosen {
            outcome.validate()?;
        }
        Ok(chosen)
    }

    fn record_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), LandscapeError> {
        let mut inner = self.lock()?;
        Self::require_run(&inner, &checkpoint.run_id)?;
        Self::require_token(&inner, &checkpoint.token_id)?;
        if !inner.nodes.iter().any(|node| node.node_id == checkpoint.node_id) {
            return Err(LandscapeError::MissingParent {
                entity: "node",
                id: checkpoint.node_id.to_string(),
            });
        }
        inner.checkpoints.push(checkpoint);
        Ok(())
    }

    fn get_latest_checkpoint(
        &self,
        run_id: &RunId,
    ) -> Result<Option<Checkpoint>, LandscapeError> {
        let inner = self.lock()?;
        Ok(inner
            .checkpoints
            .iter()
            .filter(|checkpoint| checkpoint.run_id == *run_id)
            .max_by_key(|checkpoint| checkpoint.sequence_number)
            .cloned())
    }

    fn get_checkpoints(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, LandscapeError> {
        let inner = self.lock()?;
        let mut checkpoints: Vec<Checkpoint> = inner
            .checkpoints
            .iter()
            .filter(|checkpoint| checkpoint.run_id == *run_id)
            .cloned()
            .collect();
        checkpoints.sort_by_key(|checkpoint| checkpoint.sequence_number);
        Ok(checkpoints)
    }

    fn delete_checkpoints(&self, run_id: &RunId) -> Result<(), LandscapeError> {
        let mut inner = self.lock()?;
        inner.checkpoints.retain(|checkpoint| checkpoint.run_id != *run_id);
        Ok(())
    }

    fn record_validation_error(
        &self,
        run_id: &RunId,
        node_id: Option<&NodeId>,
        row_data: &Value,
        error: &str,
        schema_mode: &str,
        destination: &str,
    ) -> Result<ValidationErrorRecord, LandscapeError> {
        let row_hash = Self::hash_value(row_data)?;
        let mut inner = self.lock()?;
        Self::require_run(&inner, run_id)?;
        if let Some(node_id) = node_id {
            Self::require_node(&inner, run_id, node_id)?;
        }
        let record = ValidationErrorRecord {
            error_id: crate::core::identifiers::ErrorId::new(inner.next_id("verr")),
            run_id: run_id.clone(),
            node_id: node_id.cloned(),
            row_hash,
            error: error.to_string(),
            schema_mode: schema_mode.to_string(),
            destination: destination.to_string(),
            created_at: self.clock.now(),
            row_data_json: Some(Self::to_json(row_data)),
        };
        inner.validation_errors.push(record.clone());
        Ok(record)
    }

    fn record_transform_error(
        &self,
        run_id: &RunId,
        token_id: &TokenId,
        transform_node_id: &NodeId,
        row_data: &Value,
        destination: &str,
        error_details: Option<&Value>,
    ) -> Result<TransformErrorRecord, LandscapeError> {
        let row_hash = Self::hash_value(row_data)?;
        let mut inner = self.lock()?;
        Self::require_run(&inner, run_id)?;
        Self::require_token(&inner, token_id)?;
        Self::require_node(&inner, run_id, transform_node_id)?;
        let record = TransformErrorRecord {
            error_id: crate::core::identifiers::ErrorId::new(inner.next_id("terr")),
            run_id: run_id.clone(),
            token_id: token_id.clone(),
            transform_node_id: transform_node_id.clone(),
            row_hash,
            destination: destination.to_string(),
            created_at: self.clock.now(),
            row_data_json: Some(Self::to_json(row_data)),
            error_details_json: error_details.map(Self::to_json),
        };
        inner.transform_errors.push(record.clone());
        Ok(record)
    }

    fn explain_row(
        &self,
        run_id: &RunId,
        row_id: &RowId,
        sink: Option<&str>,
    ) -> Result<Option<LineageResult>, LandscapeError> {
        let candidate = {
            let inner = self.lock()?;
            let Some(row) =
                inner.rows.iter().find(|row| row.run_id == *run_id && row.row_id == *row_id)
            else {
                return Ok(None);
            };
            let tokens: Vec<Token> = inner
                .tokens
                .iter()
                .filter(|token| token.row_id == row.row_id)
                .cloned()
                .collect();
            let matching: Vec<Token> = match sink {
                Some(sink) => tokens
                    .into_iter()
                    .filter(|token| {
                        inner.token_outcomes.iter().any(|outcome| {
                            outcome.token_id == token.token_id
                                && outcome.is_terminal
                                && outcome.sink_name.as_deref() == Some(sink)
                        })
                    })
                    .collect(),
                None => {
                    // Without a sink filter, only tokens with a terminal
                    // outcome are lineage endpoints.
                    tokens
                        .into_iter()
                        .filter(|token| {
                            inner.token_outcomes.iter().any(|outcome| {
                                outcome.token_id == token.token_id && outcome.is_terminal
                            })
                        })
                        .collect()
                }
            };
            if matching.len() > 1 {
                return Err(LandscapeError::AmbiguousLineage(format!(
                    "row '{row_id}' has {} terminal tokens; supply a sink to disambiguate",
                    matching.len()
                )));
            }
            matching.into_iter().next()
        };
        match candidate {
            Some(token) => {
                let inner = self.lock()?;
                Ok(Some(self.build_lineage(&inner, &token)?))
            }
            None => Ok(None),
        }
    }

    fn explain_token(&self, token_id: &TokenId) -> Result<Option<LineageResult>, LandscapeError> {
        let inner = self.lock()?;
        let Some(token) = inner.tokens.iter().find(|token| token.token_id == *token_id).cloned()
        else {
            return Ok(None);
        };
        Ok(Some(self.build_lineage(&inner, &token)?))
    }

    fn export_snapshot(&self, run_id: &RunId) -> Result<LandscapeSnapshot, LandscapeError> {
        let inner = self.lock()?;
        let row_ids: std::collections::BTreeSet<&RowId> = inner
            .rows
            .iter()
            .filter(|row| row.run_id == *run_id)
            .map(|row| &row.row_id)
            .collect();
        let token_ids: std::collections::BTreeSet<&TokenId> = inner
            .tokens
            .iter()
            .filter(|token| row_ids.contains(&token.row_id))
            .map(|token| &token.token_id)
            .collect();
        let state_ids: std::collections::BTreeSet<&StateId> = inner
            .node_states
            .iter()
            .filter(|state| token_ids.contains(&state.head().token_id))
            .map(|state| &state.head().state_id)
            .collect();
        let operation_ids: std::collections::BTreeSet<&OperationId> = inner
            .operations
            .iter()
            .filter(|operation| operation.run_id == *run_id)
            .map(|operation| &operation.operation_id)
            .collect();
        Ok(LandscapeSnapshot {
            runs: inner.runs.get(run_id).cloned().into_iter().collect(),
            nodes: inner.nodes.iter().filter(|node| node.run_id == *run_id).cloned().collect(),
            edges: inner.edges.iter().filter(|edge| edge.run_id == *run_id).cloned().collect(),
            rows: inner.rows.iter().filter(|row| row.run_id == *run_id).cloned().collect(),
            tokens: inner
                .tokens
                .iter()
                .filter(|token| row_ids.contains(&token.row_id))
                .cloned()
                .collect(),
            token_parents: inner
                .token_parents
                .iter()
                .filter(|parent| token_ids.contains(&parent.token_id))
                .cloned()
                .collect(),
            node_states: inner
                .node_states
                .iter()
                .filter(|state| token_ids.contains(&state.head().token_id))
                .cloned()
                .collect(),
            calls: inner
                .calls
                .iter()
                .filter(|call| match &call.parent {
                    CallParent::State(state_id) => state_ids.contains(state_id),
                    CallParent::Operation(operation_id) => operation_ids.contains(operation_id),
                })
                .cloned()
                .collect(),
            operations: inner
                .operations
                .iter()
                .filter(|operation| operation.run_id == *run_id)
                .cloned()
                .collect(),
            artifacts: inner
                .artifacts
                .iter()
                .filter(|artifact| artifact.run_id == *run_id)
                .cloned()
                .collect(),
            routing_events: inner
                .routing_events
                .iter()
                .filter(|event| state_ids.contains(&event.state_id))
                .cloned()
                .collect(),
            batches: inner
                .batches
                .iter()
                .filter(|batch| batch.run_id == *run_id)
                .cloned()
                .collect(),
            batch_members: inner
                .batch_members
                .iter()
                .filter(|member| token_ids.contains(&member.token_id))
                .cloned()
                .collect(),
            batch_outputs: inner.batch_outputs.clone(),
            checkpoints: inner
                .checkpoints
                .iter()
                .filter(|checkpoint| checkpoint.run_id == *run_id)
                .cloned()
                .collect(),
            token_outcomes: inner
                .token_outcomes
                .iter()
                .filter(|outcome| outcome.run_id == *run_id)
                .cloned()
                .collect(),
            validation_errors: inner
                .validation_errors
                .iter()
                .filter(|record| record.run_id == *run_id)
                .cloned()
                .collect(),
            transform_errors: inner
                .transform_errors
                .iter()
                .filter(|record| record.run_id == *run_id)
                .cloned()
                .collect(),
        })
    }
}

// ============================================================================
// SECTION: Hash Re-export Guard
// ============================================================================

/// Hashes raw bytes for payload references; kept here so store implementations
/// share one definition of the payload reference format.
#[must_use]
pub fn payload_reference(bytes: &[u8]) -> PayloadRef {
    PayloadRef::new(hash_bytes(DEFAULT_HASH_ALGORITHM, bytes).value)
}
