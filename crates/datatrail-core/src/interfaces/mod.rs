// crates/datatrail-core/src/interfaces/mod.rs
// ============================================================================
// Module: Datatrail Interfaces
// Description: Plugin traits, plugin context, payload store, and Landscape
//              store contracts.
// Purpose: Define the contract surfaces between the engine and its
//          collaborators without embedding backend-specific details.
// Dependencies: crate::core, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! Interfaces define how Datatrail integrates with plugins and stores without
//! embedding backend specifics. Plugins are opaque objects honoring these
//! traits; the Landscape store owns the canonical copy of every audit record
//! and fails loudly on integrity violations. Implementations must be
//! deterministic and fail closed on missing or invalid data.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

use crate::core::contract::PipelineRow;
use crate::core::contract::SchemaContract;
use crate::core::hashing::HashError;
use crate::core::identifiers::BatchId;
use crate::core::identifiers::CallId;
use crate::core::identifiers::EdgeId;
use crate::core::identifiers::GroupId;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::OperationId;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;
use crate::core::outcome::OutcomeContext;
use crate::core::outcome::OutcomeError;
use crate::core::outcome::TokenOutcome;
use crate::core::records::Artifact;
use crate::core::records::Batch;
use crate::core::records::BatchMember;
use crate::core::records::BatchOutput;
use crate::core::records::BatchOutputType;
use crate::core::records::BatchStatus;
use crate::core::records::Call;
use crate::core::records::CallParent;
use crate::core::records::CallStatus;
use crate::core::records::CallType;
use crate::core::records::Checkpoint;
use crate::core::records::Determinism;
use crate::core::records::Edge;
use crate::core::records::ExportStatus;
use crate::core::records::Node;
use crate::core::records::NodeType;
use crate::core::records::Operation;
use crate::core::records::OperationStatus;
use crate::core::records::OperationType;
use crate::core::records::RecordError;
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
use crate::core::state::NodeStateOpen;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Route Targets
// ============================================================================

/// Destination for rows leaving the happy path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "sink", rename_all = "snake_case")]
pub enum RouteTarget {
    /// Drop the row; only the audit record remains.
    Discard,
    /// Route the row to the named sink.
    Sink(String),
}

impl RouteTarget {
    /// Parses the configuration form: the literal "discard" or a sink name.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value == "discard" {
            Self::Discard
        } else {
            Self::Sink(value.to_string())
        }
    }

    /// Returns the sink name when the target is a sink.
    #[must_use]
    pub fn sink_name(&self) -> Option<&str> {
        match self {
            Self::Discard => None,
            Self::Sink(name) => Some(name.as_str()),
        }
    }
}

// ============================================================================
// SECTION: Plugin Context
// ============================================================================

/// Errors raised by the narrow plugin-facing recording APIs.
#[derive(Debug, Error)]
pub enum PluginContextError {
    /// The context has no call parent; recording is not available here.
    #[error("call recording is not available in this context")]
    RecordingUnavailable,
    /// The underlying store rejected the record.
    #[error("call recording failed: {0}")]
    Store(String),
}

/// Narrow handle plugins use to append call records.
pub trait CallRecorder: Send + Sync {
    /// Records one external call under the given parent.
    ///
    /// # Errors
    ///
    /// Returns [`PluginContextError::Store`] when the store rejects the record.
    fn record_call(
        &self,
        parent: &CallParent,
        spec: CallSpec,
    ) -> Result<CallId, PluginContextError>;
}

/// Specification of one external call for recording.
#[derive(Debug, Clone)]
pub struct CallSpec {
    /// Position within the parent, monotonic across retries.
    pub call_index: u32,
    /// Call classification.
    pub call_type: CallType,
    /// Completion status.
    pub status: CallStatus,
    /// Request payload.
    pub request_data: Value,
    /// Response payload when present.
    pub response_data: Option<Value>,
    /// Observed latency in milliseconds.
    pub latency_ms: Option<f64>,
    /// Error payload when the call failed.
    pub error: Option<Value>,
}

/// Read-only context handed to plugins at every lifecycle point.
///
/// Plugins never mutate the Landscape directly; the context exposes only the
/// narrow call-recording API, scoped to the node state or operation the
/// engine is currently processing.
#[derive(Clone)]
pub struct PluginContext {
    /// Run identifier.
    pub run_id: RunId,
    /// Node the plugin is registered as.
    pub node_id: NodeId,
    /// Node configuration.
    pub config: Arc<Value>,
    /// Call recorder installed by the engine, when recording is available.
    recorder: Option<Arc<dyn CallRecorder>>,
    /// Parent context for recorded calls.
    call_parent: Option<CallParent>,
}

impl PluginContext {
    /// Creates a context without call recording (tests, validation passes).
    #[must_use]
    pub const fn detached(run_id: RunId, node_id: NodeId, config: Arc<Value>) -> Self {
        Self { run_id, node_id, config, recorder: None, call_parent: None }
    }

    /// Creates a context with call recording scoped to the given parent.
    #[must_use]
    pub fn recording(
        run_id: RunId,
        node_id: NodeId,
        config: Arc<Value>,
        recorder: Arc<dyn CallRecorder>,
        call_parent: CallParent,
    ) -> Self {
        Self { run_id, node_id, config, recorder: Some(recorder), call_parent: Some(call_parent) }
    }

    /// Records one external call under the context's parent.
    ///
    /// # Errors
    ///
    /// Returns [`PluginContextError::RecordingUnavailable`] when the context
    /// is detached, or [`PluginContextError::Store`] when recording fails.
    pub fn record_call(&self, spec: CallSpec) -> Result<CallId, PluginContextError> {
        let recorder =
            self.recorder.as_ref().ok_or(PluginContextError::RecordingUnavailable)?;
        let parent =
            self.call_parent.as_ref().ok_or(PluginContextError::RecordingUnavailable)?;
        recorder.record_call(parent, spec)
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("run_id", &self.run_id)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SECTION: Source Plugins
// ============================================================================

/// Field resolution computed by a normalizing source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldResolution {
    /// Mapping from original header name to normalized field name.
    pub mapping: std::collections::BTreeMap<String, String>,
    /// Version tag of the normalization algorithm, when applied.
    pub normalization_version: Option<String>,
}

/// One row yielded by a source.
///
/// Malformed rows are yielded as quarantined, never raised; only hard I/O
/// errors propagate through the iterator.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRow {
    /// A row that passed source validation.
    Valid(Map<String, Value>),
    /// A row that failed validation and carries its routing destination.
    Quarantined {
        /// The malformed row data, best-effort.
        row: Value,
        /// Where the row goes: discard or a named sink.
        destination: RouteTarget,
        /// Validation failure description.
        error: String,
    },
}

impl SourceRow {
    /// Creates a valid row.
    #[must_use]
    pub const fn valid(row: Map<String, Value>) -> Self {
        Self::Valid(row)
    }

    /// Creates a quarantined row.
    #[must_use]
    pub fn quarantined(row: Value, destination: RouteTarget, error: impl Into<String>) -> Self {
        Self::Quarantined { row, destination, error: error.into() }
    }
}

/// Errors raised by source plugins for hard failures.
#[derive(Debug, Error)]
pub enum SourceError {
    /// I/O failure opening or reading the source.
    #[error("source io error: {0}")]
    Io(String),
    /// Invalid source configuration.
    #[error("source configuration invalid: {0}")]
    InvalidConfig(String),
}

/// Source plugin contract: loads rows into the run.
pub trait SourcePlugin: Send {
    /// Plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn plugin_version(&self) -> &str;

    /// Determinism classification.
    fn determinism(&self) -> Determinism;

    /// Declared output contract.
    fn output_schema(&self) -> &SchemaContract;

    /// Destination sink for rows that pass validation.
    fn on_success(&self) -> &str;

    /// Destination for rows that fail validation.
    fn on_validation_failure(&self) -> &RouteTarget;

    /// Loads the source and returns the row stream.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] for hard I/O failures; malformed rows are
    /// yielded as [`SourceRow::Quarantined`], never as errors.
    fn load(
        &mut self,
        ctx: &PluginContext,
    ) -> Result<Box<dyn Iterator<Item = Result<SourceRow, SourceError>> + '_>, SourceError>;

    /// Returns the field resolution mapping computed during load.
    fn get_field_resolution(&self) -> Option<FieldResolution> {
        None
    }

    /// Returns the locked schema contract after inference.
    fn get_schema_contract(&self) -> Option<SchemaContract> {
        None
    }

    /// Called before load.
    fn on_start(&mut self, _ctx: &PluginContext) {}

    /// Called after load completes.
    fn on_complete(&mut self, _ctx: &PluginContext) {}

    /// Releases resources.
    fn close(&mut self) {}
}

// ============================================================================
// SECTION: Transform Plugins
// ============================================================================

/// Classification of a transform failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Ordinary transform error.
    Transform,
    /// Per-row or per-call timeout.
    Timeout,
    /// Provider rate-limit or saturation signal.
    Capacity,
}

/// Failure payload returned by a transform.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformFailure {
    /// Machine-readable failure reason.
    pub reason: Value,
    /// Whether the engine may retry the row.
    pub retryable: bool,
    /// Failure classification.
    pub kind: FailureKind,
}

/// Result of one transform invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformResult {
    /// Single output row.
    Success {
        /// Output row data keyed by normalized field name.
        row: Map<String, Value>,
        /// Optional machine-readable success reason.
        success_reason: Option<Value>,
    },
    /// Multiple output rows; only valid when the transform creates tokens or
    /// inside a passthrough aggregation.
    SuccessMulti {
        /// Output rows in emission order.
        rows: Vec<Map<String, Value>>,
    },
    /// Transform failure.
    Error(TransformFailure),
}

impl TransformResult {
    /// Creates a single-row success.
    #[must_use]
    pub const fn success(row: Map<String, Value>) -> Self {
        Self::Success { row, success_reason: None }
    }

    /// Creates a single-row success with a reason.
    #[must_use]
    pub const fn success_with_reason(row: Map<String, Value>, reason: Value) -> Self {
        Self::Success { row, success_reason: Some(reason) }
    }

    /// Creates a multi-row success.
    #[must_use]
    pub const fn success_multi(rows: Vec<Map<String, Value>>) -> Self {
        Self::SuccessMulti { rows }
    }

    /// Creates an ordinary transform error.
    #[must_use]
    pub const fn error(reason: Value, retryable: bool) -> Self {
        Self::Error(TransformFailure { reason, retryable, kind: FailureKind::Transform })
    }

    /// Creates a timeout failure.
    #[must_use]
    pub const fn timeout(reason: Value) -> Self {
        Self::Error(TransformFailure { reason, retryable: false, kind: FailureKind::Timeout })
    }

    /// Creates a capacity failure (rate limit or saturation).
    #[must_use]
    pub const fn capacity(reason: Value) -> Self {
        Self::Error(TransformFailure { reason, retryable: true, kind: FailureKind::Capacity })
    }
}

/// Transform plugin contract: processes rows one at a time, or in batches
/// when `is_batch_aware` returns true.
pub trait TransformPlugin: Send {
    /// Plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn plugin_version(&self) -> &str;

    /// Determinism classification.
    fn determinism(&self) -> Determinism;

    /// Required input contract.
    fn input_schema(&self) -> &SchemaContract;

    /// Guaranteed output contract.
    fn output_schema(&self) -> &SchemaContract;

    /// True when the transform processes buffered batches.
    fn is_batch_aware(&self) -> bool {
        false
    }

    /// True when `success_multi` may create new tokens (deaggregation).
    fn creates_tokens(&self) -> bool {
        false
    }

    /// True when the transform adds fields not present in its input contract.
    fn transform_adds_fields(&self) -> bool {
        false
    }

    /// Destination for rows the transform rejects.
    fn on_error(&self) -> &RouteTarget;

    /// Destination sink for rows that pass the whole pipeline via this
    /// transform's branch.
    fn on_success(&self) -> &str;

    /// Computes the output contract for an input contract when the transform
    /// reshapes schemas explicitly (renames, selections). `None` falls back
    /// to generic propagation.
    fn map_contract(&self, input: &SchemaContract) -> Option<SchemaContract> {
        let _ = input;
        None
    }

    /// Processes a single row.
    fn process(&mut self, row: PipelineRow, ctx: &PluginContext) -> TransformResult;

    /// Processes a buffered batch; only called when `is_batch_aware`.
    fn process_batch(&mut self, rows: Vec<PipelineRow>, ctx: &PluginContext) -> TransformResult {
        let _ = ctx;
        let _ = rows;
        TransformResult::error(
            Value::String("transform is not batch-aware".to_string()),
            false,
        )
    }

    /// Called at start of run.
    fn on_start(&mut self, _ctx: &PluginContext) {}

    /// Called at end of run.
    fn on_complete(&mut self, _ctx: &PluginContext) {}

    /// Releases resources.
    fn close(&mut self) {}
}

// ============================================================================
// SECTION: Gate Plugins
// ============================================================================

/// One ordered routing rule on a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRule {
    /// Label of the edge chosen when the condition matches.
    pub edge_label: String,
    /// Condition expression evaluated against the row by the engine.
    pub condition: String,
}

/// Gate plugin contract: declares ordered rules the engine evaluates.
///
/// The engine, not the plugin, compiles and evaluates rule expressions.
pub trait GatePlugin: Send {
    /// Plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn plugin_version(&self) -> &str;

    /// Determinism classification.
    fn determinism(&self) -> Determinism;

    /// Ordered routing rules; the first match wins.
    fn rules(&self) -> &[GateRule];

    /// Destination when no rule matches.
    fn on_no_match(&self) -> Option<&RouteTarget>;

    /// Routing mode applied to chosen edges.
    fn default_mode(&self) -> RoutingMode;
}

// ============================================================================
// SECTION: Sink Plugins
// ============================================================================

/// Artifact metadata returned by a sink write.
///
/// # Invariants
/// - `content_hash` and `size_bytes` are required; a sink that cannot supply
///   them must fail the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Path or URI of the produced artifact.
    pub path_or_uri: String,
    /// Content hash of the artifact bytes.
    pub content_hash: String,
    /// Artifact size in bytes.
    pub size_bytes: u64,
    /// Artifact type label (csv, json, webhook, ...).
    pub artifact_type: String,
    /// Idempotency key for retry deduplication.
    pub idempotency_key: Option<String>,
}

/// Result of validating an existing output target before append or resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputValidation {
    /// True when the existing target matches the configured schema.
    pub matches: bool,
    /// Human-readable reason when the target does not match.
    pub reason: Option<String>,
}

/// Errors raised by sink plugins.
#[derive(Debug, Error)]
pub enum SinkError {
    /// I/O failure writing the artifact.
    #[error("sink io error: {0}")]
    Io(String),
    /// Flush could not make the data durable.
    #[error("sink durability error: {0}")]
    Durability(String),
    /// The existing output target does not match the configured schema.
    #[error("sink target mismatch: {0}")]
    TargetMismatch(String),
    /// The sink does not support the requested mode.
    #[error("sink does not support {0}")]
    Unsupported(String),
}

/// Sink plugin contract: writes rows to a destination.
pub trait SinkPlugin: Send {
    /// Plugin name.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn plugin_version(&self) -> &str;

    /// Determinism classification.
    fn determinism(&self) -> Determinism;

    /// Required input contract.
    fn input_schema(&self) -> &SchemaContract;

    /// True when repeated writes of the same rows are safe.
    fn idempotent(&self) -> bool;

    /// True when the sink can participate in resume (durable flush +
    /// append mode).
    fn supports_resume(&self) -> bool;

    /// Writes a batch of rows and returns the artifact descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the write fails.
    fn write(
        &mut self,
        rows: &[PipelineRow],
        ctx: &PluginContext,
    ) -> Result<ArtifactDescriptor, SinkError>;

    /// Blocks until previously written data is durable.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Durability`] when durability cannot be
    /// established; the orchestrator treats this as fatal.
    fn flush(&mut self) -> Result<(), SinkError>;

    /// Switches the sink into append mode for resume.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Unsupported`] when the sink cannot resume.
    fn configure_for_resume(&mut self) -> Result<(), SinkError> {
        Err(SinkError::Unsupported("resume".to_string()))
    }

    /// Validates that the existing output target matches the configured
    /// schema before append or resume writes.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the target cannot be inspected.
    fn validate_output_target(&self) -> Result<OutputValidation, SinkError> {
        Ok(OutputValidation { matches: true, reason: None })
    }

    /// Supplies the source field-resolution mapping in resume mode, for
    /// header reconstruction.
    fn set_resume_field_resolution(&mut self, resolution: FieldResolution) {
        let _ = resolution;
    }

    /// Called at start of run.
    fn on_start(&mut self, _ctx: &PluginContext) {}

    /// Called at end of run.
    fn on_complete(&mut self, _ctx: &PluginContext) {}

    /// Releases resources.
    fn close(&mut self) {}
}

// ============================================================================
// SECTION: Plugin Invariants
// ============================================================================

/// Fatal plugin contract violations detected at orchestrator startup.
#[derive(Debug, Error)]
pub enum PluginInvariantViolation {
    /// Two plugins registered under the same name.
    #[error("duplicate plugin name: {0}")]
    DuplicateName(String),
    /// A plugin referenced a sink that is not configured.
    #[error("plugin '{plugin}' references unknown sink '{sink}'")]
    UnknownSink {
        /// Offending plugin name.
        plugin: String,
        /// Missing sink name.
        sink: String,
    },
    /// A gate rule failed to compile.
    #[error("gate '{gate}' rule '{label}' is invalid: {reason}")]
    InvalidGateRule {
        /// Offending gate name.
        gate: String,
        /// Edge label of the offending rule.
        label: String,
        /// Compilation failure reason.
        reason: String,
    },
    /// A required plugin attribute was empty.
    #[error("plugin '{plugin}' has an empty required attribute: {attribute}")]
    EmptyAttribute {
        /// Offending plugin name.
        plugin: String,
        /// Missing attribute name.
        attribute: &'static str,
    },
    /// A transform placed at an aggregation node is not batch-aware.
    #[error("aggregation transform '{0}' is not batch-aware")]
    NotBatchAware(String),
}

// ============================================================================
// SECTION: Payload Store
// ============================================================================

/// Reference to a stored payload, derived from its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadRef(String);

impl PayloadRef {
    /// Creates a reference from its string form.
    #[must_use]
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Returns the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Errors raised by payload stores.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// I/O failure accessing the store.
    #[error("payload store io error: {0}")]
    Io(String),
}

/// Content-addressed payload storage.
///
/// Writes are idempotent: identical content yields the identical reference.
/// Payloads may be purged by retention; callers must tolerate missing loads.
pub trait PayloadStore: Send + Sync {
    /// Stores bytes and returns the content-addressed reference.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Io`] when the write fails.
    fn store(&self, bytes: &[u8]) -> Result<PayloadRef, PayloadError>;

    /// Loads bytes by reference; `None` when purged or never stored.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Io`] when the read fails for reasons other
    /// than absence.
    fn load(&self, reference: &PayloadRef) -> Result<Option<Vec<u8>>, PayloadError>;

    /// Deletes a payload; absent references are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Io`] when the delete fails.
    fn delete(&self, reference: &PayloadRef) -> Result<(), PayloadError>;
}

// ============================================================================
// SECTION: Landscape Store
// ============================================================================

/// Errors raised by the Landscape store.
///
/// Integrity variants are the audit-integrity taxonomy: reads that produce
/// invalid enums, missing foreign keys, or duplicate terminal outcomes crash
/// immediately rather than repairing data.
#[derive(Debug, Error)]
pub enum LandscapeError {
    /// Store I/O failure.
    #[error("landscape io error: {0}")]
    Io(String),
    /// Audit integrity violation: invalid stored data.
    #[error("audit integrity error: {0}")]
    Integrity(String),
    /// Referential integrity violation: the parent record does not exist.
    #[error("missing {entity} '{id}' referenced by new record")]
    MissingParent {
        /// Parent entity kind.
        entity: &'static str,
        /// Parent identifier.
        id: String,
    },
    /// A terminal outcome already exists for the token.
    #[error("terminal outcome already recorded for token '{0}'")]
    TerminalOutcomeExists(TokenId),
    /// A node-state transition was requested from a non-open state.
    #[error("node state '{state_id}' is {status}, not open")]
    InvalidTransition {
        /// State the transition targeted.
        state_id: StateId,
        /// Status the state was found in.
        status: String,
    },
    /// The requested record does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Identifier looked up.
        id: String,
    },
    /// Multiple tokens match a lineage query and no disambiguator was given.
    #[error("ambiguous lineage: {0}")]
    AmbiguousLineage(String),
    /// The run is already terminal; its status cannot change again.
    #[error("run '{0}' already has a terminal status")]
    RunAlreadyTerminal(RunId),
    /// Canonicalization failure while hashing a payload.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// A stored outcome row is internally inconsistent.
    #[error(transparent)]
    Outcome(#[from] OutcomeError),
    /// A record violated its construction invariants.
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Registration payload for a node.
#[derive(Debug, Clone)]
pub struct NodeRegistration {
    /// Caller-supplied deterministic node id; generated when absent.
    pub node_id: Option<NodeId>,
    /// Plugin name.
    pub plugin_name: String,
    /// Node kind.
    pub node_type: NodeType,
    /// Plugin version string.
    pub plugin_version: String,
    /// Determinism classification.
    pub determinism: Determinism,
    /// Node configuration.
    pub config: Value,
    /// Schema mode label when the node declares a schema.
    pub schema_mode: Option<String>,
    /// Declared schema fields as JSON when explicit.
    pub schema_fields_json: Option<String>,
    /// Position in the pipeline declaration order.
    pub sequence_in_pipeline: Option<u32>,
}

/// Creation payload for a token.
#[derive(Debug, Clone, Default)]
pub struct TokenSpec {
    /// Caller-supplied token id; generated when absent.
    pub token_id: Option<TokenId>,
    /// Ordered parent tokens for joins.
    pub parents: Vec<TokenId>,
    /// Fork group when created by a COPY fan-out.
    pub fork_group_id: Option<GroupId>,
    /// Join group when created by a coalesce.
    pub join_group_id: Option<GroupId>,
    /// Expand group when created by deaggregation.
    pub expand_group_id: Option<GroupId>,
    /// Branch label the token was created on.
    pub branch_name: Option<String>,
    /// Step index at which the token was created.
    pub step_in_pipeline: Option<u32>,
}

/// Requested transition out of an open node state.
#[derive(Debug, Clone)]
pub enum CompletionRequest {
    /// Complete with an output row.
    Completed {
        /// Output row data.
        output: Value,
        /// Optional machine-readable success reason.
        success_reason: Option<Value>,
    },
    /// Mark as pending an async result.
    Pending,
    /// Fail with an error payload.
    Failed {
        /// Error payload.
        error: Option<Value>,
        /// Partial output when available.
        partial_output: Option<Value>,
    },
}

/// Export status update applied to a run.
#[derive(Debug, Clone, Default)]
pub struct ExportUpdate {
    /// New export status.
    pub export_status: Option<ExportStatus>,
    /// Export timestamp.
    pub exported_at: Option<Timestamp>,
    /// Export error message.
    pub export_error: Option<String>,
    /// Export format label.
    pub export_format: Option<String>,
    /// Export destination label.
    pub export_sink: Option<String>,
}

/// A source row with its resolved payload for explain output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowLineage {
    /// The row record.
    pub row: Row,
    /// Resolved payload data; `None` when purged.
    pub source_data: Option<Value>,
    /// Whether the payload was available at explain time.
    pub payload_available: bool,
}

/// Full lineage reconstruction for one token chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageResult {
    /// Source row with payload when available.
    pub source_row: RowLineage,
    /// Token chain in creation order.
    pub tokens: Vec<Token>,
    /// Node states in step order.
    pub node_states: Vec<NodeState>,
    /// Calls in call-index order.
    pub calls: Vec<Call>,
    /// Terminal outcome when one was recorded.
    pub outcome: Option<TokenOutcome>,
}

/// Snapshot of every record type for a run, used by the exporter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LandscapeSnapshot {
    /// Run records.
    pub runs: Vec<Run>,
    /// Node records.
    pub nodes: Vec<Node>,
    /// Edge records.
    pub edges: Vec<Edge>,
    /// Row records.
    pub rows: Vec<Row>,
    /// Token records.
    pub tokens: Vec<Token>,
    /// Token parent records.
    pub token_parents: Vec<TokenParent>,
    /// Node state records.
    pub node_states: Vec<NodeState>,
    /// Call records.
    pub calls: Vec<Call>,
    /// Operation records.
    pub operations: Vec<Operation>,
    /// Artifact records.
    pub artifacts: Vec<Artifact>,
    /// Routing event records.
    pub routing_events: Vec<RoutingEvent>,
    /// Batch records.
    pub batches: Vec<Batch>,
    /// Batch member records.
    pub batch_members: Vec<BatchMember>,
    /// Batch output records.
    pub batch_outputs: Vec<BatchOutput>,
    /// Checkpoint records.
    pub checkpoints: Vec<Checkpoint>,
    /// Token outcome records.
    pub token_outcomes: Vec<TokenOutcome>,
    /// Validation error records.
    pub validation_errors: Vec<ValidationErrorRecord>,
    /// Transform error records.
    pub transform_errors: Vec<TransformErrorRecord>,
}

/// Transactional store for every audit record.
///
/// All writes are per-record and transactional. Foreign-key violations and
/// terminal-uniqueness violations raise immediately; the store never
/// silently repairs data.
pub trait Landscape: Send + Sync {
    /// Opens a run.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the write fails.
    fn begin_run(&self, settings: &Value, canonical_version: &str) -> Result<Run, LandscapeError>;

    /// Loads a run by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, LandscapeError>;

    /// Sets the run status; terminal statuses may be set exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::RunAlreadyTerminal`] when the run already
    /// reached a terminal status.
    fn set_run_status(&self, run_id: &RunId, status: RunStatus) -> Result<(), LandscapeError>;

    /// Applies an export status update to a run.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the write fails.
    fn update_run_export(&self, run_id: &RunId, update: ExportUpdate)
    -> Result<(), LandscapeError>;

    /// Registers a node; idempotent on `(run_id, node_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the write fails or a re-registration
    /// conflicts with the stored record.
    fn register_node(
        &self,
        run_id: &RunId,
        registration: NodeRegistration,
    ) -> Result<Node, LandscapeError>;

    /// Registers an edge between two registered nodes.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::MissingParent`] when either node is
    /// unregistered.
    fn register_edge(
        &self,
        run_id: &RunId,
        from_node_id: &NodeId,
        to_node_id: &NodeId,
        label: &str,
        default_mode: RoutingMode,
    ) -> Result<Edge, LandscapeError>;

    /// Creates a row, hashing its data canonically and storing the payload
    /// when a payload store is configured.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when hashing or the write fails.
    fn create_row(
        &self,
        run_id: &RunId,
        source_node_id: &NodeId,
        row_index: u64,
        data: &Value,
        row_id: Option<RowId>,
    ) -> Result<Row, LandscapeError>;

    /// Returns all rows for a run in row-index order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_rows(&self, run_id: &RunId) -> Result<Vec<Row>, LandscapeError>;

    /// Loads a row's payload from the configured payload store.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails; absence yields `None`.
    fn load_row_payload(&self, row: &Row) -> Result<Option<Value>, LandscapeError>;

    /// Creates a token for a row.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::MissingParent`] when the row or a parent
    /// token does not exist.
    fn create_token(&self, row_id: &RowId, spec: TokenSpec) -> Result<Token, LandscapeError>;

    /// Returns all tokens for a row in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_tokens_for_row(&self, row_id: &RowId) -> Result<Vec<Token>, LandscapeError>;

    /// Opens a node state for a token at a step.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when hashing or the write fails.
    fn begin_node_state(
        &self,
        token_id: &TokenId,
        node_id: &NodeId,
        step_index: u32,
        input: &Value,
        attempt: u32,
    ) -> Result<NodeStateOpen, LandscapeError>;

    /// Transitions an open node state to completed, failed, or pending.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::InvalidTransition`] when the state is not
    /// open.
    fn complete_node_state(
        &self,
        state_id: &StateId,
        request: CompletionRequest,
        duration_ms: f64,
    ) -> Result<NodeState, LandscapeError>;

    /// Returns all node states for a token ordered by step then attempt.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_node_states_for_token(
        &self,
        token_id: &TokenId,
    ) -> Result<Vec<NodeState>, LandscapeError>;

    /// Records one external call under a node state or operation.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the parent is missing or
    /// `(parent, call_index)` already exists.
    fn record_call(&self, parent: &CallParent, spec: CallSpec) -> Result<Call, LandscapeError>;

    /// Begins a source- or sink-level operation.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the write fails.
    fn begin_operation(
        &self,
        run_id: &RunId,
        node_id: &NodeId,
        operation_type: OperationType,
    ) -> Result<Operation, LandscapeError>;

    /// Completes an operation.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the operation is missing or not open.
    fn complete_operation(
        &self,
        operation_id: &OperationId,
        status: OperationStatus,
        duration_ms: Option<f64>,
        error_message: Option<String>,
    ) -> Result<Operation, LandscapeError>;

    /// Records an artifact produced by a sink.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the write fails.
    fn record_artifact(
        &self,
        run_id: &RunId,
        sink_node_id: &NodeId,
        produced_by_state_id: Option<StateId>,
        descriptor: &ArtifactDescriptor,
    ) -> Result<Artifact, LandscapeError>;

    /// Records one gate routing decision.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the write fails.
    fn record_routing_event(
        &self,
        state_id: &StateId,
        edge_id: &EdgeId,
        routing_group_id: &GroupId,
        ordinal: u32,
        mode: RoutingMode,
        reason: Option<&Value>,
    ) -> Result<RoutingEvent, LandscapeError>;

    /// Creates a draft batch for an aggregation node.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the write fails.
    fn create_batch(
        &self,
        run_id: &RunId,
        aggregation_node_id: &NodeId,
    ) -> Result<Batch, LandscapeError>;

    /// Adds a token to a batch at the given ordinal.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the batch or token is missing.
    fn add_batch_member(
        &self,
        batch_id: &BatchId,
        token_id: &TokenId,
        ordinal: u32,
    ) -> Result<(), LandscapeError>;

    /// Updates a batch's status and optionally its trigger.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the batch is missing.
    fn update_batch_status(
        &self,
        batch_id: &BatchId,
        status: BatchStatus,
        trigger_type: Option<TriggerType>,
    ) -> Result<(), LandscapeError>;

    /// Records an output produced by a completed batch.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the batch is missing.
    fn record_batch_output(
        &self,
        batch_id: &BatchId,
        output_type: BatchOutputType,
        output_id: &str,
    ) -> Result<(), LandscapeError>;

    /// Returns batches in Draft, Executing, or Failed status for recovery.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_incomplete_batches(&self, run_id: &RunId) -> Result<Vec<Batch>, LandscapeError>;

    /// Retries a batch: increments its attempt and returns it to draft.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the batch is missing.
    fn retry_batch(
        &self,
        batch_id: &BatchId,
    ) -> Result<Batch, LandscapeError>;

    /// Records a token outcome; at most one terminal outcome per token.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::TerminalOutcomeExists`] when a terminal
    /// outcome is already recorded for the token.
    fn record_token_outcome(
        &self,
        run_id: &RunId,
        token_id: &TokenId,
        context: &OutcomeContext,
        context_json: Option<String>,
    ) -> Result<TokenOutcome, LandscapeError>;

    /// Returns the terminal outcome if any, otherwise the latest
    /// non-terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_token_outcome(
        &self,
        token_id: &TokenId,
    ) -> Result<Option<TokenOutcome>, LandscapeError>;

    /// Records a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the write fails.
    fn record_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), LandscapeError>;

    /// Returns the checkpoint with the highest sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_latest_checkpoint(&self, run_id: &RunId)
    -> Result<Option<Checkpoint>, LandscapeError>;

    /// Returns all checkpoints for a run in sequence order.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn get_checkpoints(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, LandscapeError>;

    /// Deletes all checkpoints for a run.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the delete fails.
    fn delete_checkpoints(&self, run_id: &RunId) -> Result<(), LandscapeError>;

    /// Records a validation error for a rejected source row.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the write fails.
    fn record_validation_error(
        &self,
        run_id: &RunId,
        node_id: Option<&NodeId>,
        row_data: &Value,
        error: &str,
        schema_mode: &str,
        destination: &str,
    ) -> Result<ValidationErrorRecord, LandscapeError>;

    /// Records a transform error.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::MissingParent`] when the token or node is
    /// missing.
    fn record_transform_error(
        &self,
        run_id: &RunId,
        token_id: &TokenId,
        transform_node_id: &NodeId,
        row_data: &Value,
        destination: &str,
        error_details: Option<&Value>,
    ) -> Result<TransformErrorRecord, LandscapeError>;

    /// Reconstructs the lineage for a row, optionally disambiguated by sink.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError::AmbiguousLineage`] when multiple tokens
    /// match and no disambiguator was supplied.
    fn explain_row(
        &self,
        run_id: &RunId,
        row_id: &RowId,
        sink: Option<&str>,
    ) -> Result<Option<LineageResult>, LandscapeError>;

    /// Reconstructs the lineage for a specific token.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn explain_token(&self, token_id: &TokenId) -> Result<Option<LineageResult>, LandscapeError>;

    /// Returns every record type for a run, for export.
    ///
    /// # Errors
    ///
    /// Returns [`LandscapeError`] when the read fails.
    fn export_snapshot(&self, run_id: &RunId) -> Result<LandscapeSnapshot, LandscapeError>;
}
