// crates/datatrail-core/src/core/records.rs
// ============================================================================
// Module: Datatrail Audit Records
// Description: Typed records for runs, graph registration, rows, and I/O.
// Purpose: Capture deterministic run evolution for lineage and verification.
// Dependencies: crate::core::{hashing, identifiers, time}, serde, thiserror
// ============================================================================

//! ## Overview
//! Audit records are the canonical copies of everything the engine does. The
//! Landscape store owns them; child records hold parent ids, never the
//! reverse. Enumerated fields are strictly typed: a cross-tier read that
//! would produce an invalid enum must fail loudly, never coerce.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::identifiers::ArtifactId;
use crate::core::identifiers::BatchId;
use crate::core::identifiers::CallId;
use crate::core::identifiers::CheckpointId;
use crate::core::identifiers::EdgeId;
use crate::core::identifiers::ErrorId;
use crate::core::identifiers::EventId;
use crate::core::identifiers::GroupId;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::OperationId;
use crate::core::identifiers::RowId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Record Errors
// ============================================================================

/// Errors raised when a record would violate its construction invariants.
#[derive(Debug, Error)]
pub enum RecordError {
    /// A required field was empty at construction.
    #[error("record field '{0}' is required and cannot be empty")]
    EmptyField(&'static str),
}

// ============================================================================
// SECTION: Run
// ============================================================================

/// Run lifecycle status.
///
/// # Invariants
/// - Variants are stable for serialization and store round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run is executing.
    Executing,
    /// Run completed successfully.
    Completed,
    /// Run failed.
    Failed,
}

/// Export lifecycle status for a run's audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    /// Export has not been attempted.
    NotExported,
    /// Export completed successfully.
    Exported,
    /// Export failed.
    Failed,
}

/// One execution of a pipeline.
///
/// # Invariants
/// - Terminal status is set exactly once by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier.
    pub run_id: RunId,
    /// Start timestamp.
    pub started_at: Timestamp,
    /// Canonical hashing version tag.
    pub canonical_version: String,
    /// Canonical hash of the pipeline configuration.
    pub config_hash: String,
    /// Settings blob as canonical JSON.
    pub settings_json: String,
    /// Run status.
    pub status: RunStatus,
    /// Completion timestamp when terminal.
    pub completed_at: Option<Timestamp>,
    /// Export status when export was attempted.
    pub export_status: Option<ExportStatus>,
    /// Export error message when export failed.
    pub export_error: Option<String>,
    /// Export timestamp.
    pub exported_at: Option<Timestamp>,
    /// Export format label.
    pub export_format: Option<String>,
    /// Export destination label.
    pub export_sink: Option<String>,
}

// ============================================================================
// SECTION: Node and Edge
// ============================================================================

/// Node kind in the execution graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Loads rows into the run.
    Source,
    /// Processes one row at a time.
    Transform,
    /// Buffers rows into batches.
    Aggregation,
    /// Joins tokens from multiple branches.
    Coalesce,
    /// Routes rows across labeled edges.
    Gate,
    /// Writes rows to a destination.
    Sink,
}

/// Determinism classification for a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Determinism {
    /// Pure function of its input.
    Deterministic,
    /// Calls an external service.
    ExternalCall,
    /// Writes to external storage.
    IoWrite,
    /// Output varies across runs by design.
    NonDeterministic,
}

/// A node (plugin instance) registered on a run.
///
/// # Invariants
/// - Immutable after registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier.
    pub node_id: NodeId,
    /// Run identifier.
    pub run_id: RunId,
    /// Plugin name.
    pub plugin_name: String,
    /// Node kind.
    pub node_type: NodeType,
    /// Plugin version string.
    pub plugin_version: String,
    /// Determinism classification.
    pub determinism: Determinism,
    /// Canonical hash of the node configuration.
    pub config_hash: String,
    /// Node configuration as canonical JSON.
    pub config_json: String,
    /// Registration timestamp.
    pub registered_at: Timestamp,
    /// Schema mode label when the node declares a schema.
    pub schema_mode: Option<String>,
    /// Declared schema fields as JSON when explicit.
    pub schema_fields_json: Option<String>,
    /// Position in the pipeline declaration order.
    pub sequence_in_pipeline: Option<u32>,
}

/// Routing mode for an edge or gate decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Token moves along the edge.
    Move,
    /// Token is cloned along the edge.
    Copy,
}

/// A directed edge in the execution graph.
///
/// # Invariants
/// - Parallel edges between the same node pair with different labels are
///   distinct and topology-significant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Edge identifier.
    pub edge_id: EdgeId,
    /// Run identifier.
    pub run_id: RunId,
    /// Source node of the edge.
    pub from_node_id: NodeId,
    /// Destination node of the edge.
    pub to_node_id: NodeId,
    /// Route label; at least "continue" for linear edges.
    pub label: String,
    /// Default routing mode.
    pub default_mode: RoutingMode,
    /// Creation timestamp.
    pub created_at: Timestamp,
}

// ============================================================================
// SECTION: Row and Token
// ============================================================================

/// A source row loaded into the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    /// Row identifier.
    pub row_id: RowId,
    /// Run identifier.
    pub run_id: RunId,
    /// Source node that yielded the row.
    pub source_node_id: NodeId,
    /// Position of the row in the source stream.
    pub row_index: u64,
    /// Canonical hash of the raw row data.
    pub source_data_hash: String,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Payload store reference when payload storage is configured.
    pub payload_ref: Option<String>,
}

/// A row instance traveling along one DAG path.
///
/// # Invariants
/// - Tokens are append-only; group ids are set when the token was created by
///   a fork, coalesce, or expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Token identifier.
    pub token_id: TokenId,
    /// Row the token belongs to.
    pub row_id: RowId,
    /// Creation timestamp.
    pub created_at: Timestamp,
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

/// Ordered parent relationship for multi-parent joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenParent {
    /// Child token identifier.
    pub token_id: TokenId,
    /// Parent token identifier.
    pub parent_token_id: TokenId,
    /// Position of the parent in the join order.
    pub ordinal: u32,
}

// ============================================================================
// SECTION: Calls and Operations
// ============================================================================

/// External call classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    /// HTTP request to an external service.
    Http,
    /// Large language model invocation.
    Llm,
    /// Database round trip.
    Database,
    /// Filesystem access.
    File,
    /// Anything else.
    Other,
}

/// External call completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Call succeeded.
    Success,
    /// Call failed.
    Failure,
}

/// Parent context for a call: a node state or an operation, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CallParent {
    /// Call made inside a transform's node state.
    State(StateId),
    /// Call made inside a source or sink operation.
    Operation(OperationId),
}

/// One external I/O call recorded against a node state or operation.
///
/// # Invariants
/// - `(parent, call_index)` is unique; the index is monotonic across retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Call identifier.
    pub call_id: CallId,
    /// Parent node state or operation.
    pub parent: CallParent,
    /// Position within the parent, monotonic across retries.
    pub call_index: u32,
    /// Call classification.
    pub call_type: CallType,
    /// Completion status.
    pub status: CallStatus,
    /// Canonical hash of the request payload.
    pub request_hash: String,
    /// Canonical hash of the response payload when present.
    pub response_hash: Option<String>,
    /// Error payload as canonical JSON when the call failed.
    pub error_json: Option<String>,
    /// Observed latency in milliseconds.
    pub latency_ms: Option<f64>,
    /// Creation timestamp.
    pub created_at: Timestamp,
}

/// Source- or sink-level I/O classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Source load pass.
    SourceLoad,
    /// Sink write pass.
    SinkWrite,
}

/// Operation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Operation in progress.
    Open,
    /// Operation completed but results pending.
    Pending,
    /// Operation completed.
    Completed,
    /// Operation failed.
    Failed,
}

/// Source- or sink-level I/O that is not attached to a token's node state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation identifier.
    pub operation_id: OperationId,
    /// Run identifier.
    pub run_id: RunId,
    /// Node performing the I/O.
    pub node_id: NodeId,
    /// Operation classification.
    pub operation_type: OperationType,
    /// Lifecycle status.
    pub status: OperationStatus,
    /// Start timestamp.
    pub started_at: Timestamp,
    /// Completion timestamp when finished.
    pub completed_at: Option<Timestamp>,
    /// Duration in milliseconds when finished.
    pub duration_ms: Option<f64>,
    /// Payload reference for operation input.
    pub input_data_ref: Option<String>,
    /// Payload reference for operation output.
    pub output_data_ref: Option<String>,
    /// Error message when the operation failed.
    pub error_message: Option<String>,
}

// ============================================================================
// SECTION: Artifacts and Routing
// ============================================================================

/// An artifact produced by a sink write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact identifier.
    pub artifact_id: ArtifactId,
    /// Run identifier.
    pub run_id: RunId,
    /// Node state that produced the artifact, when token-bound.
    pub produced_by_state_id: Option<StateId>,
    /// Sink node that wrote the artifact.
    pub sink_node_id: NodeId,
    /// Artifact type label (user-defined: csv, json, webhook, ...).
    pub artifact_type: String,
    /// Path or URI of the artifact.
    pub path_or_uri: String,
    /// Content hash of the artifact bytes.
    pub content_hash: String,
    /// Artifact size in bytes.
    pub size_bytes: u64,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Idempotency key for retry deduplication.
    pub idempotency_key: Option<String>,
}

/// A routing decision recorded at a gate node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEvent {
    /// Event identifier.
    pub event_id: EventId,
    /// Node state in which the decision was made.
    pub state_id: StateId,
    /// Edge chosen by the decision.
    pub edge_id: EdgeId,
    /// Group shared by decisions made together at one gate pass.
    pub routing_group_id: GroupId,
    /// Position within a multi-edge decision.
    pub ordinal: u32,
    /// Routing mode applied to the edge.
    pub mode: RoutingMode,
    /// Canonical hash of the decision reason.
    pub reason_hash: Option<String>,
    /// Creation timestamp.
    pub created_at: Timestamp,
}

// ============================================================================
// SECTION: Batches
// ============================================================================

/// Aggregation batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Collecting members.
    Draft,
    /// Flush in progress.
    Executing,
    /// Flush completed.
    Completed,
    /// Flush failed.
    Failed,
}

/// Cause that fired an aggregation flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Member count reached the configured threshold.
    Count,
    /// Buffer age exceeded the configured timeout.
    Time,
    /// Source exhausted with members still buffered.
    EndOfSource,
    /// Operator-requested flush.
    Manual,
}

/// An aggregation window collecting tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Batch identifier.
    pub batch_id: BatchId,
    /// Run identifier.
    pub run_id: RunId,
    /// Aggregation node that owns the batch.
    pub aggregation_node_id: NodeId,
    /// Execution attempt, incremented on retry.
    pub attempt: u32,
    /// Lifecycle status.
    pub status: BatchStatus,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Trigger that fired the flush when executed.
    pub trigger_type: Option<TriggerType>,
    /// Completion timestamp when terminal.
    pub completed_at: Option<Timestamp>,
}

/// A token belonging to a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMember {
    /// Batch identifier.
    pub batch_id: BatchId,
    /// Member token identifier.
    pub token_id: TokenId,
    /// Insertion order of the member.
    pub ordinal: u32,
}

/// Kind of output produced when a batch completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutputType {
    /// Output is a new token.
    Token,
    /// Output is a sink artifact.
    Artifact,
}

/// An output produced by a completed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutput {
    /// Batch identifier.
    pub batch_id: BatchId,
    /// Output kind.
    pub output_type: BatchOutputType,
    /// Identifier of the produced token or artifact.
    pub output_id: String,
}

// ============================================================================
// SECTION: Checkpoints
// ============================================================================

/// Current checkpoint format version.
///
/// Version 1 predates deterministic node identifiers and is explicitly
/// incompatible with resume.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 2;

/// A durable crash-recovery marker.
///
/// # Invariants
/// - Both hash fields are non-empty; construction fails otherwise.
/// - `sequence_number` is monotonic per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint identifier.
    pub checkpoint_id: CheckpointId,
    /// Run identifier.
    pub run_id: RunId,
    /// Token whose completion the checkpoint marks.
    pub token_id: TokenId,
    /// Node at which the checkpoint was taken.
    pub node_id: NodeId,
    /// Monotonic progress counter, proxied by row index.
    pub sequence_number: u64,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Canonical hash of the full upstream topology.
    pub upstream_topology_hash: String,
    /// Canonical hash of the checkpoint node's config only.
    pub checkpoint_node_config_hash: String,
    /// Serialized aggregation buffers when any were non-empty.
    pub aggregation_state_json: Option<String>,
    /// Checkpoint format version.
    pub format_version: u32,
}

impl Checkpoint {
    /// Creates a checkpoint, validating required hash fields.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::EmptyField`] when either hash is empty.
    #[expect(clippy::too_many_arguments, reason = "Flat audit record constructor.")]
    pub fn new(
        checkpoint_id: CheckpointId,
        run_id: RunId,
        token_id: TokenId,
        node_id: NodeId,
        sequence_number: u64,
        created_at: Timestamp,
        upstream_topology_hash: String,
        checkpoint_node_config_hash: String,
        aggregation_state_json: Option<String>,
    ) -> Result<Self, RecordError> {
        if upstream_topology_hash.is_empty() {
            return Err(RecordError::EmptyField("upstream_topology_hash"));
        }
        if checkpoint_node_config_hash.is_empty() {
            return Err(RecordError::EmptyField("checkpoint_node_config_hash"));
        }
        Ok(Self {
            checkpoint_id,
            run_id,
            token_id,
            node_id,
            sequence_number,
            created_at,
            upstream_topology_hash,
            checkpoint_node_config_hash,
            aggregation_state_json,
            format_version: CHECKPOINT_FORMAT_VERSION,
        })
    }
}

// ============================================================================
// SECTION: Error Records
// ============================================================================

/// A source row that failed schema validation.
///
/// Operational data errors, not system bugs; referenced nodes must outlive
/// the record (RESTRICT on delete).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrorRecord {
    /// Error identifier.
    pub error_id: ErrorId,
    /// Run identifier.
    pub run_id: RunId,
    /// Node that rejected the row, when known.
    pub node_id: Option<NodeId>,
    /// Canonical hash of the rejected row.
    pub row_hash: String,
    /// Validation failure description.
    pub error: String,
    /// Schema mode in force at rejection.
    pub schema_mode: String,
    /// Destination the row was routed to ("discard" or a sink name).
    pub destination: String,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Rejected row data as JSON when retained.
    pub row_data_json: Option<String>,
}

/// A transform processing error recorded in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformErrorRecord {
    /// Error identifier.
    pub error_id: ErrorId,
    /// Run identifier.
    pub run_id: RunId,
    /// Token whose processing failed.
    pub token_id: TokenId,
    /// Transform node that reported the error.
    pub transform_node_id: NodeId,
    /// Canonical hash of the failing row.
    pub row_hash: String,
    /// Destination the row was routed to ("discard" or a sink name).
    pub destination: String,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Failing row data as JSON when retained.
    pub row_data_json: Option<String>,
    /// Error details as canonical JSON.
    pub error_details_json: Option<String>,
}
