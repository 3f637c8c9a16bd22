// crates/datatrail-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Landscape Store
// Description: Durable Landscape backed by SQLite WAL.
// Purpose: Persist every audit record with referential integrity and the
//          terminal-outcome uniqueness guarantee enforced in the schema.
// Dependencies: datatrail-core, rusqlite, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! This module implements a durable [`Landscape`] using `SQLite`. Every write
//! is a per-record transaction; foreign keys use RESTRICT semantics so a
//! referenced parent can never be deleted, and a partial unique index on
//! `token_outcomes(token_id) WHERE is_terminal = 1` guarantees at most one
//! terminal outcome per token at the storage layer. Reads that produce
//! unknown enum labels fail loudly as audit integrity errors; the store never
//! repairs data.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use datatrail_core::Artifact;
use datatrail_core::ArtifactDescriptor;
use datatrail_core::ArtifactId;
use datatrail_core::Batch;
use datatrail_core::BatchId;
use datatrail_core::BatchMember;
use datatrail_core::BatchOutput;
use datatrail_core::BatchOutputType;
use datatrail_core::BatchStatus;
use datatrail_core::Call;
use datatrail_core::CallId;
use datatrail_core::CallParent;
use datatrail_core::CallSpec;
use datatrail_core::Checkpoint;
use datatrail_core::CheckpointId;
use datatrail_core::Clock;
use datatrail_core::CompletionRequest;
use datatrail_core::DEFAULT_HASH_ALGORITHM;
use datatrail_core::Determinism;
use datatrail_core::Edge;
use datatrail_core::EdgeId;
use datatrail_core::ErrorId;
use datatrail_core::EventId;
use datatrail_core::ExportStatus;
use datatrail_core::ExportUpdate;
use datatrail_core::GroupId;
use datatrail_core::IdGenerator;
use datatrail_core::Landscape;
use datatrail_core::LandscapeError;
use datatrail_core::LandscapeSnapshot;
use datatrail_core::LineageResult;
use datatrail_core::Node;
use datatrail_core::NodeId;
use datatrail_core::NodeRegistration;
use datatrail_core::NodeState;
use datatrail_core::NodeStateCompleted;
use datatrail_core::NodeStateFailed;
use datatrail_core::NodeStateHead;
use datatrail_core::NodeStateOpen;
use datatrail_core::NodeStatePending;
use datatrail_core::NodeType;
use datatrail_core::Operation;
use datatrail_core::OperationId;
use datatrail_core::OperationStatus;
use datatrail_core::OperationType;
use datatrail_core::OutcomeContext;
use datatrail_core::OutcomeId;
use datatrail_core::PayloadRef;
use datatrail_core::PayloadStore;
use datatrail_core::RoutingEvent;
use datatrail_core::RoutingMode;
use datatrail_core::Row;
use datatrail_core::RowId;
use datatrail_core::RowLineage;
use datatrail_core::Run;
use datatrail_core::RunId;
use datatrail_core::RunStatus;
use datatrail_core::StateId;
use datatrail_core::Timestamp;
use datatrail_core::Token;
use datatrail_core::TokenId;
use datatrail_core::TokenOutcome;
use datatrail_core::TokenParent;
use datatrail_core::TokenSpec;
use datatrail_core::TransformErrorRecord;
use datatrail_core::TriggerType;
use datatrail_core::ValidationErrorRecord;
use datatrail_core::canonical_json_bytes;
use datatrail_core::hash_canonical_json;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// `SQLite` schema version for the store.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteJournalMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteJournalMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the `SQLite` Landscape store.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteStoreConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteJournalMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl SqliteStoreConfig {
    /// Creates a config with defaults for the given path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteJournalMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// `SQLite` store open errors.
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// Store I/O error.
    #[error("sqlite store io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("sqlite store db error: {0}")]
    Db(String),
    /// Store schema version mismatch.
    #[error("sqlite store version mismatch: {0}")]
    VersionMismatch(String),
}

/// Maps a rusqlite error into a Landscape error, distinguishing constraint
/// violations (integrity) from I/O.
fn map_db_error(error: &rusqlite::Error) -> LandscapeError {
    if let rusqlite::Error::SqliteFailure(failure, message) = error
        && failure.code == ErrorCode::ConstraintViolation
    {
        return LandscapeError::Integrity(format!(
            "constraint violation: {}",
            message.clone().unwrap_or_else(|| failure.to_string())
        ));
    }
    LandscapeError::Io(error.to_string())
}

// ============================================================================
// SECTION: Schema
// ============================================================================

/// Full relational schema; table order satisfies foreign-key creation.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    started_at INTEGER NOT NULL,
    canonical_version TEXT NOT NULL,
    config_hash TEXT NOT NULL,
    settings_json TEXT NOT NULL,
    status TEXT NOT NULL,
    completed_at INTEGER,
    export_status TEXT,
    export_error TEXT,
    exported_at INTEGER,
    export_format TEXT,
    export_sink TEXT
);
CREATE TABLE IF NOT EXISTS nodes (
    node_id TEXT NOT NULL,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE RESTRICT,
    plugin_name TEXT NOT NULL,
    node_type TEXT NOT NULL,
    plugin_version TEXT NOT NULL,
    determinism TEXT NOT NULL,
    config_hash TEXT NOT NULL,
    config_json TEXT NOT NULL,
    registered_at INTEGER NOT NULL,
    schema_mode TEXT,
    schema_fields_json TEXT,
    sequence_in_pipeline INTEGER,
    PRIMARY KEY (run_id, node_id)
);
CREATE TABLE IF NOT EXISTS edges (
    edge_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE RESTRICT,
    from_node_id TEXT NOT NULL,
    to_node_id TEXT NOT NULL,
    label TEXT NOT NULL,
    default_mode TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (run_id, from_node_id, to_node_id, label),
    FOREIGN KEY (run_id, from_node_id)
        REFERENCES nodes(run_id, node_id) ON DELETE RESTRICT,
    FOREIGN KEY (run_id, to_node_id)
        REFERENCES nodes(run_id, node_id) ON DELETE RESTRICT
);
CREATE TABLE IF NOT EXISTS rows (
    row_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE RESTRICT,
    source_node_id TEXT NOT NULL,
    row_index INTEGER NOT NULL,
    source_data_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    payload_ref TEXT,
    FOREIGN KEY (run_id, source_node_id)
        REFERENCES nodes(run_id, node_id) ON DELETE RESTRICT
);
CREATE TABLE IF NOT EXISTS tokens (
    token_id TEXT PRIMARY KEY,
    row_id TEXT NOT NULL REFERENCES rows(row_id) ON DELETE RESTRICT,
    created_at INTEGER NOT NULL,
    fork_group_id TEXT,
    join_group_id TEXT,
    expand_group_id TEXT,
    branch_name TEXT,
    step_in_pipeline INTEGER
);
CREATE TABLE IF NOT EXISTS token_parents (
    token_id TEXT NOT NULL REFERENCES tokens(token_id) ON DELETE RESTRICT,
    parent_token_id TEXT NOT NULL REFERENCES tokens(token_id) ON DELETE RESTRICT,
    ordinal INTEGER NOT NULL,
    PRIMARY KEY (token_id, ordinal)
);
CREATE TABLE IF NOT EXISTS node_states (
    state_id TEXT PRIMARY KEY,
    token_id TEXT NOT NULL REFERENCES tokens(token_id) ON DELETE RESTRICT,
    node_id TEXT NOT NULL,
    step_index INTEGER NOT NULL,
    attempt INTEGER NOT NULL,
    status TEXT NOT NULL,
    input_hash TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    duration_ms REAL,
    output_hash TEXT,
    success_reason_json TEXT,
    error_json TEXT
);
CREATE TABLE IF NOT EXISTS operations (
    operation_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE RESTRICT,
    node_id TEXT NOT NULL,
    operation_type TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    duration_ms REAL,
    input_data_ref TEXT,
    output_data_ref TEXT,
    error_message TEXT,
    FOREIGN KEY (run_id, node_id)
        REFERENCES nodes(run_id, node_id) ON DELETE RESTRICT
);
CREATE TABLE IF NOT EXISTS calls (
    call_id TEXT PRIMARY KEY,
    state_id TEXT REFERENCES node_states(state_id) ON DELETE RESTRICT,
    operation_id TEXT REFERENCES operations(operation_id) ON DELETE RESTRICT,
    call_index INTEGER NOT NULL,
    call_type TEXT NOT NULL,
    status TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    response_hash TEXT,
    error_json TEXT,
    latency_ms REAL,
    created_at INTEGER NOT NULL,
    CHECK ((state_id IS NULL) != (operation_id IS NULL))
);
CREATE UNIQUE INDEX IF NOT EXISTS calls_state_call_index
    ON calls(state_id, call_index) WHERE state_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS calls_operation_call_index
    ON calls(operation_id, call_index) WHERE operation_id IS NOT NULL;
CREATE TABLE IF NOT EXISTS artifacts (
    artifact_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE RESTRICT,
    produced_by_state_id TEXT REFERENCES node_states(state_id) ON DELETE RESTRICT,
    sink_node_id TEXT NOT NULL,
    artifact_type TEXT NOT NULL,
    path_or_uri TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    idempotency_key TEXT
);
CREATE TABLE IF NOT EXISTS routing_events (
    event_id TEXT PRIMARY KEY,
    state_id TEXT NOT NULL REFERENCES node_states(state_id) ON DELETE RESTRICT,
    edge_id TEXT NOT NULL REFERENCES edges(edge_id) ON DELETE RESTRICT,
    routing_group_id TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    mode TEXT NOT NULL,
    reason_hash TEXT,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS batches (
    batch_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE RESTRICT,
    aggregation_node_id TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    trigger_type TEXT,
    completed_at INTEGER
);
CREATE TABLE IF NOT EXISTS batch_members (
    batch_id TEXT NOT NULL REFERENCES batches(batch_id) ON DELETE RESTRICT,
    token_id TEXT NOT NULL REFERENCES tokens(token_id) ON DELETE RESTRICT,
    ordinal INTEGER NOT NULL,
    PRIMARY KEY (batch_id, token_id, ordinal)
);
CREATE TABLE IF NOT EXISTS batch_outputs (
    batch_id TEXT NOT NULL REFERENCES batches(batch_id) ON DELETE RESTRICT,
    output_type TEXT NOT NULL,
    output_id TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS checkpoints (
    checkpoint_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE RESTRICT,
    token_id TEXT NOT NULL REFERENCES tokens(token_id) ON DELETE RESTRICT,
    node_id TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    upstream_topology_hash TEXT NOT NULL,
    checkpoint_node_config_hash TEXT NOT NULL,
    aggregation_state_json TEXT,
    format_version INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS token_outcomes (
    outcome_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE RESTRICT,
    token_id TEXT NOT NULL REFERENCES tokens(token_id) ON DELETE RESTRICT,
    outcome TEXT NOT NULL,
    is_terminal INTEGER NOT NULL,
    recorded_at INTEGER NOT NULL,
    sink_name TEXT,
    batch_id TEXT,
    fork_group_id TEXT,
    join_group_id TEXT,
    expand_group_id TEXT,
    error_hash TEXT,
    context_json TEXT,
    expected_branches_json TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS token_outcomes_terminal
    ON token_outcomes(token_id) WHERE is_terminal = 1;
CREATE TABLE IF NOT EXISTS validation_errors (
    error_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE RESTRICT,
    node_id TEXT,
    row_hash TEXT NOT NULL,
    error TEXT NOT NULL,
    schema_mode TEXT NOT NULL,
    destination TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    row_data_json TEXT
);
CREATE TABLE IF NOT EXISTS transform_errors (
    error_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE RESTRICT,
    token_id TEXT NOT NULL REFERENCES tokens(token_id) ON DELETE RESTRICT,
    transform_node_id TEXT NOT NULL,
    row_hash TEXT NOT NULL,
    destination TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    row_data_json TEXT,
    error_details_json TEXT
);
";

// ============================================================================
// SECTION: Enum Labels
// ============================================================================

/// Serializes a unit enum through its serde snake_case label.
fn enum_label<T: serde::Serialize>(value: &T) -> Result<String, LandscapeError> {
    match serde_json::to_value(value) {
        Ok(Value::String(label)) => Ok(label),
        Ok(other) => Err(LandscapeError::Integrity(format!(
            "enum did not serialize to a string label: {other}"
        ))),
        Err(err) => Err(LandscapeError::Integrity(err.to_string())),
    }
}

/// Parses a unit enum from its serde snake_case label; unknown labels are
/// audit integrity errors (Tier-1 rule).
fn parse_enum<T: serde::de::DeserializeOwned>(
    label: &str,
    what: &'static str,
) -> Result<T, LandscapeError> {
    serde_json::from_value(Value::String(label.to_string())).map_err(|_| {
        LandscapeError::Integrity(format!("invalid {what} label read from store: '{label}'"))
    })
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// `SQLite`-backed Landscape store with WAL support.
pub struct SqliteLandscape {
    /// Shared `SQLite` connection guarded by a mutex.
    connection: Arc<Mutex<Connection>>,
    /// Time source for record timestamps.
    clock: Arc<dyn Clock>,
    /// Optional content-addressed payload store.
    payloads: Option<Arc<dyn PayloadStore>>,
    /// Deterministic id generator guarded for interior mutability.
    ids: Mutex<IdGenerator>,
}

impl SqliteLandscape {
    /// Opens an `SQLite`-backed Landscape store.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the database cannot be opened or
    /// initialized.
    pub fn open(
        config: &SqliteStoreConfig,
        clock: Arc<dyn Clock>,
        payloads: Option<Arc<dyn PayloadStore>>,
    ) -> Result<Self, SqliteStoreError> {
        ensure_parent_dir(&config.path)?;
        let connection = Connection::open_with_flags(
            &config.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        connection
            .pragma_update(None, "journal_mode", config.journal_mode.pragma_value())
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        connection
            .pragma_update(None, "synchronous", config.sync_mode.pragma_value())
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        connection
            .busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        connection
            .pragma_update(None, "foreign_keys", "on")
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        connection
            .execute_batch(SCHEMA)
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        let stored_version: Option<i64> = connection
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        match stored_version {
            None => {
                connection
                    .execute(
                        "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                        params![SCHEMA_VERSION],
                    )
                    .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            }
            Some(version) if version == SCHEMA_VERSION => {}
            Some(version) => {
                return Err(SqliteStoreError::VersionMismatch(format!(
                    "store schema version {version}, expected {SCHEMA_VERSION}"
                )));
            }
        }
        // Seed the id generator with the store's current record count so a
        // reopened store never re-issues identifiers.
        let nonce: i64 = connection
            .query_row(
                "SELECT (SELECT COUNT(*) FROM tokens) + (SELECT COUNT(*) FROM node_states) \
                 + (SELECT COUNT(*) FROM runs)",
                [],
                |row| row.get(0),
            )
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        let ids = IdGenerator::new(format!("sqlite/{nonce}"));
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            clock,
            payloads,
            ids: Mutex::new(ids),
        })
    }

    /// Acquires the connection lock.
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LandscapeError> {
        self.connection
            .lock()
            .map_err(|_| LandscapeError::Io("sqlite connection mutex poisoned".to_string()))
    }

    /// Returns the next generated identifier for a kind.
    fn next_id(&self, kind: &str) -> Result<String, LandscapeError> {
        self.ids
            .lock()
            .map(|mut ids| ids.next_id(kind))
            .map_err(|_| LandscapeError::Io("id generator mutex poisoned".to_string()))
    }

    /// Current timestamp in unix millis.
    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Canonically hashes a value into its lowercase hex digest.
    fn hash_value(data: &Value) -> Result<String, LandscapeError> {
        Ok(hash_canonical_json(DEFAULT_HASH_ALGORITHM, data)?.value)
    }

    /// Verifies that a parent row exists.
    fn require_exists(
        connection: &Connection,
        sql: &str,
        id: &str,
        entity: &'static str,
    ) -> Result<(), LandscapeError> {
        let found: Option<i64> = connection
            .query_row(sql, params![id], |row| row.get(0))
            .optional()
            .map_err(|err| map_db_error(&err))?;
        if found.is_some() {
            return Ok(());
        }
        Err(LandscapeError::MissingParent { entity, id: id.to_string() })
    }

    /// Reads one token row.
    fn read_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<Token> {
        Ok(Token {
            token_id: TokenId::new(row.get::<_, String>(0)?),
            row_id: RowId::new(row.get::<_, String>(1)?),
            created_at: Timestamp::from_unix_millis(row.get(2)?),
            fork_group_id: row.get::<_, Option<String>>(3)?.map(GroupId::new),
            join_group_id: row.get::<_, Option<String>>(4)?.map(GroupId::new),
            expand_group_id: row.get::<_, Option<String>>(5)?.map(GroupId::new),
            branch_name: row.get(6)?,
            step_in_pipeline: row.get(7)?,
        })
    }

    /// Reads one source row record.
    fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
        Ok(Row {
            row_id: RowId::new(row.get::<_, String>(0)?),
            run_id: RunId::new(row.get::<_, String>(1)?),
            source_node_id: NodeId::new(row.get::<_, String>(2)?),
            row_index: row.get::<_, i64>(3)? as u64,
            source_data_hash: row.get(4)?,
            created_at: Timestamp::from_unix_millis(row.get(5)?),
            payload_ref: row.get(6)?,
        })
    }

    /// Reads one node-state row, rebuilding the tagged union.
    fn read_node_state(row: &rusqlite::Row<'_>) -> Result<NodeState, LandscapeError> {
        let state_id: String = row.get(0).map_err(|err| map_db_error(&err))?;
        let token_id: String = row.get(1).map_err(|err| map_db_error(&err))?;
        let node_id: String = row.get(2).map_err(|err| map_db_error(&err))?;
        let step_index: u32 = row.get(3).map_err(|err| map_db_error(&err))?;
        let attempt: u32 = row.get(4).map_err(|err| map_db_error(&err))?;
        let status: String = row.get(5).map_err(|err| map_db_error(&err))?;
        let input_hash: String = row.get(6).map_err(|err| map_db_error(&err))?;
        let started_at: i64 = row.get(7).map_err(|err| map_db_error(&err))?;
        let completed_at: Option<i64> = row.get(8).map_err(|err| map_db_error(&err))?;
        let duration_ms: Option<f64> = row.get(9).map_err(|err| map_db_error(&err))?;
        let output_hash: Option<String> = row.get(10).map_err(|err| map_db_error(&err))?;
        let success_reason_json: Option<String> = row.get(11).map_err(|err| map_db_error(&err))?;
        let error_json: Option<String> = row.get(12).map_err(|err| map_db_error(&err))?;
        let head = NodeStateHead {
            state_id: StateId::new(state_id.clone()),
            token_id: TokenId::new(token_id),
            node_id: NodeId::new(node_id),
            step_index,
            attempt,
            input_hash,
            started_at: Timestamp::from_unix_millis(started_at),
        };
        let missing = |field: &str| {
            LandscapeError::Integrity(format!(
                "node_state '{state_id}' with status '{status}' is missing {field}"
            ))
        };
        match status.as_str() {
            "open" => Ok(NodeState::Open(NodeStateOpen { head })),
            "pending" => Ok(NodeState::Pending(NodeStatePending {
                head,
                completed_at: Timestamp::from_unix_millis(
                    completed_at.ok_or_else(|| missing("completed_at"))?,
                ),
                duration_ms: duration_ms.ok_or_else(|| missing("duration_ms"))?,
            })),
            "completed" => Ok(NodeState::Completed(NodeStateCompleted {
                head,
                output_hash: output_hash.ok_or_else(|| missing("output_hash"))?,
                completed_at: Timestamp::from_unix_millis(
                    completed_at.ok_or_else(|| missing("completed_at"))?,
                ),
                duration_ms: duration_ms.ok_or_else(|| missing("duration_ms"))?,
                success_reason_json,
            })),
            "failed" => Ok(NodeState::Failed(NodeStateFailed {
                head,
                completed_at: Timestamp::from_unix_millis(
                    completed_at.ok_or_else(|| missing("completed_at"))?,
                ),
                duration_ms: duration_ms.ok_or_else(|| missing("duration_ms"))?,
                error_json,
                output_hash,
            })),
            other => Err(LandscapeError::Integrity(format!(
                "invalid node_state status read from store: '{other}'"
            ))),
        }
    }

    /// Reads one call row.
    fn read_call(row: &rusqlite::Row<'_>) -> Result<Call, LandscapeError> {
        let call_id: String = row.get(0).map_err(|err| map_db_error(&err))?;
        let state_id: Option<String> = row.get(1).map_err(|err| map_db_error(&err))?;
        let operation_id: Option<String> = row.get(2).map_err(|err| map_db_error(&err))?;
        let parent = match (state_id, operation_id) {
            (Some(state_id), None) => CallParent::State(StateId::new(state_id)),
            (None, Some(operation_id)) => {
                CallParent::Operation(OperationId::new(operation_id))
            }
            _ => {
                return Err(LandscapeError::Integrity(format!(
                    "call '{call_id}' violates the state/operation XOR constraint"
                )));
            }
        };
        Ok(Call {
            call_id: CallId::new(call_id),
            parent,
            call_index: row.get(3).map_err(|err| map_db_error(&err))?,
            call_type: parse_enum(
                &row.get::<_, String>(4).map_err(|err| map_db_error(&err))?,
                "call_type",
            )?,
            status: parse_enum(
                &row.get::<_, String>(5).map_err(|err| map_db_error(&err))?,
                "call_status",
            )?,
            request_hash: row.get(6).map_err(|err| map_db_error(&err))?,
            response_hash: row.get(7).map_err(|err| map_db_error(&err))?,
            error_json: row.get(8).map_err(|err| map_db_error(&err))?,
            latency_ms: row.get(9).map_err(|err| map_db_error(&err))?,
            created_at: Timestamp::from_unix_millis(
                row.get(10).map_err(|err| map_db_error(&err))?,
            ),
        })
    }

    /// Reads one outcome row and validates its context.
    fn read_outcome(row: &rusqlite::Row<'_>) -> Result<TokenOutcome, LandscapeError> {
        let outcome = TokenOutcome {
            outcome_id: OutcomeId::new(row.get::<_, String>(0).map_err(|err| map_db_error(&err))?),
            run_id: RunId::new(row.get::<_, String>(1).map_err(|err| map_db_error(&err))?),
            token_id: TokenId::new(row.get::<_, String>(2).map_err(|err| map_db_error(&err))?),
            outcome: parse_enum(
                &row.get::<_, String>(3).map_err(|err| map_db_error(&err))?,
                "row_outcome",
            )?,
            is_terminal: row.get(4).map_err(|err| map_db_error(&err))?,
            recorded_at: Timestamp::from_unix_millis(
                row.get(5).map_err(|err| map_db_error(&err))?,
            ),
            sink_name: row.get(6).map_err(|err| map_db_error(&err))?,
            batch_id: row
                .get::<_, Option<String>>(7)
                .map_err(|err| map_db_error(&err))?
                .map(BatchId::new),
            fork_group_id: row
                .get::<_, Option<String>>(8)
                .map_err(|err| map_db_error(&err))?
                .map(GroupId::new),
            join_group_id: row
                .get::<_, Option<String>>(9)
                .map_err(|err| map_db_error(&err))?
                .map(GroupId::new),
            expand_group_id: row
                .get::<_, Option<String>>(10)
                .map_err(|err| map_db_error(&err))?
                .map(GroupId::new),
            error_hash: row.get(11).map_err(|err| map_db_error(&err))?,
            context_json: row.get(12).map_err(|err| map_db_error(&err))?,
            expected_branches_json: row.get(13).map_err(|err| map_db_error(&err))?,
        };
        outcome.validate()?;
        Ok(outcome)
    }

    /// Reads one batch row.
    fn read_batch(row: &rusqlite::Row<'_>) -> Result<Batch, LandscapeError> {
        Ok(Batch {
            batch_id: BatchId::new(row.get::<_, String>(0).map_err(|err| map_db_error(&err))?),
            run_id: RunId::new(row.get::<_, String>(1).map_err(|err| map_db_error(&err))?),
            aggregation_node_id: NodeId::new(
                row.get::<_, String>(2).map_err(|err| map_db_error(&err))?,
            ),
            attempt: row.get(3).map_err(|err| map_db_error(&err))?,
            status: parse_enum(
                &row.get::<_, String>(4).map_err(|err| map_db_error(&err))?,
                "batch_status",
            )?,
            created_at: Timestamp::from_unix_millis(
                row.get(5).map_err(|err| map_db_error(&err))?,
            ),
            trigger_type: row
                .get::<_, Option<String>>(6)
                .map_err(|err| map_db_error(&err))?
                .map(|label| parse_enum(&label, "trigger_type"))
                .transpose()?,
            completed_at: row
                .get::<_, Option<i64>>(7)
                .map_err(|err| map_db_error(&err))?
                .map(Timestamp::from_unix_millis),
        })
    }

    /// Reads one checkpoint row.
    fn read_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Checkpoint> {
        Ok(Checkpoint {
            checkpoint_id: CheckpointId::new(row.get::<_, String>(0)?),
            run_id: RunId::new(row.get::<_, String>(1)?),
            token_id: TokenId::new(row.get::<_, String>(2)?),
            node_id: NodeId::new(row.get::<_, String>(3)?),
            sequence_number: row.get::<_, i64>(4)? as u64,
            created_at: Timestamp::from_unix_millis(row.get(5)?),
            upstream_topology_hash: row.get(6)?,
            checkpoint_node_config_hash: row.get(7)?,
            aggregation_state_json: row.get(8)?,
            format_version: row.get(9)?,
        })
    }

    /// Reads one run row.
    fn read_run(row: &rusqlite::Row<'_>) -> Result<Run, LandscapeError> {
        Ok(Run {
            run_id: RunId::new(row.get::<_, String>(0).map_err(|err| map_db_error(&err))?),
            started_at: Timestamp::from_unix_millis(
                row.get(1).map_err(|err| map_db_error(&err))?,
            ),
            canonical_version: row.get(2).map_err(|err| map_db_error(&err))?,
            config_hash: row.get(3).map_err(|err| map_db_error(&err))?,
            settings_json: row.get(4).map_err(|err| map_db_error(&err))?,
            status: parse_enum(
                &row.get::<_, String>(5).map_err(|err| map_db_error(&err))?,
                "run_status",
            )?,
            completed_at: row
                .get::<_, Option<i64>>(6)
                .map_err(|err| map_db_error(&err))?
                .map(Timestamp::from_unix_millis),
            export_status: row
                .get::<_, Option<String>>(7)
                .map_err(|err| map_db_error(&err))?
                .map(|label| parse_enum::<ExportStatus>(&label, "export_status"))
                .transpose()?,
            export_error: row.get(8).map_err(|err| map_db_error(&err))?,
            exported_at: row
                .get::<_, Option<i64>>(9)
                .map_err(|err| map_db_error(&err))?
                .map(Timestamp::from_unix_millis),
            export_format: row.get(10).map_err(|err| map_db_error(&err))?,
            export_sink: row.get(11).map_err(|err| map_db_error(&err))?,
        })
    }
}

/// Creates the database's parent directory when missing.
fn ensure_parent_dir(path: &Path) -> Result<(), SqliteStoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|err| SqliteStoreError::Io(err.to_string()))?;
    }
    Ok(())
}

// ============================================================================
// SECTION: Landscape Implementation
// ============================================================================

impl Landscape for SqliteLandscape {
    fn begin_run(&self, settings: &Value, canonical_version: &str) -> Result<Run, LandscapeError> {
        let config_hash = Self::hash_value(settings)?;
        let run_id = self.next_id("run")?;
        let started_at = self.now();
        let run = Run {
            run_id: RunId::new(run_id),
            started_at,
            canonical_version: canonical_version.to_string(),
            config_hash,
            settings_json: settings.to_string(),
            status: RunStatus::Executing,
            completed_at: None,
            export_status: None,
            export_error: None,
            exported_at: None,
            export_format: None,
            export_sink: None,
        };
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO runs (run_id, started_at, canonical_version, config_hash, \
                 settings_json, status) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run.run_id.as_str(),
                    run.started_at.as_unix_millis(),
                    run.canonical_version,
                    run.config_hash,
                    run.settings_json,
                    enum_label(&run.status)?,
                ],
            )
            .map_err(|err| map_db_error(&err))?;
        Ok(run)
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, LandscapeError> {
        let connection = self.lock()?;
        connection
            .query_row(
                "SELECT run_id, started_at, canonical_version, config_hash, settings_json, \
                 status, completed_at, export_status, export_error, exported_at, export_format, \
                 export_sink FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| Ok(Self::read_run(row)),
            )
            .optional()
            .map_err(|err| map_db_error(&err))?
            .transpose()
    }

    fn set_run_status(&self, run_id: &RunId, status: RunStatus) -> Result<(), LandscapeError> {
        let now = self.now();
        let connection = self.lock()?;
        let current: Option<String> = connection
            .query_row(
                "SELECT status FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| map_db_error(&err))?;
        let Some(current) = current else {
            return Err(LandscapeError::NotFound { entity: "run", id: run_id.to_string() });
        };
        let current: RunStatus = parse_enum(&current, "run_status")?;
        if current != RunStatus::Executing {
            return Err(LandscapeError::RunAlreadyTerminal(run_id.clone()));
        }
        let completed_at =
            (status != RunStatus::Executing).then(|| now.as_unix_millis());
        connection
            .execute(
                "UPDATE runs SET status = ?2, completed_at = ?3 WHERE run_id = ?1",
                params![run_id.as_str(), enum_label(&status)?, completed_at],
            )
            .map_err(|err| map_db_error(&err))?;
        Ok(())
    }

    fn update_run_export(
        &self,
        run_id: &RunId,
        update: ExportUpdate,
    ) -> Result<(), LandscapeError> {
        let connection = self.lock()?;
        Self::require_exists(
            &connection,
            "SELECT 1 FROM runs WHERE run_id = ?1",
            run_id.as_str(),
            "run",
        )?;
        connection
            .execute(
                "UPDATE runs SET \
                 export_status = COALESCE(?2, export_status), \
                 exported_at = COALESCE(?3, exported_at), \
                 export_error = COALESCE(?4, export_error), \
                 export_format = COALESCE(?5, export_format), \
                 export_sink = COALESCE(?6, export_sink) \
                 WHERE run_id = ?1",
                params![
                    run_id.as_str(),
                    update.export_status.map(|status| enum_label(&status)).transpose()?,
                    update.exported_at.map(Timestamp::as_unix_millis),
                    update.export_error,
                    update.export_format,
                    update.export_sink,
                ],
            )
            .map_err(|err| map_db_error(&err))?;
        Ok(())
    }

    fn register_node(
        &self,
        run_id: &RunId,
        registration: NodeRegistration,
    ) -> Result<Node, LandscapeError> {
        let config_hash = Self::hash_value(&registration.config)?;
        let node_id = match registration.node_id {
            Some(node_id) => node_id,
            None => NodeId::new(self.next_id("node")?),
        };
        let connection = self.lock()?;
        Self::require_exists(
            &connection,
            "SELECT 1 FROM runs WHERE run_id = ?1",
            run_id.as_str(),
            "run",
        )?;
        let existing: Option<(String, String)> = connection
            .query_row(
                "SELECT config_hash, plugin_name FROM nodes WHERE run_id = ?1 AND node_id = ?2",
                params![run_id.as_str(), node_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|err| map_db_error(&err))?;
        if let Some((existing_hash, existing_name)) = existing {
            if existing_hash == config_hash && existing_name == registration.plugin_name {
                // Idempotent re-registration (resume).
                let row = connection
                    .query_row(
                        "SELECT node_id, run_id, plugin_name, node_type, plugin_version, \
                         determinism, config_hash, config_json, registered_at, schema_mode, \
                         schema_fields_json, sequence_in_pipeline FROM nodes WHERE run_id = ?1 \
                         AND node_id = ?2",
                        params![run_id.as_str(), node_id.as_str()],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, String>(3)?,
                                row.get::<_, String>(4)?,
                                row.get::<_, String>(5)?,
                                row.get::<_, String>(6)?,
                                row.get::<_, String>(7)?,
                                row.get::<_, i64>(8)?,
                                row.get::<_, Option<String>>(9)?,
                                row.get::<_, Option<String>>(10)?,
                                row.get::<_, Option<u32>>(11)?,
                            ))
                        },
                    )
                    .map_err(|err| map_db_error(&err))?;
                return Ok(Node {
                    node_id: NodeId::new(row.0),
                    run_id: RunId::new(row.1),
                    plugin_name: row.2,
                    node_type: parse_enum(&row.3, "node_type")?,
                    plugin_version: row.4,
                    determinism: parse_enum(&row.5, "determinism")?,
                    config_hash: row.6,
                    config_json: row.7,
                    registered_at: Timestamp::from_unix_millis(row.8),
                    schema_mode: row.9,
                    schema_fields_json: row.10,
                    sequence_in_pipeline: row.11,
                });
            }
            return Err(LandscapeError::Integrity(format!(
                "node '{node_id}' re-registered with different configuration"
            )));
        }
        let node = Node {
            node_id: node_id.clone(),
            run_id: run_id.clone(),
            plugin_name: registration.plugin_name,
            node_type: registration.node_type,
            plugin_version: registration.plugin_version,
            determinism: registration.determinism,
            config_hash,
            config_json: registration.config.to_string(),
            registered_at: self.now(),
            schema_mode: registration.schema_mode,
            schema_fields_json: registration.schema_fields_json,
            sequence_in_pipeline: registration.sequence_in_pipeline,
        };
        connection
            .execute(
                "INSERT INTO nodes (node_id, run_id, plugin_name, node_type, plugin_version, \
                 determinism, config_hash, config_json, registered_at, schema_mode, \
                 schema_fields_json, sequence_in_pipeline) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    node.node_id.as_str(),
                    node.run_id.as_str(),
                    node.plugin_name,
                    enum_label(&node.node_type)?,
                    node.plugin_version,
                    enum_label(&node.determinism)?,
                    node.config_hash,
                    node.config_json,
                    node.registered_at.as_unix_millis(),
                    node.schema_mode,
                    node.schema_fields_json,
                    node.sequence_in_pipeline,
                ],
            )
            .map_err(|err| map_db_error(&err))?;
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
        let connection = self.lock()?;
        // Re-registration on resume is idempotent.
        let existing = connection
            .query_row(
                "SELECT edge_id, default_mode, created_at FROM edges WHERE run_id = ?1 AND \
                 from_node_id = ?2 AND to_node_id = ?3 AND label = ?4",
                params![run_id.as_str(), from_node_id.as_str(), to_node_id.as_str(), label],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|err| map_db_error(&err))?;
        if let Some((edge_id, mode, created_at)) = existing {
            return Ok(Edge {
                edge_id: EdgeId::new(edge_id),
                run_id: run_id.clone(),
                from_node_id: from_node_id.clone(),
                to_node_id: to_node_id.clone(),
                label: label.to_string(),
                default_mode: parse_enum(&mode, "routing_mode")?,
                created_at: Timestamp::from_unix_millis(created_at),
            });
        }
        drop(connection);
        let edge = Edge {
            edge_id: EdgeId::new(self.next_id("edge")?),
            run_id: run_id.clone(),
            from_node_id: from_node_id.clone(),
            to_node_id: to_node_id.clone(),
            label: label.to_string(),
            default_mode,
            created_at: self.now(),
        };
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO edges (edge_id, run_id, from_node_id, to_node_id, label, \
                 default_mode, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    edge.edge_id.as_str(),
                    edge.run_id.as_str(),
                    edge.from_node_id.as_str(),
                    edge.to_node_id.as_str(),
                    edge.label,
                    enum_label(&edge.default_mode)?,
                    edge.created_at.as_unix_millis(),
                ],
            )
            .map_err(|err| map_db_error(&err))?;
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
        let payload_ref = match &self.payloads {
            Some(payloads) => {
                let bytes = canonical_json_bytes(data)?;
                Some(
                    payloads
                        .store(&bytes)
                        .map_err(|err| LandscapeError::Io(err.to_string()))?,
                )
            }
            None => None,
        };
        let row = Row {
            row_id: match row_id {
                Some(row_id) => row_id,
                None => RowId::new(self.next_id("row")?),
            },
            run_id: run_id.clone(),
            source_node_id: source_node_id.clone(),
            row_index,
            source_data_hash,
            created_at: self.now(),
            payload_ref: payload_ref.map(|reference| reference.as_str().to_string()),
        };
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO rows (row_id, run_id, source_node_id, row_index, source_data_hash, \
                 created_at, payload_ref) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.row_id.as_str(),
                    row.run_id.as_str(),
                    row.source_node_id.as_str(),
                    row.row_index as i64,
                    row.source_data_hash,
                    row.created_at.as_unix_millis(),
                    row.payload_ref,
                ],
            )
            .map_err(|err| map_db_error(&err))?;
        Ok(row)
    }

    fn get_rows(&self, run_id: &RunId) -> Result<Vec<Row>, LandscapeError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT row_id, run_id, source_node_id, row_index, source_data_hash, created_at, \
                 payload_ref FROM rows WHERE run_id = ?1 ORDER BY row_index",
            )
            .map_err(|err| map_db_error(&err))?;
        let rows = statement
            .query_map(params![run_id.as_str()], Self::read_row)
            .map_err(|err| map_db_error(&err))?
            .collect::<Result<Vec<Row>, _>>()
            .map_err(|err| map_db_error(&err))?;
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
        let value: Value = serde_json::from_slice(&bytes).map_err(|err| {
            LandscapeError::Integrity(format!("stored payload is not JSON: {err}"))
        })?;
        Ok(Some(value))
    }

    fn create_token(&self, row_id: &RowId, spec: TokenSpec) -> Result<Token, LandscapeError> {
        let token = Token {
            token_id: match spec.token_id {
                Some(token_id) => token_id,
                None => TokenId::new(self.next_id("tok")?),
            },
            row_id: row_id.clone(),
            created_at: self.now(),
            fork_group_id: spec.fork_group_id,
            join_group_id: spec.join_group_id,
            expand_group_id: spec.expand_group_id,
            branch_name: spec.branch_name,
            step_in_pipeline: spec.step_in_pipeline,
        };
        let mut connection = self.lock()?;
        let tx = connection.transaction().map_err(|err| map_db_error(&err))?;
        Self::require_exists(
            &tx,
            "SELECT 1 FROM rows WHERE row_id = ?1",
            row_id.as_str(),
            "row",
        )?;
        for parent in &spec.parents {
            Self::require_exists(
                &tx,
                "SELECT 1 FROM tokens WHERE token_id = ?1",
                parent.as_str(),
                "token",
            )?;
        }
        tx.execute(
            "INSERT INTO tokens (token_id, row_id, created_at, fork_group_id, join_group_id, \
             expand_group_id, branch_name, step_in_pipeline) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                token.token_id.as_str(),
                token.row_id.as_str(),
                token.created_at.as_unix_millis(),
                token.fork_group_id.as_ref().map(GroupId::as_str),
                token.join_group_id.as_ref().map(GroupId::as_str),
                token.expand_group_id.as_ref().map(GroupId::as_str),
                token.branch_name,
                token.step_in_pipeline,
            ],
        )
        .map_err(|err| map_db_error(&err))?;
        for (ordinal, parent) in spec.parents.iter().enumerate() {
            tx.execute(
                "INSERT INTO token_parents (token_id, parent_token_id, ordinal) \
                 VALUES (?1, ?2, ?3)",
                params![
                    token.token_id.as_str(),
                    parent.as_str(),
                    u32::try_from(ordinal).map_err(|_| {
                        LandscapeError::Integrity("token parent ordinal overflow".to_string())
                    })?,
                ],
            )
            .map_err(|err| map_db_error(&err))?;
        }
        tx.commit().map_err(|err| map_db_error(&err))?;
        Ok(token)
    }

    fn get_tokens_for_row(&self, row_id: &RowId) -> Result<Vec<Token>, LandscapeError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT token_id, row_id, created_at, fork_group_id, join_group_id, \
                 expand_group_id, branch_name, step_in_pipeline FROM tokens WHERE row_id = ?1 \
                 ORDER BY created_at, token_id",
            )
            .map_err(|err| map_db_error(&err))?;
        let tokens = statement
            .query_map(params![row_id.as_str()], Self::read_token)
            .map_err(|err| map_db_error(&err))?
            .collect::<Result<Vec<Token>, _>>()
            .map_err(|err| map_db_error(&err))?;
        Ok(tokens)
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
        let state = NodeStateOpen {
            head: NodeStateHead {
                state_id: StateId::new(self.next_id("st")?),
                token_id: token_id.clone(),
                node_id: node_id.clone(),
                step_index,
                attempt,
                input_hash,
                started_at: self.now(),
            },
        };
        let connection = self.lock()?;
        Self::require_exists(
            &connection,
            "SELECT 1 FROM tokens WHERE token_id = ?1",
            token_id.as_str(),
            "token",
        )?;
        Self::require_exists(
            &connection,
            "SELECT 1 FROM nodes WHERE node_id = ?1",
            node_id.as_str(),
            "node",
        )?;
        connection
            .execute(
                "INSERT INTO node_states (state_id, token_id, node_id, step_index, attempt, \
                 status, input_hash, started_at) VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6, ?7)",
                params![
                    state.head.state_id.as_str(),
                    state.head.token_id.as_str(),
                    state.head.node_id.as_str(),
                    state.head.step_index,
                    state.head.attempt,
                    state.head.input_hash,
                    state.head.started_at.as_unix_millis(),
                ],
            )
            .map_err(|err| map_db_error(&err))?;
        Ok(state)
    }

    fn complete_node_state(
        &self,
        state_id: &StateId,
        request: CompletionRequest,
        duration_ms: f64,
    ) -> Result<NodeState, LandscapeError> {
        let completed_at = self.now();
        let connection = self.lock()?;
        let status: Option<String> = connection
            .query_row(
                "SELECT status FROM node_states WHERE state_id = ?1",
                params![state_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| map_db_error(&err))?;
        let Some(status) = status else {
            return Err(LandscapeError::NotFound {
                entity: "node_state",
                id: state_id.to_string(),
            });
        };
        if status != "open" {
            return Err(LandscapeError::InvalidTransition { state_id: state_id.clone(), status });
        }
        match request {
            CompletionRequest::Completed { output, success_reason } => {
                let output_hash = Self::hash_value(&output)?;
                connection
                    .execute(
                        "UPDATE node_states SET status = 'completed', output_hash = ?2, \
                         completed_at = ?3, duration_ms = ?4, success_reason_json = ?5 \
                         WHERE state_id = ?1",
                        params![
                            state_id.as_str(),
                            output_hash,
                            completed_at.as_unix_millis(),
                            duration_ms,
                            success_reason.as_ref().map(std::string::ToString::to_string),
                        ],
                    )
                    .map_err(|err| map_db_error(&err))?;
            }
            CompletionRequest::Pending => {
                connection
                    .execute(
                        "UPDATE node_states SET status = 'pending', completed_at = ?2, \
                         duration_ms = ?3 WHERE state_id = ?1",
                        params![
                            state_id.as_str(),
                            completed_at.as_unix_millis(),
                            duration_ms,
                        ],
                    )
                    .map_err(|err| map_db_error(&err))?;
            }
            CompletionRequest::Failed { error, partial_output } => {
                let output_hash = match &partial_output {
                    Some(output) => Some(Self::hash_value(output)?),
                    None => None,
                };
                connection
                    .execute(
                        "UPDATE node_states SET status = 'failed', completed_at = ?2, \
                         duration_ms = ?3, error_json = ?4, output_hash = ?5 WHERE state_id = ?1",
                        params![
                            state_id.as_str(),
                            completed_at.as_unix_millis(),
                            duration_ms,
                            error.as_ref().map(std::string::ToString::to_string),
                            output_hash,
                        ],
                    )
                    .map_err(|err| map_db_error(&err))?;
            }
        }
        let state = connection
            .query_row(
                "SELECT state_id, token_id, node_id, step_index, attempt, status, input_hash, \
                 started_at, completed_at, duration_ms, output_hash, success_reason_json, \
                 error_json FROM node_states WHERE state_id = ?1",
                params![state_id.as_str()],
                |row| Ok(Self::read_node_state(row)),
            )
            .map_err(|err| map_db_error(&err))??;
        Ok(state)
    }

    fn get_node_states_for_token(
        &self,
        token_id: &TokenId,
    ) -> Result<Vec<NodeState>, LandscapeError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT state_id, token_id, node_id, step_index, attempt, status, input_hash, \
                 started_at, completed_at, duration_ms, output_hash, success_reason_json, \
                 error_json FROM node_states WHERE token_id = ?1 ORDER BY step_index, attempt",
            )
            .map_err(|err| map_db_error(&err))?;
        let states = statement
            .query_map(params![token_id.as_str()], |row| Ok(Self::read_node_state(row)))
            .map_err(|err| map_db_error(&err))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| map_db_error(&err))?
            .into_iter()
            .collect::<Result<Vec<NodeState>, LandscapeError>>()?;
        Ok(states)
    }

    fn record_call(&self, parent: &CallParent, spec: CallSpec) -> Result<Call, LandscapeError> {
        let request_hash = Self::hash_value(&spec.request_data)?;
        let response_hash = match &spec.response_data {
            Some(response) => Some(Self::hash_value(response)?),
            None => None,
        };
        let call = Call {
            call_id: CallId::new(self.next_id("call")?),
            parent: parent.clone(),
            call_index: spec.call_index,
            call_type: spec.call_type,
            status: spec.status,
            request_hash,
            response_hash,
            error_json: spec.error.as_ref().map(std::string::ToString::to_string),
            latency_ms: spec.latency_ms,
            created_at: self.now(),
        };
        let (state_id, operation_id) = match parent {
            CallParent::State(state_id) => (Some(state_id.as_str()), None),
            CallParent::Operation(operation_id) => (None, Some(operation_id.as_str())),
        };
        let connection = self.lock()?;
        if let Some(state_id) = state_id {
            Self::require_exists(
                &connection,
                "SELECT 1 FROM node_states WHERE state_id = ?1",
                state_id,
                "node_state",
            )?;
        }
        if let Some(operation_id) = operation_id {
            Self::require_exists(
                &connection,
                "SELECT 1 FROM operations WHERE operation_id = ?1",
                operation_id,
                "operation",
            )?;
        }
        connection
            .execute(
                "INSERT INTO calls (call_id, state_id, operation_id, call_index, call_type, \
                 status, request_hash, response_hash, error_json, latency_ms, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    call.call_id.as_str(),
                    state_id,
                    operation_id,
                    call.call_index,
                    enum_label(&call.call_type)?,
                    enum_label(&call.status)?,
                    call.request_hash,
                    call.response_hash,
                    call.error_json,
                    call.latency_ms,
                    call.created_at.as_unix_millis(),
                ],
            )
            .map_err(|err| map_db_error(&err))?;
        Ok(call)
    }

    fn begin_operation(
        &self,
        run_id: &RunId,
        node_id: &NodeId,
        operation_type: OperationType,
    ) -> Result<Operation, LandscapeError> {
        let operation = Operation {
            operation_id: OperationId::new(self.next_id("op")?),
            run_id: run_id.clone(),
            node_id: node_id.clone(),
            operation_type,
            status: OperationStatus::Open,
            started_at: self.now(),
            completed_at: None,
            duration_ms: None,
            input_data_ref: None,
            output_data_ref: None,
            error_message: None,
        };
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO operations (operation_id, run_id, node_id, operation_type, status, \
                 started_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    operation.operation_id.as_str(),
                    operation.run_id.as_str(),
                    operation.node_id.as_str(),
                    enum_label(&operation.operation_type)?,
                    enum_label(&operation.status)?,
                    operation.started_at.as_unix_millis(),
                ],
            )
            .map_err(|err| map_db_error(&err))?;
        Ok(operation)
    }

    fn complete_operation(
        &self,
        operation_id: &OperationId,
        status: OperationStatus,
        duration_ms: Option<f64>,
        error_message: Option<String>,
    ) -> Result<Operation, LandscapeError> {
        let completed_at = self.now();
        let connection = self.lock()?;
        let current: Option<String> = connection
            .query_row(
                "SELECT status FROM operations WHERE operation_id = ?1",
                params![operation_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| map_db_error(&err))?;
        let Some(current) = current else {
            return Err(LandscapeError::NotFound {
                entity: "operation",
                id: operation_id.to_string(),
            });
        };
        if current != "open" {
            return Err(LandscapeError::InvalidTransition {
                state_id: StateId::new(operation_id.as_str()),
                status: current,
            });
        }
        connection
            .execute(
                "UPDATE operations SET status = ?2, completed_at = ?3, duration_ms = ?4, \
                 error_message = ?5 WHERE operation_id = ?1",
                params![
                    operation_id.as_str(),
                    enum_label(&status)?,
                    completed_at.as_unix_millis(),
                    duration_ms,
                    error_message,
                ],
            )
            .map_err(|err| map_db_error(&err))?;
        let operation = connection
            .query_row(
                "SELECT operation_id, run_id, node_id, operation_type, status, started_at, \
                 completed_at, duration_ms, input_data_ref, output_data_ref, error_message \
                 FROM operations WHERE operation_id = ?1",
                params![operation_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, Option<i64>>(6)?,
                        row.get::<_, Option<f64>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                    ))
                },
            )
            .map_err(|err| map_db_error(&err))?;
        Ok(Operation {
            operation_id: OperationId::new(operation.0),
            run_id: RunId::new(operation.1),
            node_id: NodeId::new(operation.2),
            operation_type: parse_enum(&operation.3, "operation_type")?,
            status: parse_enum(&operation.4, "operation_status")?,
            started_at: Timestamp::from_unix_millis(operation.5),
            completed_at: operation.6.map(Timestamp::from_unix_millis),
            duration_ms: operation.7,
            input_data_ref: operation.8,
            output_data_ref: operation.9,
            error_message: operation.10,
        })
    }

    fn record_artifact(
        &self,
        run_id: &RunId,
        sink_node_id: &NodeId,
        produced_by_state_id: Option<StateId>,
        descriptor: &ArtifactDescriptor,
    ) -> Result<Artifact, LandscapeError> {
        let artifact = Artifact {
            artifact_id: ArtifactId::new(self.next_id("art")?),
            run_id: run_id.clone(),
            produced_by_state_id,
            sink_node_id: sink_node_id.clone(),
            artifact_type: descriptor.artifact_type.clone(),
            path_or_uri: descriptor.path_or_uri.clone(),
            content_hash: descriptor.content_hash.clone(),
            size_bytes: descriptor.size_bytes,
            created_at: self.now(),
            idempotency_key: descriptor.idempotency_key.clone(),
        };
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO artifacts (artifact_id, run_id, produced_by_state_id, sink_node_id, \
                 artifact_type, path_or_uri, content_hash, size_bytes, created_at, \
                 idempotency_key) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    artifact.artifact_id.as_str(),
                    artifact.run_id.as_str(),
                    artifact.produced_by_state_id.as_ref().map(StateId::as_str),
                    artifact.sink_node_id.as_str(),
                    artifact.artifact_type,
                    artifact.path_or_uri,
                    artifact.content_hash,
                    artifact.size_bytes as i64,
                    artifact.created_at.as_unix_millis(),
                    artifact.idempotency_key,
                ],
            )
            .map_err(|err| map_db_error(&err))?;
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
        let event = RoutingEvent {
            event_id: EventId::new(self.next_id("evt")?),
            state_id: state_id.clone(),
            edge_id: edge_id.clone(),
            routing_group_id: routing_group_id.clone(),
            ordinal,
            mode,
            reason_hash,
            created_at: self.now(),
        };
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO routing_events (event_id, state_id, edge_id, routing_group_id, \
                 ordinal, mode, reason_hash, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.event_id.as_str(),
                    event.state_id.as_str(),
                    event.edge_id.as_str(),
                    event.routing_group_id.as_str(),
                    event.ordinal,
                    enum_label(&event.mode)?,
                    event.reason_hash,
                    event.created_at.as_unix_millis(),
                ],
            )
            .map_err(|err| map_db_error(&err))?;
        Ok(event)
    }

    fn create_batch(
        &self,
        run_id: &RunId,
        aggregation_node_id: &NodeId,
    ) -> Result<Batch, LandscapeError> {
        let batch = Batch {
            batch_id: BatchId::new(self.next_id("batch")?),
            run_id: run_id.clone(),
            aggregation_node_id: aggregation_node_id.clone(),
            attempt: 1,
            status: BatchStatus::Draft,
            created_at: self.now(),
            trigger_type: None,
            completed_at: None,
        };
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO batches (batch_id, run_id, aggregation_node_id, attempt, status, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    batch.batch_id.as_str(),
                    batch.run_id.as_str(),
                    batch.aggregation_node_id.as_str(),
                    batch.attempt,
                    enum_label(&batch.status)?,
                    batch.created_at.as_unix_millis(),
                ],
            )
            .map_err(|err| map_db_error(&err))?;
        Ok(batch)
    }

    fn add_batch_member(
        &self,
        batch_id: &BatchId,
        token_id: &TokenId,
        ordinal: u32,
    ) -> Result<(), LandscapeError> {
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO batch_members (batch_id, token_id, ordinal) VALUES (?1, ?2, ?3)",
                params![batch_id.as_str(), token_id.as_str(), ordinal],
            )
            .map_err(|err| map_db_error(&err))?;
        Ok(())
    }

    fn update_batch_status(
        &self,
        batch_id: &BatchId,
        status: BatchStatus,
        trigger_type: Option<TriggerType>,
    ) -> Result<(), LandscapeError> {
        let now = self.now();
        let completed_at = matches!(status, BatchStatus::Completed | BatchStatus::Failed)
            .then(|| now.as_unix_millis());
        let connection = self.lock()?;
        let updated = connection
            .execute(
                "UPDATE batches SET status = ?2, \
                 trigger_type = COALESCE(?3, trigger_type), \
                 completed_at = COALESCE(?4, completed_at) WHERE batch_id = ?1",
                params![
                    batch_id.as_str(),
                    enum_label(&status)?,
                    trigger_type.map(|trigger| enum_label(&trigger)).transpose()?,
                    completed_at,
                ],
            )
            .map_err(|err| map_db_error(&err))?;
        if updated == 0 {
            return Err(LandscapeError::NotFound { entity: "batch", id: batch_id.to_string() });
        }
        Ok(())
    }

    fn record_batch_output(
        &self,
        batch_id: &BatchId,
        output_type: BatchOutputType,
        output_id: &str,
    ) -> Result<(), LandscapeError> {
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO batch_outputs (batch_id, output_type, output_id) \
                 VALUES (?1, ?2, ?3)",
                params![batch_id.as_str(), enum_label(&output_type)?, output_id],
            )
            .map_err(|err| map_db_error(&err))?;
        Ok(())
    }

    fn get_incomplete_batches(&self, run_id: &RunId) -> Result<Vec<Batch>, LandscapeError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT batch_id, run_id, aggregation_node_id, attempt, status, created_at, \
                 trigger_type, completed_at FROM batches WHERE run_id = ?1 AND status IN \
                 ('draft', 'executing', 'failed') ORDER BY created_at",
            )
            .map_err(|err| map_db_error(&err))?;
        let batches = statement
            .query_map(params![run_id.as_str()], |row| Ok(Self::read_batch(row)))
            .map_err(|err| map_db_error(&err))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| map_db_error(&err))?
            .into_iter()
            .collect::<Result<Vec<Batch>, LandscapeError>>()?;
        Ok(batches)
    }

    fn retry_batch(&self, batch_id: &BatchId) -> Result<Batch, LandscapeError> {
        let connection = self.lock()?;
        let updated = connection
            .execute(
                "UPDATE batches SET attempt = attempt + 1, status = 'draft', \
                 trigger_type = NULL, completed_at = NULL WHERE batch_id = ?1",
                params![batch_id.as_str()],
            )
            .map_err(|err| map_db_error(&err))?;
        if updated == 0 {
            return Err(LandscapeError::NotFound { entity: "batch", id: batch_id.to_string() });
        }
        let batch = connection
            .query_row(
                "SELECT batch_id, run_id, aggregation_node_id, attempt, status, created_at, \
                 trigger_type, completed_at FROM batches WHERE batch_id = ?1",
                params![batch_id.as_str()],
                |row| Ok(Self::read_batch(row)),
            )
            .map_err(|err| map_db_error(&err))??;
        Ok(batch)
    }

    fn record_token_outcome(
        &self,
        run_id: &RunId,
        token_id: &TokenId,
        context: &OutcomeContext,
        context_json: Option<String>,
    ) -> Result<TokenOutcome, LandscapeError> {
        let outcome = TokenOutcome::from_context(
            OutcomeId::new(self.next_id("out")?),
            run_id.clone(),
            token_id.clone(),
            self.now(),
            context,
            context_json,
        );
        outcome.validate()?;
        let connection = self.lock()?;
        Self::require_exists(
            &connection,
            "SELECT 1 FROM runs WHERE run_id = ?1",
            run_id.as_str(),
            "run",
        )?;
        Self::require_exists(
            &connection,
            "SELECT 1 FROM tokens WHERE token_id = ?1",
            token_id.as_str(),
            "token",
        )?;
        let insert = connection.execute(
            "INSERT INTO token_outcomes (outcome_id, run_id, token_id, outcome, is_terminal, \
             recorded_at, sink_name, batch_id, fork_group_id, join_group_id, expand_group_id, \
             error_hash, context_json, expected_branches_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                outcome.outcome_id.as_str(),
                outcome.run_id.as_str(),
                outcome.token_id.as_str(),
                enum_label(&outcome.outcome)?,
                outcome.is_terminal,
                outcome.recorded_at.as_unix_millis(),
                outcome.sink_name,
                outcome.batch_id.as_ref().map(BatchId::as_str),
                outcome.fork_group_id.as_ref().map(GroupId::as_str),
                outcome.join_group_id.as_ref().map(GroupId::as_str),
                outcome.expand_group_id.as_ref().map(GroupId::as_str),
                outcome.error_hash,
                outcome.context_json,
                outcome.expected_branches_json,
            ],
        );
        match insert {
            Ok(_) => Ok(outcome),
            Err(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation && outcome.is_terminal =>
            {
                // The partial unique index rejects a second terminal outcome
                // per statement.
                Err(LandscapeError::TerminalOutcomeExists(token_id.clone()))
            }
            Err(err) => Err(map_db_error(&err)),
        }
    }

    fn get_token_outcome(
        &self,
        token_id: &TokenId,
    ) -> Result<Option<TokenOutcome>, LandscapeError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT outcome_id, run_id, token_id, outcome, is_terminal, recorded_at, \
                 sink_name, batch_id, fork_group_id, join_group_id, expand_group_id, error_hash, \
                 context_json, expected_branches_json FROM token_outcomes WHERE token_id = ?1 \
                 ORDER BY is_terminal DESC, recorded_at DESC LIMIT 1",
            )
            .map_err(|err| map_db_error(&err))?;
        let outcome = statement
            .query_row(params![token_id.as_str()], |row| Ok(Self::read_outcome(row)))
            .optional()
            .map_err(|err| map_db_error(&err))?
            .transpose()?;
        Ok(outcome)
    }

    fn record_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), LandscapeError> {
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO checkpoints (checkpoint_id, run_id, token_id, node_id, \
                 sequence_number, created_at, upstream_topology_hash, \
                 checkpoint_node_config_hash, aggregation_state_json, format_version) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    checkpoint.checkpoint_id.as_str(),
                    checkpoint.run_id.as_str(),
                    checkpoint.token_id.as_str(),
                    checkpoint.node_id.as_str(),
                    checkpoint.sequence_number as i64,
                    checkpoint.created_at.as_unix_millis(),
                    checkpoint.upstream_topology_hash,
                    checkpoint.checkpoint_node_config_hash,
                    checkpoint.aggregation_state_json,
                    checkpoint.format_version,
                ],
            )
            .map_err(|err| map_db_error(&err))?;
        Ok(())
    }

    fn get_latest_checkpoint(
        &self,
        run_id: &RunId,
    ) -> Result<Option<Checkpoint>, LandscapeError> {
        let connection = self.lock()?;
        let checkpoint = connection
            .query_row(
                "SELECT checkpoint_id, run_id, token_id, node_id, sequence_number, created_at, \
                 upstream_topology_hash, checkpoint_node_config_hash, aggregation_state_json, \
                 format_version FROM checkpoints WHERE run_id = ?1 \
                 ORDER BY sequence_number DESC LIMIT 1",
                params![run_id.as_str()],
                Self::read_checkpoint,
            )
            .optional()
            .map_err(|err| map_db_error(&err))?;
        Ok(checkpoint)
    }

    fn get_checkpoints(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, LandscapeError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT checkpoint_id, run_id, token_id, node_id, sequence_number, created_at, \
                 upstream_topology_hash, checkpoint_node_config_hash, aggregation_state_json, \
                 format_version FROM checkpoints WHERE run_id = ?1 ORDER BY sequence_number",
            )
            .map_err(|err| map_db_error(&err))?;
        let checkpoints = statement
            .query_map(params![run_id.as_str()], Self::read_checkpoint)
            .map_err(|err| map_db_error(&err))?
            .collect::<Result<Vec<Checkpoint>, _>>()
            .map_err(|err| map_db_error(&err))?;
        Ok(checkpoints)
    }

    fn delete_checkpoints(&self, run_id: &RunId) -> Result<(), LandscapeError> {
        let connection = self.lock()?;
        connection
            .execute("DELETE FROM checkpoints WHERE run_id = ?1", params![run_id.as_str()])
            .map_err(|err| map_db_error(&err))?;
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
        let record = ValidationErrorRecord {
            error_id: ErrorId::new(self.next_id("verr")?),
            run_id: run_id.clone(),
            node_id: node_id.cloned(),
            row_hash: Self::hash_value(row_data)?,
            error: error.to_string(),
            schema_mode: schema_mode.to_string(),
            destination: destination.to_string(),
            created_at: self.now(),
            row_data_json: Some(row_data.to_string()),
        };
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO validation_errors (error_id, run_id, node_id, row_hash, error, \
                 schema_mode, destination, created_at, row_data_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.error_id.as_str(),
                    record.run_id.as_str(),
                    record.node_id.as_ref().map(NodeId::as_str),
                    record.row_hash,
                    record.error,
                    record.schema_mode,
                    record.destination,
                    record.created_at.as_unix_millis(),
                    record.row_data_json,
                ],
            )
            .map_err(|err| map_db_error(&err))?;
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
        let record = TransformErrorRecord {
            error_id: ErrorId::new(self.next_id("terr")?),
            run_id: run_id.clone(),
            token_id: token_id.clone(),
            transform_node_id: transform_node_id.clone(),
            row_hash: Self::hash_value(row_data)?,
            destination: destination.to_string(),
            created_at: self.now(),
            row_data_json: Some(row_data.to_string()),
            error_details_json: error_details.map(std::string::ToString::to_string),
        };
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO transform_errors (error_id, run_id, token_id, transform_node_id, \
                 row_hash, destination, created_at, row_data_json, error_details_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.error_id.as_str(),
                    record.run_id.as_str(),
                    record.token_id.as_str(),
                    record.transform_node_id.as_str(),
                    record.row_hash,
                    record.destination,
                    record.created_at.as_unix_millis(),
                    record.row_data_json,
                    record.error_details_json,
                ],
            )
            .map_err(|err| map_db_error(&err))?;
        Ok(record)
    }

    fn explain_row(
        &self,
        run_id: &RunId,
        row_id: &RowId,
        sink: Option<&str>,
    ) -> Result<Option<LineageResult>, LandscapeError> {
        let row = {
            let connection = self.lock()?;
            connection
                .query_row(
                    "SELECT row_id, run_id, source_node_id, row_index, source_data_hash, \
                     created_at, payload_ref FROM rows WHERE run_id = ?1 AND row_id = ?2",
                    params![run_id.as_str(), row_id.as_str()],
                    Self::read_row,
                )
                .optional()
                .map_err(|err| map_db_error(&err))?
        };
        let Some(_) = row else {
            return Ok(None);
        };
        let tokens = self.get_tokens_for_row(row_id)?;
        let mut matching = Vec::new();
        for token in tokens {
            let Some(outcome) = self.get_token_outcome(&token.token_id)? else {
                continue;
            };
            if !outcome.is_terminal {
                continue;
            }
            if let Some(sink) = sink
                && outcome.sink_name.as_deref() != Some(sink)
            {
                continue;
            }
            matching.push(token);
        }
        if matching.len() > 1 {
            return Err(LandscapeError::AmbiguousLineage(format!(
                "row '{row_id}' has {} terminal tokens; supply a sink to disambiguate",
                matching.len()
            )));
        }
        match matching.into_iter().next() {
            Some(token) => self.explain_token(&token.token_id),
            None => Ok(None),
        }
    }

    fn explain_token(&self, token_id: &TokenId) -> Result<Option<LineageResult>, LandscapeError> {
        let token = {
            let connection = self.lock()?;
            connection
                .query_row(
                    "SELECT token_id, row_id, created_at, fork_group_id, join_group_id, \
                     expand_group_id, branch_name, step_in_pipeline FROM tokens \
                     WHERE token_id = ?1",
                    params![token_id.as_str()],
                    Self::read_token,
                )
                .optional()
                .map_err(|err| map_db_error(&err))?
        };
        let Some(token) = token else {
            return Ok(None);
        };

        // Walk ancestors so forked and coalesced chains explain end to end.
        let mut chain: Vec<Token> = Vec::new();
        let mut pending = vec![token.token_id.clone()];
        let mut seen = std::collections::BTreeSet::new();
        while let Some(current) = pending.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let connection = self.lock()?;
            let found = connection
                .query_row(
                    "SELECT token_id, row_id, created_at, fork_group_id, join_group_id, \
                     expand_group_id, branch_name, step_in_pipeline FROM tokens \
                     WHERE token_id = ?1",
                    params![current.as_str()],
                    Self::read_token,
                )
                .optional()
                .map_err(|err| map_db_error(&err))?;
            if let Some(found) = found {
                chain.push(found);
            }
            let mut statement = connection
                .prepare("SELECT parent_token_id FROM token_parents WHERE token_id = ?1")
                .map_err(|err| map_db_error(&err))?;
            let parents = statement
                .query_map(params![current.as_str()], |row| {
                    Ok(TokenId::new(row.get::<_, String>(0)?))
                })
                .map_err(|err| map_db_error(&err))?
                .collect::<Result<Vec<TokenId>, _>>()
                .map_err(|err| map_db_error(&err))?;
            pending.extend(parents);
        }
        chain.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut node_states = Vec::new();
        for member in &chain {
            node_states.extend(self.get_node_states_for_token(&member.token_id)?);
        }
        node_states.sort_by(|a, b| {
            (a.head().step_index, a.head().attempt).cmp(&(b.head().step_index, b.head().attempt))
        });

        let mut calls = Vec::new();
        {
            let connection = self.lock()?;
            for state in &node_states {
                let mut statement = connection
                    .prepare(
                        "SELECT call_id, state_id, operation_id, call_index, call_type, status, \
                         request_hash, response_hash, error_json, latency_ms, created_at FROM \
                         calls WHERE state_id = ?1 ORDER BY call_index",
                    )
                    .map_err(|err| map_db_error(&err))?;
                let state_calls = statement
                    .query_map(params![state.head().state_id.as_str()], |row| {
                        Ok(Self::read_call(row))
                    })
                    .map_err(|err| map_db_error(&err))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| map_db_error(&err))?
                    .into_iter()
                    .collect::<Result<Vec<Call>, LandscapeError>>()?;
                calls.extend(state_calls);
            }
        }

        let outcome = self
            .get_token_outcome(&token.token_id)?
            .filter(|outcome| outcome.is_terminal);

        let source_row = {
            let connection = self.lock()?;
            connection
                .query_row(
                    "SELECT row_id, run_id, source_node_id, row_index, source_data_hash, \
                     created_at, payload_ref FROM rows WHERE row_id = ?1",
                    params![token.row_id.as_str()],
                    Self::read_row,
                )
                .map_err(|err| map_db_error(&err))?
        };
        let (source_data, payload_available) = match self.load_row_payload(&source_row)? {
            Some(value) => (Some(value), true),
            None => (None, false),
        };

        Ok(Some(LineageResult {
            source_row: RowLineage { row: source_row, source_data, payload_available },
            tokens: chain,
            node_states,
            calls,
            outcome,
        }))
    }

    fn export_snapshot(&self, run_id: &RunId) -> Result<LandscapeSnapshot, LandscapeError> {
        let mut snapshot = LandscapeSnapshot::default();
        if let Some(run) = self.get_run(run_id)? {
            snapshot.runs.push(run);
        }
        let connection = self.lock()?;
        // Nodes.
        {
            let mut statement = connection
                .prepare(
                    "SELECT node_id, run_id, plugin_name, node_type, plugin_version, \
                     determinism, config_hash, config_json, registered_at, schema_mode, \
                     schema_fields_json, sequence_in_pipeline FROM nodes WHERE run_id = ?1 \
                     ORDER BY sequence_in_pipeline, node_id",
                )
                .map_err(|err| map_db_error(&err))?;
            let nodes = statement
                .query_map(params![run_id.as_str()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                        row.get::<_, Option<u32>>(11)?,
                    ))
                })
                .map_err(|err| map_db_error(&err))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| map_db_error(&err))?;
            for node in nodes {
                snapshot.nodes.push(Node {
                    node_id: NodeId::new(node.0),
                    run_id: RunId::new(node.1),
                    plugin_name: node.2,
                    node_type: parse_enum::<NodeType>(&node.3, "node_type")?,
                    plugin_version: node.4,
                    determinism: parse_enum::<Determinism>(&node.5, "determinism")?,
                    config_hash: node.6,
                    config_json: node.7,
                    registered_at: Timestamp::from_unix_millis(node.8),
                    schema_mode: node.9,
                    schema_fields_json: node.10,
                    sequence_in_pipeline: node.11,
                });
            }
        }
        // Edges.
        {
            let mut statement = connection
                .prepare(
                    "SELECT edge_id, run_id, from_node_id, to_node_id, label, default_mode, \
                     created_at FROM edges WHERE run_id = ?1 ORDER BY edge_id",
                )
                .map_err(|err| map_db_error(&err))?;
            let edges = statement
                .query_map(params![run_id.as_str()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                })
                .map_err(|err| map_db_error(&err))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| map_db_error(&err))?;
            for edge in edges {
                snapshot.edges.push(Edge {
                    edge_id: EdgeId::new(edge.0),
                    run_id: RunId::new(edge.1),
                    from_node_id: NodeId::new(edge.2),
                    to_node_id: NodeId::new(edge.3),
                    label: edge.4,
                    default_mode: parse_enum(&edge.5, "routing_mode")?,
                    created_at: Timestamp::from_unix_millis(edge.6),
                });
            }
        }
        drop(connection);
        snapshot.rows = self.get_rows(run_id)?;
        for row in &snapshot.rows {
            snapshot.tokens.extend(self.get_tokens_for_row(&row.row_id)?);
        }
        let connection = self.lock()?;
        for token in &snapshot.tokens {
            let mut statement = connection
                .prepare(
                    "SELECT token_id, parent_token_id, ordinal FROM token_parents \
                     WHERE token_id = ?1 ORDER BY ordinal",
                )
                .map_err(|err| map_db_error(&err))?;
            let parents = statement
                .query_map(params![token.token_id.as_str()], |row| {
                    Ok(TokenParent {
                        token_id: TokenId::new(row.get::<_, String>(0)?),
                        parent_token_id: TokenId::new(row.get::<_, String>(1)?),
                        ordinal: row.get(2)?,
                    })
                })
                .map_err(|err| map_db_error(&err))?
                .collect::<Result<Vec<TokenParent>, _>>()
                .map_err(|err| map_db_error(&err))?;
            snapshot.token_parents.extend(parents);
        }
        drop(connection);
        for token in snapshot.tokens.clone() {
            snapshot.node_states.extend(self.get_node_states_for_token(&token.token_id)?);
        }
        let connection = self.lock()?;
        // All outcomes for the run.
        {
            let mut statement = connection
                .prepare(
                    "SELECT outcome_id, run_id, token_id, outcome, is_terminal, recorded_at, \
                     sink_name, batch_id, fork_group_id, join_group_id, expand_group_id, \
                     error_hash, context_json, expected_branches_json FROM token_outcomes \
                     WHERE run_id = ?1 ORDER BY recorded_at, outcome_id",
                )
                .map_err(|err| map_db_error(&err))?;
            let outcomes = statement
                .query_map(params![run_id.as_str()], |row| Ok(Self::read_outcome(row)))
                .map_err(|err| map_db_error(&err))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| map_db_error(&err))?
                .into_iter()
                .collect::<Result<Vec<TokenOutcome>, LandscapeError>>()?;
            snapshot.token_outcomes = outcomes;
        }
        // Calls for the run's states and operations.
        {
            let mut statement = connection
                .prepare(
                    "SELECT c.call_id, c.state_id, c.operation_id, c.call_index, c.call_type, \
                     c.status, c.request_hash, c.response_hash, c.error_json, c.latency_ms, \
                     c.created_at FROM calls c \
                     LEFT JOIN operations o ON c.operation_id = o.operation_id \
                     LEFT JOIN node_states s ON c.state_id = s.state_id \
                     LEFT JOIN tokens t ON s.token_id = t.token_id \
                     LEFT JOIN rows r ON t.row_id = r.row_id \
                     WHERE o.run_id = ?1 OR r.run_id = ?1 ORDER BY c.created_at, c.call_id",
                )
                .map_err(|err| map_db_error(&err))?;
            let calls = statement
                .query_map(params![run_id.as_str()], |row| Ok(Self::read_call(row)))
                .map_err(|err| map_db_error(&err))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| map_db_error(&err))?
                .into_iter()
                .collect::<Result<Vec<Call>, LandscapeError>>()?;
            snapshot.calls = calls;
        }
        // Operations.
        {
            let mut statement = connection
                .prepare(
                    "SELECT operation_id, run_id, node_id, operation_type, status, started_at, \
                     completed_at, duration_ms, input_data_ref, output_data_ref, error_message \
                     FROM operations WHERE run_id = ?1 ORDER BY started_at, operation_id",
                )
                .map_err(|err| map_db_error(&err))?;
            let operations = statement
                .query_map(params![run_id.as_str()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, Option<i64>>(6)?,
                        row.get::<_, Option<f64>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                    ))
                })
                .map_err(|err| map_db_error(&err))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| map_db_error(&err))?;
            for operation in operations {
                snapshot.operations.push(Operation {
                    operation_id: OperationId::new(operation.0),
                    run_id: RunId::new(operation.1),
                    node_id: NodeId::new(operation.2),
                    operation_type: parse_enum(&operation.3, "operation_type")?,
                    status: parse_enum(&operation.4, "operation_status")?,
                    started_at: Timestamp::from_unix_millis(operation.5),
                    completed_at: operation.6.map(Timestamp::from_unix_millis),
                    duration_ms: operation.7,
                    input_data_ref: operation.8,
                    output_data_ref: operation.9,
                    error_message: operation.10,
                });
            }
        }
        // Artifacts.
        {
            let mut statement = connection
                .prepare(
                    "SELECT artifact_id, run_id, produced_by_state_id, sink_node_id, \
                     artifact_type, path_or_uri, content_hash, size_bytes, created_at, \
                     idempotency_key FROM artifacts WHERE run_id = ?1 \
                     ORDER BY created_at, artifact_id",
                )
                .map_err(|err| map_db_error(&err))?;
            let artifacts = statement
                .query_map(params![run_id.as_str()], |row| {
                    Ok(Artifact {
                        artifact_id: ArtifactId::new(row.get::<_, String>(0)?),
                        run_id: RunId::new(row.get::<_, String>(1)?),
                        produced_by_state_id: row
                            .get::<_, Option<String>>(2)?
                            .map(StateId::new),
                        sink_node_id: NodeId::new(row.get::<_, String>(3)?),
                        artifact_type: row.get(4)?,
                        path_or_uri: row.get(5)?,
                        content_hash: row.get(6)?,
                        size_bytes: row.get::<_, i64>(7)? as u64,
                        created_at: Timestamp::from_unix_millis(row.get(8)?),
                        idempotency_key: row.get(9)?,
                    })
                })
                .map_err(|err| map_db_error(&err))?
                .collect::<Result<Vec<Artifact>, _>>()
                .map_err(|err| map_db_error(&err))?;
            snapshot.artifacts = artifacts;
        }
        // Routing events for the run's states.
        {
            let mut statement = connection
                .prepare(
                    "SELECT e.event_id, e.state_id, e.edge_id, e.routing_group_id, e.ordinal, \
                     e.mode, e.reason_hash, e.created_at FROM routing_events e \
                     JOIN node_states s ON e.state_id = s.state_id \
                     JOIN tokens t ON s.token_id = t.token_id \
                     JOIN rows r ON t.row_id = r.row_id WHERE r.run_id = ?1 \
                     ORDER BY e.created_at, e.event_id",
                )
                .map_err(|err| map_db_error(&err))?;
            let events = statement
                .query_map(params![run_id.as_str()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                })
                .map_err(|err| map_db_error(&err))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| map_db_error(&err))?;
            for event in events {
                snapshot.routing_events.push(RoutingEvent {
                    event_id: EventId::new(event.0),
                    state_id: StateId::new(event.1),
                    edge_id: EdgeId::new(event.2),
                    routing_group_id: GroupId::new(event.3),
                    ordinal: event.4,
                    mode: parse_enum(&event.5, "routing_mode")?,
                    reason_hash: event.6,
                    created_at: Timestamp::from_unix_millis(event.7),
                });
            }
        }
        // Batches with members and outputs.
        {
            let mut statement = connection
                .prepare(
                    "SELECT batch_id, run_id, aggregation_node_id, attempt, status, created_at, \
                     trigger_type, completed_at FROM batches WHERE run_id = ?1 \
                     ORDER BY created_at, batch_id",
                )
                .map_err(|err| map_db_error(&err))?;
            let batches = statement
                .query_map(params![run_id.as_str()], |row| Ok(Self::read_batch(row)))
                .map_err(|err| map_db_error(&err))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| map_db_error(&err))?
                .into_iter()
                .collect::<Result<Vec<Batch>, LandscapeError>>()?;
            snapshot.batches = batches;
            for batch in &snapshot.batches {
                let mut statement = connection
                    .prepare(
                        "SELECT batch_id, token_id, ordinal FROM batch_members \
                         WHERE batch_id = ?1 ORDER BY ordinal",
                    )
                    .map_err(|err| map_db_error(&err))?;
                let members = statement
                    .query_map(params![batch.batch_id.as_str()], |row| {
                        Ok(BatchMember {
                            batch_id: BatchId::new(row.get::<_, String>(0)?),
                            token_id: TokenId::new(row.get::<_, String>(1)?),
                            ordinal: row.get(2)?,
                        })
                    })
                    .map_err(|err| map_db_error(&err))?
                    .collect::<Result<Vec<BatchMember>, _>>()
                    .map_err(|err| map_db_error(&err))?;
                snapshot.batch_members.extend(members);
                let mut statement = connection
                    .prepare(
                        "SELECT batch_id, output_type, output_id FROM batch_outputs \
                         WHERE batch_id = ?1",
                    )
                    .map_err(|err| map_db_error(&err))?;
                let outputs = statement
                    .query_map(params![batch.batch_id.as_str()], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })
                    .map_err(|err| map_db_error(&err))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| map_db_error(&err))?;
                for output in outputs {
                    snapshot.batch_outputs.push(BatchOutput {
                        batch_id: BatchId::new(output.0),
                        output_type: parse_enum(&output.1, "batch_output_type")?,
                        output_id: output.2,
                    });
                }
            }
        }
        // Validation and transform errors.
        {
            let mut statement = connection
                .prepare(
                    "SELECT error_id, run_id, node_id, row_hash, error, schema_mode, \
                     destination, created_at, row_data_json FROM validation_errors \
                     WHERE run_id = ?1 ORDER BY created_at, error_id",
                )
                .map_err(|err| map_db_error(&err))?;
            let records = statement
                .query_map(params![run_id.as_str()], |row| {
                    Ok(ValidationErrorRecord {
                        error_id: ErrorId::new(row.get::<_, String>(0)?),
                        run_id: RunId::new(row.get::<_, String>(1)?),
                        node_id: row.get::<_, Option<String>>(2)?.map(NodeId::new),
                        row_hash: row.get(3)?,
                        error: row.get(4)?,
                        schema_mode: row.get(5)?,
                        destination: row.get(6)?,
                        created_at: Timestamp::from_unix_millis(row.get(7)?),
                        row_data_json: row.get(8)?,
                    })
                })
                .map_err(|err| map_db_error(&err))?
                .collect::<Result<Vec<ValidationErrorRecord>, _>>()
                .map_err(|err| map_db_error(&err))?;
            snapshot.validation_errors = records;
            let mut statement = connection
                .prepare(
                    "SELECT error_id, run_id, token_id, transform_node_id, row_hash, \
                     destination, created_at, row_data_json, error_details_json \
                     FROM transform_errors WHERE run_id = ?1 ORDER BY created_at, error_id",
                )
                .map_err(|err| map_db_error(&err))?;
            let records = statement
                .query_map(params![run_id.as_str()], |row| {
                    Ok(TransformErrorRecord {
                        error_id: ErrorId::new(row.get::<_, String>(0)?),
                        run_id: RunId::new(row.get::<_, String>(1)?),
                        token_id: TokenId::new(row.get::<_, String>(2)?),
                        transform_node_id: NodeId::new(row.get::<_, String>(3)?),
                        row_hash: row.get(4)?,
                        destination: row.get(5)?,
                        created_at: Timestamp::from_unix_millis(row.get(6)?),
                        row_data_json: row.get(7)?,
                        error_details_json: row.get(8)?,
                    })
                })
                .map_err(|err| map_db_error(&err))?
                .collect::<Result<Vec<TransformErrorRecord>, _>>()
                .map_err(|err| map_db_error(&err))?;
            snapshot.transform_errors = records;
        }
        // Checkpoints.
        drop(connection);
        snapshot.checkpoints = self.get_checkpoints(run_id)?;
        Ok(snapshot)
    }
}
