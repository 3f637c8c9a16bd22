// crates/datatrail-core/src/core/state.rs
// ============================================================================
// Module: Datatrail Node States
// Description: Tagged union over a token's per-node processing attempts.
// Purpose: Make node-state invariants hold by construction, not by checks.
// Dependencies: crate::core::{identifiers, time}, serde
// ============================================================================

//! ## Overview
//! A node state is one attempt by one token to execute one node. The four
//! variants carry exactly the fields their lifecycle stage permits: an open
//! state has no completion time or output hash, a completed state always has
//! an output hash, a pending state has timing but no output, and a failed
//! state carries its error payload. Transitions other than OPEN to
//! {COMPLETED, FAILED, PENDING} are rejected by the Landscape store.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::NodeId;
use crate::core::identifiers::StateId;
use crate::core::identifiers::TokenId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Common Head
// ============================================================================

/// Fields shared by every node-state variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStateHead {
    /// State identifier.
    pub state_id: StateId,
    /// Token being processed.
    pub token_id: TokenId,
    /// Node doing the processing.
    pub node_id: NodeId,
    /// Step index of the node on the token's path.
    pub step_index: u32,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Canonical hash of the input row.
    pub input_hash: String,
    /// Start timestamp.
    pub started_at: Timestamp,
}

// ============================================================================
// SECTION: Variants
// ============================================================================

/// A node state currently being processed.
///
/// # Invariants
/// - No output hash and no completion time exist yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStateOpen {
    /// Shared head fields.
    pub head: NodeStateHead,
}

/// A node state whose operation finished but whose output is not yet
/// available (async submission in flight).
///
/// # Invariants
/// - Timing fields are present; the output hash is not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatePending {
    /// Shared head fields.
    pub head: NodeStateHead,
    /// Completion timestamp of the submission.
    pub completed_at: Timestamp,
    /// Processing duration in milliseconds.
    pub duration_ms: f64,
}

/// A node state that completed successfully.
///
/// # Invariants
/// - The output hash is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStateCompleted {
    /// Shared head fields.
    pub head: NodeStateHead,
    /// Canonical hash of the output row.
    pub output_hash: String,
    /// Completion timestamp.
    pub completed_at: Timestamp,
    /// Processing duration in milliseconds.
    pub duration_ms: f64,
    /// Optional transform-supplied success reason as canonical JSON.
    pub success_reason_json: Option<String>,
}

/// A node state that failed during processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStateFailed {
    /// Shared head fields.
    pub head: NodeStateHead,
    /// Completion timestamp of the failure.
    pub completed_at: Timestamp,
    /// Processing duration in milliseconds.
    pub duration_ms: f64,
    /// Error payload as canonical JSON.
    pub error_json: Option<String>,
    /// Partial output hash when the failure produced partial output.
    pub output_hash: Option<String>,
}

// ============================================================================
// SECTION: Tagged Union
// ============================================================================

/// Discriminated union over the node-state lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeState {
    /// Processing in progress.
    Open(NodeStateOpen),
    /// Submission finished, output pending.
    Pending(NodeStatePending),
    /// Completed with output.
    Completed(NodeStateCompleted),
    /// Failed with error payload.
    Failed(NodeStateFailed),
}

impl NodeState {
    /// Returns the shared head fields.
    #[must_use]
    pub const fn head(&self) -> &NodeStateHead {
        match self {
            Self::Open(state) => &state.head,
            Self::Pending(state) => &state.head,
            Self::Completed(state) => &state.head,
            Self::Failed(state) => &state.head,
        }
    }

    /// Returns the status label used by the store.
    #[must_use]
    pub const fn status_label(&self) -> &'static str {
        match self {
            Self::Open(_) => "open",
            Self::Pending(_) => "pending",
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
        }
    }

    /// Returns the output hash when the variant carries one.
    #[must_use]
    pub fn output_hash(&self) -> Option<&str> {
        match self {
            Self::Open(_) | Self::Pending(_) => None,
            Self::Completed(state) => Some(state.output_hash.as_str()),
            Self::Failed(state) => state.output_hash.as_deref(),
        }
    }
}

