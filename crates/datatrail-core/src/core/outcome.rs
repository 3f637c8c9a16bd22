// crates/datatrail-core/src/core/outcome.rs
// ============================================================================
// Module: Datatrail Token Outcomes
// Description: Terminal and buffered token outcomes with required context.
// Purpose: Guarantee exactly one terminal outcome per token, with the context
//          each outcome kind demands.
// Dependencies: crate::core::{identifiers, time}, serde, thiserror
// ============================================================================

//! ## Overview
//! Every token ends in exactly one terminal outcome; buffered outcomes may
//! accumulate before it. Call sites build an [`OutcomeContext`], which makes
//! the per-kind required fields impossible to omit; the flat [`TokenOutcome`]
//! record mirrors the store row and re-validates on read so an inconsistent
//! row fails loudly instead of round-tripping.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::identifiers::BatchId;
use crate::core::identifiers::GroupId;
use crate::core::identifiers::OutcomeId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::TokenId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Row Outcome
// ============================================================================

/// Classification of a token's recorded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOutcome {
    /// Reached its success sink (terminal).
    Completed,
    /// Routed to an error or quarantine sink (terminal).
    Routed,
    /// Failed with no routing destination (terminal).
    Failed,
    /// Quarantined without a named sink (terminal).
    Quarantined,
    /// Consumed by a coalesce join (terminal).
    Coalesced,
    /// Forked into branch tokens (terminal).
    Forked,
    /// Expanded into child tokens (terminal).
    Expanded,
    /// Buffered in an aggregation window (non-terminal).
    Buffered,
    /// Consumed by a batch flush (non-terminal).
    ConsumedInBatch,
}

impl RowOutcome {
    /// Returns true when the outcome is terminal for its token.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Buffered | Self::ConsumedInBatch)
    }
}

// ============================================================================
// SECTION: Outcome Context
// ============================================================================

/// Outcome kind paired with the context that kind requires.
///
/// # Invariants
/// - Required context is structural: a `Completed` without a sink name or a
///   `Buffered` without a batch id cannot be expressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OutcomeContext {
    /// Token reached its success sink.
    Completed {
        /// Destination sink name.
        sink_name: String,
    },
    /// Token was routed to an error destination sink.
    Routed {
        /// Destination sink name.
        sink_name: String,
    },
    /// Token failed.
    Failed {
        /// Canonical hash of the error payload when available.
        error_hash: Option<String>,
    },
    /// Token was quarantined.
    Quarantined,
    /// Token was consumed by a coalesce join.
    Coalesced {
        /// Join group shared with the produced child token.
        join_group_id: GroupId,
    },
    /// Token forked into branch tokens.
    Forked {
        /// Fork group shared by the branch tokens.
        fork_group_id: GroupId,
        /// Branch labels the fork was expected to produce.
        expected_branches: Vec<String>,
    },
    /// Token expanded into child tokens.
    Expanded {
        /// Expand group shared by the child tokens.
        expand_group_id: GroupId,
        /// Branch labels the expansion was expected to produce.
        expected_branches: Vec<String>,
    },
    /// Token buffered in an aggregation window.
    Buffered {
        /// Owning batch identifier.
        batch_id: BatchId,
    },
    /// Token consumed by a batch flush.
    ConsumedInBatch {
        /// Owning batch identifier.
        batch_id: BatchId,
    },
}

impl OutcomeContext {
    /// Returns the outcome classification.
    #[must_use]
    pub const fn outcome(&self) -> RowOutcome {
        match self {
            Self::Completed { .. } => RowOutcome::Completed,
            Self::Routed { .. } => RowOutcome::Routed,
            Self::Failed { .. } => RowOutcome::Failed,
            Self::Quarantined => RowOutcome::Quarantined,
            Self::Coalesced { .. } => RowOutcome::Coalesced,
            Self::Forked { .. } => RowOutcome::Forked,
            Self::Expanded { .. } => RowOutcome::Expanded,
            Self::Buffered { .. } => RowOutcome::Buffered,
            Self::ConsumedInBatch { .. } => RowOutcome::ConsumedInBatch,
        }
    }

    /// Returns true when the outcome is terminal for its token.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.outcome().is_terminal()
    }

    /// Returns the sink name when the outcome carries one.
    #[must_use]
    pub fn sink_name(&self) -> Option<&str> {
        match self {
            Self::Completed { sink_name } | Self::Routed { sink_name } => Some(sink_name.as_str()),
            _ => None,
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when a stored outcome row is internally inconsistent.
#[derive(Debug, Error)]
pub enum OutcomeError {
    /// A stored outcome row is missing the context its kind requires.
    #[error("outcome {outcome:?} for token {token_id} is missing required context: {missing}")]
    MissingContext {
        /// Outcome classification read from the store.
        outcome: RowOutcome,
        /// Token the outcome belongs to.
        token_id: TokenId,
        /// Name of the missing context field.
        missing: &'static str,
    },
}

// ============================================================================
// SECTION: Token Outcome Record
// ============================================================================

/// Flat outcome record as persisted by the Landscape store.
///
/// # Invariants
/// - At most one record with `is_terminal = true` exists per token, enforced
///   by the store's partial unique index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenOutcome {
    /// Outcome identifier.
    pub outcome_id: OutcomeId,
    /// Run identifier.
    pub run_id: RunId,
    /// Token the outcome belongs to.
    pub token_id: TokenId,
    /// Outcome classification.
    pub outcome: RowOutcome,
    /// Whether the outcome is terminal.
    pub is_terminal: bool,
    /// Recording timestamp.
    pub recorded_at: Timestamp,
    /// Destination sink for Completed/Routed.
    pub sink_name: Option<String>,
    /// Owning batch for Buffered/ConsumedInBatch.
    pub batch_id: Option<BatchId>,
    /// Fork group for Forked.
    pub fork_group_id: Option<GroupId>,
    /// Join group for Coalesced.
    pub join_group_id: Option<GroupId>,
    /// Expand group for Expanded.
    pub expand_group_id: Option<GroupId>,
    /// Error hash for Failed.
    pub error_hash: Option<String>,
    /// Free-form context blob as canonical JSON.
    pub context_json: Option<String>,
    /// Expected branch labels for Forked/Expanded, as JSON.
    pub expected_branches_json: Option<String>,
}

impl TokenOutcome {
    /// Builds a flat record from an outcome context.
    #[must_use]
    pub fn from_context(
        outcome_id: OutcomeId,
        run_id: RunId,
        token_id: TokenId,
        recorded_at: Timestamp,
        context: &OutcomeContext,
        context_json: Option<String>,
    ) -> Self {
        let mut record = Self {
            outcome_id,
            run_id,
            token_id,
            outcome: context.outcome(),
            is_terminal: context.is_terminal(),
            recorded_at,
            sink_name: None,
            batch_id: None,
            fork_group_id: None,
            join_group_id: None,
            expand_group_id: None,
            error_hash: None,
            context_json,
            expected_branches_json: None,
        };
        match context {
            OutcomeContext::Completed { sink_name } | OutcomeContext::Routed { sink_name } => {
                record.sink_name = Some(sink_name.clone());
            }
            OutcomeContext::Failed { error_hash } => {
                record.error_hash = error_hash.clone();
            }
            OutcomeContext::Quarantined => {}
            OutcomeContext::Coalesced { join_group_id } => {
                record.join_group_id = Some(join_group_id.clone());
            }
            OutcomeContext::Forked { fork_group_id, expected_branches } => {
                record.fork_group_id = Some(fork_group_id.clone());
                record.expected_branches_json =
                    serde_json::to_string(expected_branches).ok();
            }
            OutcomeContext::Expanded { expand_group_id, expected_branches } => {
                record.expand_group_id = Some(expand_group_id.clone());
                record.expected_branches_json =
                    serde_json::to_string(expected_branches).ok();
            }
            OutcomeContext::Buffered { batch_id }
            | OutcomeContext::ConsumedInBatch { batch_id } => {
                record.batch_id = Some(batch_id.clone());
            }
        }
        record
    }

    /// Validates that the flat record carries the context its kind requires.
    ///
    /// # Errors
    ///
    /// Returns [`OutcomeError::MissingContext`] when a required field is
    /// absent; store reads call this so inconsistent rows fail loudly.
    pub fn validate(&self) -> Result<(), OutcomeError> {
        let missing = match self.outcome {
            RowOutcome::Completed | RowOutcome::Routed if self.sink_name.is_none() => {
                Some("sink_name")
            }
            RowOutcome::Coalesced if self.join_group_id.is_none() => Some("join_group_id"),
            RowOutcome::Forked if self.fork_group_id.is_none() => Some("fork_group_id"),
            RowOutcome::Forked | RowOutcome::Expanded
                if self.expected_branches_json.is_none() =>
            {
                Some("expected_branches")
            }
            RowOutcome::Expanded if self.expand_group_id.is_none() => Some("expand_group_id"),
            RowOutcome::Buffered | RowOutcome::ConsumedInBatch if self.batch_id.is_none() => {
                Some("batch_id")
            }
            _ => None,
        };
        match missing {
            Some(missing) => Err(OutcomeError::MissingContext {
                outcome: self.outcome,
                token_id: self.token_id.clone(),
                missing,
            }),
            None => Ok(()),
        }
    }
}
