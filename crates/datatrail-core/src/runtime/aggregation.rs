// crates/datatrail-core/src/runtime/aggregation.rs
// ============================================================================
// Module: Datatrail Aggregation and Coalesce
// Description: Row buffering with triggers, output modes, and branch joins.
// Purpose: Collect tokens into batches and join multi-branch tokens with
//          explicit policies and merge strategies.
// Dependencies: crate::core, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! Aggregation buffers tokens per aggregation node until a trigger fires:
//! count at arrival, time at arrival or end-of-source, or end-of-source
//! itself. Timeouts are checked before the arriving row is buffered, so a
//! timed-out batch never includes the row that exposed it; there is no
//! background tick. Coalesce buffers branch arrivals per source row and joins
//! them according to its policy, merging schema contracts as it goes. Buffer
//! contents serialize into checkpoint aggregation state and restore on
//! resume.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

use crate::core::contract::ContractMergeError;
use crate::core::contract::PipelineRow;
use crate::core::contract::SchemaContract;
use crate::core::identifiers::BatchId;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::RowId;
use crate::core::records::Token;
use crate::core::records::TriggerType;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by aggregation and coalesce bookkeeping.
#[derive(Debug, Error)]
pub enum AggregationError {
    /// A node id was used that is not a registered aggregation.
    #[error("no aggregation registered for node '{0}'")]
    UnknownAggregation(NodeId),
    /// A node id was used that is not a registered coalesce.
    #[error("no coalesce registered for node '{0}'")]
    UnknownCoalesce(NodeId),
    /// Serialized aggregation state could not be restored.
    #[error("aggregation state invalid: {0}")]
    InvalidState(String),
    /// Branch contracts could not be merged.
    #[error(transparent)]
    ContractMerge(#[from] ContractMergeError),
}

// ============================================================================
// SECTION: Aggregation Settings
// ============================================================================

/// What a fired aggregation emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// One output row for the whole batch; a new token parented by every
    /// buffered token.
    Single,
    /// Each buffered row continues as-is, keeping its identity.
    Passthrough,
    /// The transform's returned rows become new tokens parented by the
    /// buffer (deaggregation allowed).
    Transform,
}

/// Configuration of one aggregation node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationSettings {
    /// Aggregation node identifier.
    pub node_id: NodeId,
    /// Human-readable aggregation name.
    pub name: String,
    /// Flush when the buffer reaches this many rows.
    pub count_trigger: Option<usize>,
    /// Flush when the buffer is older than this many milliseconds.
    pub timeout_ms: Option<i64>,
    /// Output mode applied at flush.
    pub output_mode: OutputMode,
}

// ============================================================================
// SECTION: Aggregation Buffers
// ============================================================================

/// One buffered token with its row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedRow {
    /// The buffered token.
    pub token: Token,
    /// The token's row at buffering time.
    pub row: PipelineRow,
    /// Step index at which the token was buffered.
    pub step: u32,
}

/// Buffer for one aggregation node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Buffer {
    /// Buffered rows in insertion order; ordinals follow this order.
    entries: Vec<BufferedRow>,
    /// Draft batch collecting the entries, once one exists.
    batch_id: Option<BatchId>,
    /// Timestamp of the first buffered row.
    opened_at: Option<Timestamp>,
}

/// Result of buffering one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferAction {
    /// Ordinal assigned to the buffered row.
    pub ordinal: u32,
    /// True when the count trigger fired with this row.
    pub count_fired: bool,
}

/// Buffer manager for all aggregation nodes of a run.
#[derive(Debug, Default)]
pub struct AggregationManager {
    /// Settings per aggregation node.
    settings: BTreeMap<NodeId, AggregationSettings>,
    /// Buffers per aggregation node.
    buffers: BTreeMap<NodeId, Buffer>,
}

impl AggregationManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an aggregation node.
    pub fn register(&mut self, settings: AggregationSettings) {
        self.buffers.insert(settings.node_id.clone(), Buffer::default());
        self.settings.insert(settings.node_id.clone(), settings);
    }

    /// Returns the settings for a node.
    #[must_use]
    pub fn settings(&self, node_id: &NodeId) -> Option<&AggregationSettings> {
        self.settings.get(node_id)
    }

    /// Returns all registered aggregation node ids.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.settings.keys().cloned().collect()
    }

    /// Returns the buffered row count for a node.
    #[must_use]
    pub fn buffer_count(&self, node_id: &NodeId) -> usize {
        self.buffers.get(node_id).map_or(0, |buffer| buffer.entries.len())
    }

    /// Returns the draft batch id for a node's buffer, when one exists.
    #[must_use]
    pub fn batch_id(&self, node_id: &NodeId) -> Option<&BatchId> {
        self.buffers.get(node_id).and_then(|buffer| buffer.batch_id.as_ref())
    }

    /// Assigns the draft batch collecting a node's buffer.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::UnknownAggregation`] for unregistered
    /// nodes.
    pub fn assign_batch(
        &mut self,
        node_id: &NodeId,
        batch_id: BatchId,
    ) -> Result<(), AggregationError> {
        let buffer = self
            .buffers
            .get_mut(node_id)
            .ok_or_else(|| AggregationError::UnknownAggregation(node_id.clone()))?;
        buffer.batch_id = Some(batch_id);
        Ok(())
    }

    /// Buffers a row, reporting its ordinal and whether the count trigger
    /// fired.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::UnknownAggregation`] for unregistered
    /// nodes.
    pub fn buffer_row(
        &mut self,
        node_id: &NodeId,
        token: Token,
        row: PipelineRow,
        step: u32,
        now: Timestamp,
    ) -> Result<BufferAction, AggregationError> {
        let settings = self
            .settings
            .get(node_id)
            .ok_or_else(|| AggregationError::UnknownAggregation(node_id.clone()))?;
        let buffer = self
            .buffers
            .get_mut(node_id)
            .ok_or_else(|| AggregationError::UnknownAggregation(node_id.clone()))?;
        if buffer.entries.is_empty() {
            buffer.opened_at = Some(now);
        }
        buffer.entries.push(BufferedRow { token, row, step });
        let ordinal = u32::try_from(buffer.entries.len() - 1)
            .map_err(|_| AggregationError::InvalidState("buffer ordinal overflow".to_string()))?;
        let count_fired =
            settings.count_trigger.is_some_and(|trigger| buffer.entries.len() >= trigger);
        Ok(BufferAction { ordinal, count_fired })
    }

    /// Reports whether a node's time trigger has expired.
    ///
    /// Checked at row-arrival time (before buffering the arriving row) and at
    /// end-of-source; an empty buffer never fires.
    #[must_use]
    pub fn timeout_expired(&self, node_id: &NodeId, now: Timestamp) -> bool {
        let Some(settings) = self.settings.get(node_id) else {
            return false;
        };
        let Some(timeout_ms) = settings.timeout_ms else {
            return false;
        };
        let Some(buffer) = self.buffers.get(node_id) else {
            return false;
        };
        if buffer.entries.is_empty() {
            return false;
        }
        buffer.opened_at.is_some_and(|opened_at| {
            now.as_unix_millis().saturating_sub(opened_at.as_unix_millis()) >= timeout_ms
        })
    }

    /// Drains a node's buffer for flushing, returning the entries and the
    /// draft batch id when one was assigned.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::UnknownAggregation`] for unregistered
    /// nodes.
    pub fn take_buffer(
        &mut self,
        node_id: &NodeId,
    ) -> Result<(Vec<BufferedRow>, Option<BatchId>), AggregationError> {
        let buffer = self
            .buffers
            .get_mut(node_id)
            .ok_or_else(|| AggregationError::UnknownAggregation(node_id.clone()))?;
        let entries = std::mem::take(&mut buffer.entries);
        let batch_id = buffer.batch_id.take();
        buffer.opened_at = None;
        Ok((entries, batch_id))
    }

    /// Serializes all buffers into checkpoint aggregation state.
    ///
    /// Returns `None` when every buffer is empty.
    #[must_use]
    pub fn serialize_state(&self) -> Option<Value> {
        if self.buffers.values().all(|buffer| buffer.entries.is_empty()) {
            return None;
        }
        let state: BTreeMap<String, &Buffer> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| !buffer.entries.is_empty())
            .map(|(node_id, buffer)| (node_id.to_string(), buffer))
            .collect();
        serde_json::to_value(state).ok()
    }

    /// Restores buffers from checkpoint aggregation state.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::InvalidState`] when the blob does not
    /// parse or references an unregistered aggregation.
    pub fn restore_state(&mut self, state: &Value) -> Result<(), AggregationError> {
        let parsed: BTreeMap<String, Buffer> = serde_json::from_value(state.clone())
            .map_err(|err| AggregationError::InvalidState(err.to_string()))?;
        for (node_id, buffer) in parsed {
            let node_id = NodeId::new(node_id);
            if !self.settings.contains_key(&node_id) {
                return Err(AggregationError::UnknownAggregation(node_id));
            }
            self.buffers.insert(node_id, buffer);
        }
        Ok(())
    }
}

/// Classifies the trigger that justified a flush request.
#[must_use]
pub const fn flush_trigger(end_of_source: bool, count_fired: bool) -> TriggerType {
    if end_of_source {
        TriggerType::EndOfSource
    } else if count_fired {
        TriggerType::Count
    } else {
        TriggerType::Time
    }
}

// ============================================================================
// SECTION: Coalesce Settings
// ============================================================================

/// When a coalesce join may fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CoalescePolicy {
    /// Every expected branch must arrive.
    RequireAll,
    /// At least this many branches must arrive.
    Quorum(usize),
    /// Join whatever arrived by end-of-source.
    BestEffort,
    /// Join on the first arrival.
    First,
}

/// How joined branch rows merge into one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "fields", rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Union of fields; earlier branches win on conflicts.
    Union,
    /// One object per branch, keyed by branch name.
    Nested,
    /// Union restricted to the named fields.
    Select(Vec<String>),
}

/// Configuration of one coalesce node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalesceSettings {
    /// Coalesce node identifier.
    pub node_id: NodeId,
    /// Human-readable coalesce name.
    pub name: String,
    /// Branch labels expected to arrive, in declaration order.
    pub expected_branches: Vec<String>,
    /// Join firing policy.
    pub policy: CoalescePolicy,
    /// Merge strategy for joined rows.
    pub merge: MergeStrategy,
}

// ============================================================================
// SECTION: Coalesce Buffers
// ============================================================================

/// What became of one branch arrival at a coalesce node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalDisposition {
    /// The join may fire now.
    Ready,
    /// The arrival is buffered until the policy is satisfied.
    Held,
    /// The join for this row already fired; the arrival was not buffered.
    AlreadyJoined,
}

/// One branch arrival waiting to join.
#[derive(Debug, Clone)]
pub struct BranchArrival {
    /// Branch label the token arrived on.
    pub branch: String,
    /// The arriving token.
    pub token: Token,
    /// The token's row at arrival.
    pub row: PipelineRow,
}

/// Join bookkeeping for all coalesce nodes of a run.
#[derive(Debug, Default)]
pub struct CoalesceManager {
    /// Settings per coalesce node.
    settings: BTreeMap<NodeId, CoalesceSettings>,
    /// Arrivals keyed by (coalesce node, source row).
    pending: BTreeMap<(NodeId, RowId), Vec<BranchArrival>>,
    /// Joins that already fired; late arrivals for these keys are rejected
    /// so one source row can never join twice at the same node.
    resolved: BTreeSet<(NodeId, RowId)>,
}

impl CoalesceManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a coalesce node.
    pub fn register(&mut self, settings: CoalesceSettings) {
        self.settings.insert(settings.node_id.clone(), settings);
    }

    /// Returns the settings for a node.
    #[must_use]
    pub fn settings(&self, node_id: &NodeId) -> Option<&CoalesceSettings> {
        self.settings.get(node_id)
    }

    /// Returns all registered coalesce node ids.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.settings.keys().cloned().collect()
    }

    /// Buffers a branch arrival and reports its disposition.
    ///
    /// Once a join has fired for a (node, row) key, later arrivals are not
    /// buffered: they report [`ArrivalDisposition::AlreadyJoined`] and the
    /// caller records a terminal outcome for them instead of re-joining.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::UnknownCoalesce`] for unregistered nodes.
    pub fn add_arrival(
        &mut self,
        node_id: &NodeId,
        row_id: &RowId,
        arrival: BranchArrival,
    ) -> Result<ArrivalDisposition, AggregationError> {
        let settings = self
            .settings
            .get(node_id)
            .ok_or_else(|| AggregationError::UnknownCoalesce(node_id.clone()))?;
        if self.resolved.contains(&(node_id.clone(), row_id.clone())) {
            return Ok(ArrivalDisposition::AlreadyJoined);
        }
        let arrivals =
            self.pending.entry((node_id.clone(), row_id.clone())).or_default();
        arrivals.push(arrival);
        let arrived = arrivals.len();
        let ready = match &settings.policy {
            CoalescePolicy::RequireAll => arrived >= settings.expected_branches.len(),
            CoalescePolicy::Quorum(quorum) => arrived >= *quorum,
            CoalescePolicy::BestEffort => false,
            CoalescePolicy::First => true,
        };
        Ok(if ready { ArrivalDisposition::Ready } else { ArrivalDisposition::Held })
    }

    /// Drains the arrivals for one (node, row) join and marks the key
    /// resolved so the join cannot fire a second time.
    #[must_use]
    pub fn take_arrivals(&mut self, node_id: &NodeId, row_id: &RowId) -> Vec<BranchArrival> {
        let key = (node_id.clone(), row_id.clone());
        self.resolved.insert(key.clone());
        self.pending.remove(&key).unwrap_or_default()
    }

    /// Drains every pending join for a node, for end-of-source best-effort
    /// firing; drained keys are marked resolved.
    #[must_use]
    pub fn drain_node(&mut self, node_id: &NodeId) -> Vec<(RowId, Vec<BranchArrival>)> {
        let keys: Vec<(NodeId, RowId)> = self
            .pending
            .keys()
            .filter(|(pending_node, _)| pending_node == node_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| {
                self.pending.remove(&key).map(|arrivals| {
                    self.resolved.insert(key.clone());
                    (key.1, arrivals)
                })
            })
            .collect()
    }

    /// Merges branch arrivals into one row and contract.
    ///
    /// Arrivals are ordered by the declared branch order before merging so
    /// output is deterministic regardless of arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`AggregationError::ContractMerge`] when branch contracts
    /// conflict.
    pub fn merge_rows(
        settings: &CoalesceSettings,
        arrivals: &[BranchArrival],
    ) -> Result<(Map<String, Value>, SchemaContract), AggregationError> {
        let mut ordered: Vec<&BranchArrival> = arrivals.iter().collect();
        ordered.sort_by_key(|arrival| {
            settings
                .expected_branches
                .iter()
                .position(|branch| *branch == arrival.branch)
                .unwrap_or(usize::MAX)
        });

        let mut contract: Option<SchemaContract> = None;
        for arrival in &ordered {
            contract = Some(match contract {
                None => arrival.row.contract().clone(),
                Some(existing) => existing.merge(arrival.row.contract())?,
            });
        }
        let contract = contract.unwrap_or_else(SchemaContract::free);

        let data = match &settings.merge {
            MergeStrategy::Union => {
                let mut merged = Map::new();
                for arrival in &ordered {
                    for (key, value) in arrival.row.data() {
                        merged.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                }
                merged
            }
            MergeStrategy::Nested => {
                let mut merged = Map::new();
                for arrival in &ordered {
                    merged.insert(
                        arrival.branch.clone(),
                        Value::Object(arrival.row.data().clone()),
                    );
                }
                merged
            }
            MergeStrategy::Select(fields) => {
                let mut merged = Map::new();
                for arrival in &ordered {
                    for (key, value) in arrival.row.data() {
                        if fields.contains(key) {
                            merged.entry(key.clone()).or_insert_with(|| value.clone());
                        }
                    }
                }
                merged
            }
        };
        Ok((data, contract))
    }
}
