// crates/datatrail-core/src/runtime/checkpoint.rs
// ============================================================================
// Module: Datatrail Checkpoint and Recovery
// Description: Topology-bound checkpoints and strict resume validation.
// Purpose: Capture run progress at row boundaries and refuse resume loudly
//          when the topology or node config has drifted.
// Dependencies: crate::{core, interfaces, runtime}
// ============================================================================

//! ## Overview
//! Checkpoints bind a sequence number (proxied by row index) to the full
//! topology hash and the checkpoint node's config hash. Resume validates both
//! against the current graph and rejects with a human-readable reason on any
//! mismatch; silent acceptance is forbidden. Only rows with an index strictly
//! greater than the checkpoint sequence number are replayed, and a payload
//! store is required to rehydrate them.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use serde_json::Value;

use crate::core::identifiers::CheckpointId;
use crate::core::identifiers::IdGenerator;
use crate::core::identifiers::NodeId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::TokenId;
use crate::core::records::BatchStatus;
use crate::core::records::CHECKPOINT_FORMAT_VERSION;
use crate::core::records::Checkpoint;
use crate::core::records::Row;
use crate::core::time::Clock;
use crate::interfaces::Landscape;
use crate::runtime::EngineError;
use crate::runtime::graph::ExecutionGraph;

// ============================================================================
// SECTION: Checkpoint Manager
// ============================================================================

/// Creates and reads checkpoints for a run.
pub struct CheckpointManager {
    /// Backing Landscape store.
    landscape: Arc<dyn Landscape>,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Deterministic checkpoint id generator.
    ids: IdGenerator,
}

impl CheckpointManager {
    /// Creates a manager for one run.
    #[must_use]
    pub fn new(landscape: Arc<dyn Landscape>, clock: Arc<dyn Clock>, run_id: &RunId) -> Self {
        Self { landscape, clock, ids: IdGenerator::new(format!("{run_id}/checkpoints")) }
    }

    /// Creates a checkpoint bound to the current topology.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when hashing or the store write fails.
    pub fn create_checkpoint(
        &mut self,
        run_id: &RunId,
        token_id: &TokenId,
        node_id: &NodeId,
        sequence_number: u64,
        graph: &ExecutionGraph,
        aggregation_state: Option<&Value>,
    ) -> Result<Checkpoint, EngineError> {
        let upstream_topology_hash = graph.compute_full_topology_hash()?;
        let checkpoint_node_config_hash = graph.node_config_hash(node_id)?;
        let checkpoint = Checkpoint::new(
            CheckpointId::new(self.ids.next_id("cp")),
            run_id.clone(),
            token_id.clone(),
            node_id.clone(),
            sequence_number,
            self.clock.now(),
            upstream_topology_hash,
            checkpoint_node_config_hash,
            aggregation_state.map(std::string::ToString::to_string),
        )?;
        self.landscape.record_checkpoint(checkpoint.clone())?;
        Ok(checkpoint)
    }

    /// Returns the checkpoint with the highest sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the read fails.
    pub fn get_latest_checkpoint(
        &self,
        run_id: &RunId,
    ) -> Result<Option<Checkpoint>, EngineError> {
        Ok(self.landscape.get_latest_checkpoint(run_id)?)
    }

    /// Returns all checkpoints for a run in sequence order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the read fails.
    pub fn get_checkpoints(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, EngineError> {
        Ok(self.landscape.get_checkpoints(run_id)?)
    }

    /// Deletes all checkpoints for a run.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the delete fails.
    pub fn delete_checkpoints(&self, run_id: &RunId) -> Result<(), EngineError> {
        Ok(self.landscape.delete_checkpoints(run_id)?)
    }
}

// ============================================================================
// SECTION: Compatibility
// ============================================================================

/// Verdict of a resume compatibility check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityResult {
    /// Whether resume may proceed.
    pub can_resume: bool,
    /// Human-readable reason when resume is refused.
    pub reason: Option<String>,
}

impl CompatibilityResult {
    /// Accepting verdict.
    #[must_use]
    pub const fn accepted() -> Self {
        Self { can_resume: true, reason: None }
    }

    /// Rejecting verdict with a reason.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self { can_resume: false, reason: Some(reason.into()) }
    }
}

/// Where a resumed run picks up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    /// Token the checkpoint marked.
    pub token_id: TokenId,
    /// Node the checkpoint was taken at.
    pub node_id: NodeId,
    /// Progress sequence number (row index proxy).
    pub sequence_number: u64,
    /// Serialized aggregation buffers, when any were captured.
    pub aggregation_state: Option<Value>,
}

// ============================================================================
// SECTION: Recovery Manager
// ============================================================================

/// Validates and stages crash recovery for a run.
pub struct RecoveryManager {
    /// Backing Landscape store.
    landscape: Arc<dyn Landscape>,
}

impl RecoveryManager {
    /// Creates a recovery manager.
    #[must_use]
    pub fn new(landscape: Arc<dyn Landscape>) -> Self {
        Self { landscape }
    }

    /// Checks whether the run can resume against the given graph.
    ///
    /// `sink_resume_support` lists (sink name, `supports_resume`) for every
    /// configured sink; any non-resumable sink refuses resume.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the store read or hashing fails; an
    /// incompatible topology is a rejection, not an error.
    pub fn can_resume(
        &self,
        run_id: &RunId,
        graph: &ExecutionGraph,
        sink_resume_support: &[(String, bool)],
    ) -> Result<CompatibilityResult, EngineError> {
        let Some(checkpoint) = self.landscape.get_latest_checkpoint(run_id)? else {
            return Ok(CompatibilityResult::rejected(format!(
                "run '{run_id}' has no checkpoint to resume from"
            )));
        };
        if checkpoint.format_version != CHECKPOINT_FORMAT_VERSION {
            return Ok(CompatibilityResult::rejected(format!(
                "checkpoint format version {} is incompatible with version {}",
                checkpoint.format_version, CHECKPOINT_FORMAT_VERSION
            )));
        }
        for (sink_name, supports_resume) in sink_resume_support {
            if !supports_resume {
                return Ok(CompatibilityResult::rejected(format!(
                    "sink '{sink_name}' does not support resume"
                )));
            }
        }
        let current_topology = graph.compute_full_topology_hash()?;
        if checkpoint.upstream_topology_hash != current_topology {
            return Ok(CompatibilityResult::rejected(format!(
                "topology mismatch: checkpoint was taken against {} but the current graph hashes \
                 to {current_topology}",
                checkpoint.upstream_topology_hash
            )));
        }
        if graph.node(&checkpoint.node_id).is_none() {
            return Ok(CompatibilityResult::rejected(format!(
                "checkpoint node '{}' is not present in the current graph",
                checkpoint.node_id
            )));
        }
        let current_config = graph.node_config_hash(&checkpoint.node_id)?;
        if checkpoint.checkpoint_node_config_hash != current_config {
            return Ok(CompatibilityResult::rejected(format!(
                "config mismatch at checkpoint node '{}': checkpoint recorded {} but the current \
                 config hashes to {current_config}",
                checkpoint.node_id, checkpoint.checkpoint_node_config_hash
            )));
        }
        Ok(CompatibilityResult::accepted())
    }

    /// Returns the resume point derived from the latest checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ResumeUnavailable`] when no checkpoint exists
    /// or its aggregation state does not parse.
    pub fn get_resume_point(&self, run_id: &RunId) -> Result<ResumePoint, EngineError> {
        let checkpoint = self.landscape.get_latest_checkpoint(run_id)?.ok_or_else(|| {
            EngineError::ResumeUnavailable(format!("run '{run_id}' has no checkpoint"))
        })?;
        let aggregation_state = match &checkpoint.aggregation_state_json {
            Some(blob) => Some(serde_json::from_str(blob).map_err(|err| {
                EngineError::ResumeUnavailable(format!(
                    "checkpoint aggregation state does not parse: {err}"
                ))
            })?),
            None => None,
        };
        Ok(ResumePoint {
            token_id: checkpoint.token_id,
            node_id: checkpoint.node_id,
            sequence_number: checkpoint.sequence_number,
            aggregation_state,
        })
    }

    /// Returns rows not yet processed at the latest checkpoint: those with a
    /// row index strictly greater than the checkpoint sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the store read fails.
    pub fn get_unprocessed_rows(&self, run_id: &RunId) -> Result<Vec<Row>, EngineError> {
        let checkpoint = self.landscape.get_latest_checkpoint(run_id)?.ok_or_else(|| {
            EngineError::ResumeUnavailable(format!("run '{run_id}' has no checkpoint"))
        })?;
        let rows = self.landscape.get_rows(run_id)?;
        Ok(rows
            .into_iter()
            .filter(|row| row.row_index > checkpoint.sequence_number)
            .collect())
    }

    /// Repairs batches interrupted by a crash.
    ///
    /// Executing batches are failed then retried; failed batches are retried;
    /// draft batches are left alone so collection resumes.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when a store write fails.
    pub fn handle_incomplete_batches(&self, run_id: &RunId) -> Result<(), EngineError> {
        for batch in self.landscape.get_incomplete_batches(run_id)? {
            match batch.status {
                BatchStatus::Executing => {
                    self.landscape.update_batch_status(
                        &batch.batch_id,
                        BatchStatus::Failed,
                        None,
                    )?;
                    self.landscape.retry_batch(&batch.batch_id)?;
                }
                BatchStatus::Failed => {
                    self.landscape.retry_batch(&batch.batch_id)?;
                }
                BatchStatus::Draft | BatchStatus::Completed => {}
            }
        }
        Ok(())
    }
}
