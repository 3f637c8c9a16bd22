// crates/datatrail-core/src/runtime/mod.rs
// ============================================================================
// Module: Datatrail Runtime
// Description: Execution graph, processor, orchestrator, and recovery.
// Purpose: Drive rows to terminal outcomes while recording full lineage.
// Dependencies: crate::{core, interfaces}, runtime submodules
// ============================================================================

//! ## Overview
//! The runtime turns a pipeline configuration into a validated execution
//! graph and drives every source row to a terminal outcome. All fatal
//! failures funnel through [`EngineError`], the classified taxonomy the
//! orchestrator uses to decide what marks a run failed.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod adapter;
pub mod aggregation;
pub mod call_recorder;
pub mod checkpoint;
pub mod export;
pub mod expression;
pub mod graph;
pub mod orchestrator;
pub mod pipeline;
pub mod processor;
pub mod store;

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

use crate::core::contract::ContractMergeError;
use crate::core::hashing::HashError;
use crate::core::records::RecordError;
use crate::interfaces::LandscapeError;
use crate::interfaces::SourceError;

// ============================================================================
// SECTION: Engine Errors
// ============================================================================

/// Classified fatal errors of the engine runtime.
///
/// Non-fatal conditions (validation failures, transform errors, timeouts
/// with an error route) are recorded as outcomes, never raised here.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The Landscape store rejected or failed a write or read.
    #[error(transparent)]
    Landscape(#[from] LandscapeError),
    /// The execution graph is structurally invalid.
    #[error(transparent)]
    Graph(#[from] graph::GraphError),
    /// Aggregation or coalesce bookkeeping failed.
    #[error(transparent)]
    Aggregation(#[from] aggregation::AggregationError),
    /// Pipeline preparation failed.
    #[error(transparent)]
    Preparation(#[from] pipeline::PreparationError),
    /// Canonicalization failed.
    #[error(transparent)]
    Hash(#[from] HashError),
    /// Schema contracts could not merge.
    #[error(transparent)]
    ContractMerge(#[from] ContractMergeError),
    /// An audit record violated its construction invariants.
    #[error(transparent)]
    Record(#[from] RecordError),
    /// The source failed with a hard I/O error.
    #[error(transparent)]
    Source(#[from] SourceError),
    /// A sink's flush could not establish durability; no checkpoint may be
    /// created at the current boundary.
    #[error("sink '{sink}' failed to flush durably: {message}")]
    Durability {
        /// Offending sink name.
        sink: String,
        /// Failure description.
        message: String,
    },
    /// A sink write failed.
    #[error("sink '{sink}' write failed: {message}")]
    SinkWrite {
        /// Offending sink name.
        sink: String,
        /// Failure description.
        message: String,
    },
    /// Checkpoint topology or config hash differs from the current graph;
    /// resume is refused.
    #[error("topology mismatch: {0}")]
    TopologyMismatch(String),
    /// Resume cannot proceed for a non-topology reason.
    #[error("resume unavailable: {0}")]
    ResumeUnavailable(String),
    /// Internal invariant violation; always a bug.
    #[error("orchestration invariant violated: {0}")]
    OrchestrationInvariant(String),
    /// Audit trail export failed.
    #[error("export failed: {0}")]
    Export(String),
}

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use adapter::AdapterConfig;
pub use adapter::AdapterError;
pub use adapter::BatchAdapter;
pub use adapter::MutexWorker;
pub use adapter::RowWorker;
pub use aggregation::AggregationManager;
pub use aggregation::AggregationSettings;
pub use aggregation::ArrivalDisposition;
pub use aggregation::CoalesceManager;
pub use aggregation::CoalescePolicy;
pub use aggregation::CoalesceSettings;
pub use aggregation::MergeStrategy;
pub use aggregation::OutputMode;
pub use checkpoint::CheckpointManager;
pub use checkpoint::CompatibilityResult;
pub use checkpoint::RecoveryManager;
pub use checkpoint::ResumePoint;
pub use export::ExportReport;
pub use export::run_export;
pub use expression::CompiledExpression;
pub use expression::EvalError;
pub use expression::ExpressionError;
pub use graph::ExecutionGraph;
pub use graph::GraphEdge;
pub use graph::GraphError;
pub use graph::NodeInfo;
pub use orchestrator::Orchestrator;
pub use orchestrator::RunSummary;
pub use pipeline::CompiledGate;
pub use pipeline::ExportSettings;
pub use pipeline::PipelineConfig;
pub use pipeline::PreparedPipeline;
pub use pipeline::StepConfig;
pub use pipeline::StepTarget;
pub use processor::RowProcessor;
pub use processor::RowResult;
pub use store::InMemoryLandscape;
