// crates/datatrail-core/src/lib.rs
// ============================================================================
// Module: Datatrail Core
// Description: Deterministic, auditable row-at-a-time pipeline engine core.
// Purpose: Provide the data model, plugin contracts, and runtime that drive
//          rows through a DAG while recording tamper-evident lineage.
// Dependencies: bigdecimal, serde, serde_jcs, serde_json, sha2, thiserror,
//               time, tracing
// ============================================================================

//! ## Overview
//! Datatrail loads rows from a source, routes them through a directed acyclic
//! graph of transforms and gates, fans out or aggregates them, and writes to
//! one or more sinks, recording every step in a tamper-evident Landscape
//! store that can reconstruct the lineage of any output row.
//!
//! The crate is organized in three layers: [`core`] holds identifiers, time,
//! canonical hashing, schema contracts, and the audit record model;
//! [`interfaces`] holds the plugin traits and the Landscape/payload store
//! contracts; [`runtime`] holds the execution graph, expression evaluator,
//! row processor, orchestrator, aggregation, checkpointing, and the
//! concurrency adapter.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use core::*;

pub use interfaces::ArtifactDescriptor;
pub use interfaces::CallRecorder;
pub use interfaces::CallSpec;
pub use interfaces::CompletionRequest;
pub use interfaces::ExportUpdate;
pub use interfaces::FailureKind;
pub use interfaces::FieldResolution;
pub use interfaces::GatePlugin;
pub use interfaces::GateRule;
pub use interfaces::Landscape;
pub use interfaces::LandscapeError;
pub use interfaces::LandscapeSnapshot;
pub use interfaces::LineageResult;
pub use interfaces::NodeRegistration;
pub use interfaces::OutputValidation;
pub use interfaces::PayloadError;
pub use interfaces::PayloadRef;
pub use interfaces::PayloadStore;
pub use interfaces::PluginContext;
pub use interfaces::PluginContextError;
pub use interfaces::PluginInvariantViolation;
pub use interfaces::RouteTarget;
pub use interfaces::RowLineage;
pub use interfaces::SinkError;
pub use interfaces::SinkPlugin;
pub use interfaces::SourceError;
pub use interfaces::SourcePlugin;
pub use interfaces::SourceRow;
pub use interfaces::TokenSpec;
pub use interfaces::TransformFailure;
pub use interfaces::TransformPlugin;
pub use interfaces::TransformResult;
pub use runtime::AdapterConfig;
pub use runtime::AdapterError;
pub use runtime::AggregationSettings;
pub use runtime::BatchAdapter;
pub use runtime::CoalescePolicy;
pub use runtime::CoalesceSettings;
pub use runtime::CompatibilityResult;
pub use runtime::CompiledExpression;
pub use runtime::EngineError;
pub use runtime::ExecutionGraph;
pub use runtime::ExportSettings;
pub use runtime::InMemoryLandscape;
pub use runtime::MergeStrategy;
pub use runtime::NodeInfo;
pub use runtime::Orchestrator;
pub use runtime::OutputMode;
pub use runtime::PipelineConfig;
pub use runtime::RecoveryManager;
pub use runtime::ResumePoint;
pub use runtime::RowProcessor;
pub use runtime::RunSummary;
pub use runtime::StepConfig;
pub use runtime::StepTarget;
