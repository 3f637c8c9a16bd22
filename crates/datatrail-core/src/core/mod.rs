// crates/datatrail-core/src/core/mod.rs
// ============================================================================
// Module: Datatrail Core Model
// Description: Identifiers, time, hashing, contracts, and audit records.
// Purpose: Re-export the data model shared by every Datatrail component.
// Dependencies: crate::core submodules
// ============================================================================

//! ## Overview
//! The core model is the vocabulary of the engine: opaque identifiers,
//! explicit timestamps, canonical hashing, schema contracts, and the audit
//! records the Landscape store owns.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod contract;
pub mod hashing;
pub mod identifiers;
pub mod outcome;
pub mod records;
pub mod state;
pub mod time;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use contract::ContractError;
pub use contract::ContractMergeError;
pub use contract::NORMALIZATION_VERSION;
pub use contract::FieldContract;
pub use contract::FieldSource;
pub use contract::FieldType;
pub use contract::PipelineRow;
pub use contract::SchemaContract;
pub use contract::SchemaMode;
pub use contract::SchemaViolation;
pub use contract::normalize_field_name;
pub use hashing::CANONICAL_VERSION;
pub use hashing::DECIMAL_DISCRIMINATOR;
pub use hashing::DEFAULT_HASH_ALGORITHM;
pub use hashing::canonical_decimal;
pub use hashing::HashAlgorithm;
pub use hashing::HashDigest;
pub use hashing::HashError;
pub use hashing::NonCanonicalMetadata;
pub use hashing::canonical_json_bytes;
pub use hashing::hash_bytes;
pub use hashing::hash_canonical_json;
pub use identifiers::ArtifactId;
pub use identifiers::BatchId;
pub use identifiers::CallId;
pub use identifiers::CheckpointId;
pub use identifiers::EdgeId;
pub use identifiers::ErrorId;
pub use identifiers::EventId;
pub use identifiers::GroupId;
pub use identifiers::IdGenerator;
pub use identifiers::NodeId;
pub use identifiers::OperationId;
pub use identifiers::OutcomeId;
pub use identifiers::RowId;
pub use identifiers::RunId;
pub use identifiers::StateId;
pub use identifiers::TokenId;
pub use outcome::OutcomeContext;
pub use outcome::OutcomeError;
pub use outcome::RowOutcome;
pub use outcome::TokenOutcome;
pub use records::Artifact;
pub use records::Batch;
pub use records::BatchMember;
pub use records::BatchOutput;
pub use records::BatchOutputType;
pub use records::BatchStatus;
pub use records::CHECKPOINT_FORMAT_VERSION;
pub use records::Call;
pub use records::CallParent;
pub use records::CallStatus;
pub use records::CallType;
pub use records::Checkpoint;
pub use records::Determinism;
pub use records::Edge;
pub use records::ExportStatus;
pub use records::Node;
pub use records::NodeType;
pub use records::Operation;
pub use records::OperationStatus;
pub use records::OperationType;
pub use records::RecordError;
pub use records::RoutingEvent;
pub use records::RoutingMode;
pub use records::Row;
pub use records::Run;
pub use records::RunStatus;
pub use records::Token;
pub use records::TokenParent;
pub use records::TransformErrorRecord;
pub use records::TriggerType;
pub use records::ValidationErrorRecord;
pub use state::NodeState;
pub use state::NodeStateCompleted;
pub use state::NodeStateFailed;
pub use state::NodeStateHead;
pub use state::NodeStateOpen;
pub use state::NodeStatePending;
pub use time::Clock;
pub use time::LogicalClock;
pub use time::Timestamp;
