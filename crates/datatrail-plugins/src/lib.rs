// crates/datatrail-plugins/src/lib.rs
// ============================================================================
// Module: Datatrail Plugins Library
// Description: Built-in sources, transforms, gates, and sinks.
// Purpose: Provide the file-backed plugin set the CLI wires into pipelines.
// Dependencies: csv, datatrail-core, regex, serde, serde_json
// ============================================================================

//! ## Overview
//! The built-in plugin set covers the common file pipeline: CSV and JSON
//! sources with schema validation and quarantine routing, a field mapper and
//! keyword filter, batch aggregation transforms, a rule gate, and CSV/JSON
//! sinks with durable flush and resume support. Every plugin parses its own
//! configuration strictly and fails closed on unknown keys.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;
pub mod gate;
pub mod registry;
pub mod sink;
pub mod source;
pub mod transform;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::PluginConfigError;
pub use gate::RuleGate;
pub use registry::PluginRegistry;
pub use sink::csv::CsvSink;
pub use sink::json::JsonSink;
pub use source::csv::CsvSource;
pub use source::json::JsonSource;
pub use transform::batch::BatchPassthrough;
pub use transform::batch::BatchStats;
pub use transform::field_mapper::FieldMapper;
pub use transform::keyword_filter::KeywordFilter;
pub use transform::passthrough::Passthrough;
