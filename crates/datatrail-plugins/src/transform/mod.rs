// crates/datatrail-plugins/src/transform/mod.rs
// ============================================================================
// Module: Datatrail Transforms
// Description: Built-in row and batch transforms.
// Purpose: Rename, filter, and aggregate rows in the engine's idiom.
// Dependencies: crate::transform submodules
// ============================================================================

//! ## Overview
//! Built-in transforms return explicit [`datatrail_core::TransformResult`]s;
//! they never panic on bad data. Rows a transform rejects route to its
//! configured `on_error` destination.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod batch;
pub mod field_mapper;
pub mod keyword_filter;
pub mod passthrough;
