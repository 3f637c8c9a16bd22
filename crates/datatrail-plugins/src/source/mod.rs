// crates/datatrail-plugins/src/source/mod.rs
// ============================================================================
// Module: Datatrail Sources
// Description: File-backed sources yielding validated rows.
// Purpose: Load CSV and JSON rows with quarantine-on-validation-failure.
// Dependencies: crate::source submodules
// ============================================================================

//! ## Overview
//! Sources never raise mid-stream for bad rows: parse and validation
//! failures are yielded as quarantined rows carrying their configured
//! destination. Only hard I/O errors propagate.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod csv;
pub mod json;

// ============================================================================
// SECTION: Shared Validation
// ============================================================================

use datatrail_core::RouteTarget;
use datatrail_core::SchemaContract;
use datatrail_core::SourceRow;
use serde_json::Map;
use serde_json::Value;

/// Validates a parsed row against the source contract, producing either a
/// valid or quarantined source row.
#[must_use]
pub fn validate_source_row(
    row: Map<String, Value>,
    contract: &SchemaContract,
    on_validation_failure: &RouteTarget,
) -> SourceRow {
    let violations = contract.validate_row(&row);
    if violations.is_empty() {
        return SourceRow::valid(row);
    }
    let message = violations
        .iter()
        .map(|violation| format!("{}: {}", violation.field, violation.message))
        .collect::<Vec<String>>()
        .join("; ");
    SourceRow::quarantined(Value::Object(row), on_validation_failure.clone(), message)
}
