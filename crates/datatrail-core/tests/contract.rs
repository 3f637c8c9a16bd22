// crates/datatrail-core/tests/contract.rs
// ============================================================================
// Module: Schema Contract Tests
// Description: Tests for contract merge, propagation, and normalization.
// ============================================================================
//! ## Overview
//! Validates the contract laws: propagation identity, merge associativity,
//! conflict rejection, deterministic field ordering, and dual-name row
//! access.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use datatrail_core::FieldContract;
use datatrail_core::FieldType;
use datatrail_core::PipelineRow;
use datatrail_core::SchemaContract;
use datatrail_core::SchemaMode;
use datatrail_core::normalize_field_name;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;

/// Builds a declared contract from (name, type) pairs.
fn contract(fields: &[(&str, FieldType)]) -> SchemaContract {
    SchemaContract::declared(
        SchemaMode::Strict,
        fields
            .iter()
            .map(|(name, field_type)| FieldContract::declared(*name, *field_type, true))
            .collect(),
    )
}

/// Builds a row map from JSON.
fn row(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

// ============================================================================
// SECTION: Propagation
// ============================================================================

/// Tests propagation without added fields is the identity.
#[test]
fn test_propagate_without_adds_is_identity() {
    let original = contract(&[("id", FieldType::Integer), ("value", FieldType::String)]);
    let output = row(json!({"id": 1, "value": "x", "extra": true}));
    let propagated = original.propagate(&output, false);
    assert_eq!(propagated, original);
}

/// Tests propagation with added fields infers the new ones.
#[test]
fn test_propagate_adds_inferred_fields() {
    let original = contract(&[("id", FieldType::Integer)]);
    let output = row(json!({"id": 1, "score": 0.5}));
    let propagated = original.propagate(&output, true);
    let score = propagated.field("score").unwrap();
    assert_eq!(score.data_type, FieldType::Float);
    assert_eq!(score.original_name, "score");
    assert!(!score.required);
}

// ============================================================================
// SECTION: Merge
// ============================================================================

/// Tests identical contracts merge unchanged.
#[test]
fn test_merge_identical_unchanged() {
    let a = contract(&[("id", FieldType::Integer)]);
    let merged = a.merge(&a).unwrap();
    assert_eq!(merged.fields, a.fields);
}

/// Tests merge produces the union sorted by normalized name.
#[test]
fn test_merge_union_sorted() {
    let a = contract(&[("zeta", FieldType::String)]);
    let b = contract(&[("alpha", FieldType::Integer)]);
    let merged = a.merge(&b).unwrap();
    let names: Vec<&str> = merged.field_names();
    assert_eq!(names, vec!["alpha", "zeta"]);
}

/// Tests conflicting field types refuse to merge.
#[test]
fn test_merge_conflict_rejected() {
    let a = contract(&[("id", FieldType::Integer)]);
    let b = contract(&[("id", FieldType::String)]);
    let error = a.merge(&b).unwrap_err();
    assert_eq!(error.field, "id");
}

/// Tests merge associativity over three mergeable contracts.
#[test]
fn test_merge_associative() {
    let a = contract(&[("a", FieldType::Integer), ("shared", FieldType::String)]);
    let b = contract(&[("b", FieldType::Float), ("shared", FieldType::String)]);
    let c = contract(&[("c", FieldType::Boolean)]);
    let left = a.merge(&b.merge(&c).unwrap()).unwrap();
    let right = a.merge(&b).unwrap().merge(&c).unwrap();
    assert_eq!(left, right);
}

/// Tests the locked flag is the OR of the inputs.
#[test]
fn test_merge_locked_flag_or() {
    let mut a = contract(&[("id", FieldType::Integer)]);
    let b = contract(&[("id", FieldType::Integer)]);
    a.lock();
    assert!(a.merge(&b).unwrap().locked);
    assert!(b.merge(&a).unwrap().locked);
}

// ============================================================================
// SECTION: Validation
// ============================================================================

/// Tests strict mode rejects missing required fields.
#[test]
fn test_strict_missing_required() {
    let c = contract(&[("id", FieldType::Integer)]);
    let violations = c.validate_row(&row(json!({})));
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].field, "id");
}

/// Tests strict mode rejects undeclared fields.
#[test]
fn test_strict_undeclared_field() {
    let c = contract(&[("id", FieldType::Integer)]);
    let violations = c.validate_row(&row(json!({"id": 1, "mystery": 2})));
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].field, "mystery");
}

/// Tests type mismatches are reported.
#[test]
fn test_type_mismatch_reported() {
    let c = contract(&[("id", FieldType::Integer)]);
    let violations = c.validate_row(&row(json!({"id": "not-an-int"})));
    assert_eq!(violations.len(), 1);
}

/// Tests free mode accepts anything.
#[test]
fn test_free_mode_accepts_all() {
    let c = SchemaContract::free();
    assert!(c.validate_row(&row(json!({"anything": [1, 2, 3]}))).is_empty());
}

// ============================================================================
// SECTION: Normalization and Dual Access
// ============================================================================

/// Tests header normalization mirrors the source rule.
#[test]
fn test_normalize_field_name() {
    assert_eq!(normalize_field_name("First Name!"), "first_name");
    assert_eq!(normalize_field_name("Last Name@"), "last_name");
    assert_eq!(normalize_field_name("  spaced  out  "), "spaced_out");
    assert_eq!(normalize_field_name("123abc"), "f_123abc");
    assert_eq!(normalize_field_name("___"), "field");
}

/// Tests a pipeline row resolves both normalized and original names.
#[test]
fn test_pipeline_row_dual_access() {
    let mut field = FieldContract::declared("first_name", FieldType::String, true);
    field.original_name = "First Name!".to_string();
    let contract = SchemaContract::declared(SchemaMode::Strict, vec![field]);
    let data = row(json!({"first_name": "Ada"}));
    let pipeline_row = PipelineRow::new(data, contract);
    assert_eq!(pipeline_row.get("first_name"), Some(&json!("Ada")));
    assert_eq!(pipeline_row.get("First Name!"), Some(&json!("Ada")));
    assert_eq!(pipeline_row.get("missing"), None);
}
