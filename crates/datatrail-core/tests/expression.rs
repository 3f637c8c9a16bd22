// crates/datatrail-core/tests/expression.rs
// ============================================================================
// Module: Expression Evaluator Tests
// Description: Tests for the safe gate-condition expression language.
// ============================================================================
//! ## Overview
//! Validates the whitelisted grammar end to end: comparisons, boolean logic,
//! membership, row access, arithmetic, ternaries, and chained comparisons,
//! plus the compile-time rejection of every forbidden construct.

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

use datatrail_core::CompiledExpression;
use datatrail_core::runtime::ExpressionError;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;

/// Compiles an expression or panics with the compile error.
fn compile(source: &str) -> CompiledExpression {
    CompiledExpression::compile(source).unwrap()
}

/// Evaluates an expression against a JSON row and coerces to bool.
fn eval_bool(source: &str, row: Value) -> bool {
    let row: Map<String, Value> = row.as_object().cloned().unwrap();
    compile(source).evaluate_bool(&row).unwrap()
}

/// Asserts a source is rejected with a security error.
fn assert_security_rejection(source: &str) {
    match CompiledExpression::compile(source) {
        Err(ExpressionError::Security(_)) => {}
        other => panic!("expected security rejection for {source:?}, got {other:?}"),
    }
}

// ============================================================================
// SECTION: Comparisons
// ============================================================================

/// Tests simple equality.
#[test]
fn test_simple_equality() {
    assert!(eval_bool("row['status'] == 'active'", json!({"status": "active"})));
    assert!(!eval_bool("row['status'] == 'active'", json!({"status": "inactive"})));
}

/// Tests numeric comparison operators.
#[test]
fn test_numeric_comparisons() {
    assert!(eval_bool("row['confidence'] >= 0.85", json!({"confidence": 0.9})));
    assert!(eval_bool("row['confidence'] >= 0.85", json!({"confidence": 0.85})));
    assert!(!eval_bool("row['confidence'] >= 0.85", json!({"confidence": 0.8})));
    assert!(eval_bool("row['count'] < 10", json!({"count": 5})));
    assert!(!eval_bool("row['count'] < 10", json!({"count": 10})));
    assert!(eval_bool("row['value'] > 100", json!({"value": 150})));
    assert!(eval_bool("row['priority'] <= 3", json!({"priority": 3})));
    assert!(eval_bool("row['status'] != 'deleted'", json!({"status": "active"})));
}

/// Tests integers and floats compare numerically across types.
#[test]
fn test_cross_type_numeric_equality() {
    assert!(eval_bool("row['n'] == 1", json!({"n": 1.0})));
}

/// Tests chained comparisons evaluate pairwise.
#[test]
fn test_chained_comparison() {
    assert!(eval_bool("1 < row['x'] < 10", json!({"x": 5})));
    assert!(!eval_bool("1 < row['x'] < 10", json!({"x": 10})));
    assert!(!eval_bool("1 < row['x'] < 10", json!({"x": 1})));
}

// ============================================================================
// SECTION: Boolean Logic
// ============================================================================

/// Tests and, or, and not.
#[test]
fn test_boolean_operators() {
    let active_and_positive = "row['status'] == 'active' and row['balance'] > 0";
    assert!(eval_bool(active_and_positive, json!({"status": "active", "balance": 100})));
    assert!(!eval_bool(active_and_positive, json!({"status": "active", "balance": 0})));
    assert!(!eval_bool(active_and_positive, json!({"status": "inactive", "balance": 100})));

    let either = "row['status'] == 'active' or row['override'] == True";
    assert!(eval_bool(either, json!({"status": "inactive", "override": true})));
    assert!(!eval_bool(either, json!({"status": "inactive", "override": false})));

    assert!(eval_bool("not row['disabled']", json!({"disabled": false})));
}

/// Tests parenthesized combinations.
#[test]
fn test_complex_boolean_expression() {
    let source =
        "(row['status'] == 'active' or row['status'] == 'pending') and row['score'] >= 0.5";
    assert!(eval_bool(source, json!({"status": "active", "score": 0.7})));
    assert!(eval_bool(source, json!({"status": "pending", "score": 0.6})));
    assert!(!eval_bool(source, json!({"status": "active", "score": 0.3})));
    assert!(!eval_bool(source, json!({"status": "deleted", "score": 0.9})));
}

// ============================================================================
// SECTION: Membership and None
// ============================================================================

/// Tests membership across list, tuple, and set literals.
#[test]
fn test_membership() {
    assert!(eval_bool("row['status'] in ['active', 'pending']", json!({"status": "active"})));
    assert!(!eval_bool("row['status'] in ['active', 'pending']", json!({"status": "gone"})));
    assert!(eval_bool("row['category'] not in ['spam', 'trash']", json!({"category": "inbox"})));
    assert!(eval_bool("row['code'] in (1, 2, 3)", json!({"code": 2})));
    assert!(eval_bool("row['tag'] in {'a', 'b', 'c'}", json!({"tag": "b"})));
}

/// Tests row.get with and without defaults.
#[test]
fn test_row_get() {
    assert!(eval_bool("row.get('status') == 'active'", json!({"status": "active"})));
    assert!(eval_bool("row.get('missing') is None", json!({})));
    assert!(eval_bool("row.get('status', 'unknown') == 'unknown'", json!({})));
    assert!(eval_bool("row.get('status', 'default') == 'active'", json!({"status": "active"})));
}

/// Tests None identity checks.
#[test]
fn test_none_checks() {
    assert!(eval_bool("row.get('optional') is None", json!({"optional": null})));
    assert!(!eval_bool("row.get('optional') is None", json!({"optional": "x"})));
    assert!(eval_bool("row.get('required') is not None", json!({"required": 0})));
    assert!(!eval_bool("row.get('required') is not None", json!({})));
}

// ============================================================================
// SECTION: Arithmetic and Ternary
// ============================================================================

/// Tests the arithmetic operators.
#[test]
fn test_arithmetic() {
    assert!(eval_bool("row['a'] + row['b'] == 5", json!({"a": 2, "b": 3})));
    assert!(eval_bool("row['a'] - 1 == 0", json!({"a": 1})));
    assert!(eval_bool("row['a'] * 3 == 9", json!({"a": 3})));
    assert!(eval_bool("row['a'] / 2 == 2.5", json!({"a": 5})));
    assert!(eval_bool("row['a'] // 2 == 2", json!({"a": 5})));
    assert!(eval_bool("row['a'] % 3 == 1", json!({"a": 7})));
    assert!(eval_bool("-row['a'] == -4", json!({"a": 4})));
}

/// Tests modulo and floor division take the divisor's sign.
#[test]
fn test_negative_divisor_semantics() {
    assert!(eval_bool("row['a'] % -3 == -2", json!({"a": 7})));
    assert!(eval_bool("row['a'] % 3 == 2", json!({"a": -7})));
    assert!(eval_bool("row['a'] // -3 == -3", json!({"a": 7})));
    assert!(eval_bool("row['a'] // 3 == -3", json!({"a": -7})));
}

/// Tests the ternary form.
#[test]
fn test_ternary() {
    assert!(eval_bool(
        "(1 if row['flag'] else 0) == 1",
        json!({"flag": true})
    ));
    assert!(eval_bool(
        "(1 if row['flag'] else 0) == 0",
        json!({"flag": false})
    ));
}

/// Tests division by zero is an evaluation error, not a panic.
#[test]
fn test_division_by_zero_is_error() {
    let row: Map<String, Value> = json!({"a": 1}).as_object().cloned().unwrap();
    assert!(compile("row['a'] / 0 == 1").evaluate(&row).is_err());
}

/// Tests strict indexing of a missing field is an evaluation error.
#[test]
fn test_missing_field_is_error() {
    let row: Map<String, Value> = json!({}).as_object().cloned().unwrap();
    assert!(compile("row['absent'] == 1").evaluate(&row).is_err());
}

// ============================================================================
// SECTION: Security Rejections
// ============================================================================

/// Tests forbidden identifiers are rejected at compile time.
#[test]
fn test_reject_identifiers() {
    assert_security_rejection("eval('1')");
    assert_security_rejection("exec('1')");
    assert_security_rejection("open('/etc/passwd')");
    assert_security_rejection("len(row)");
    assert_security_rejection("__import__('os')");
    assert_security_rejection("some_variable == 1");
}

/// Tests lambdas and comprehensions are rejected.
#[test]
fn test_reject_lambda_and_comprehensions() {
    assert_security_rejection("lambda x: x");
    assert_security_rejection("[x for x in row]");
    assert_security_rejection("{x for x in row}");
}

/// Tests attribute access other than row.get is rejected.
#[test]
fn test_reject_attribute_access() {
    assert_security_rejection("row.__class__");
    assert_security_rejection("row.items()");
    assert_security_rejection("row.keys()");
}

/// Tests assignment expressions and spread syntax are rejected.
#[test]
fn test_reject_walrus_and_spread() {
    assert_security_rejection("(x := 1)");
    assert_security_rejection("2 ** 8 == 256");
}

/// Tests f-strings are rejected.
#[test]
fn test_reject_fstring() {
    assert_security_rejection("f'{row}' == 'x'");
}

/// Tests row.get argument arity is enforced.
#[test]
fn test_reject_bad_get_arity() {
    assert!(CompiledExpression::compile("row.get('a', 1, 2) == 1").is_err());
    assert!(CompiledExpression::compile("row.get() == 1").is_err());
}

/// Tests bare row and is-comparisons against non-None are rejected.
#[test]
fn test_reject_bare_row_and_is_non_none() {
    assert_security_rejection("row");
    assert_security_rejection("row.get('a') is 1");
}

/// Tests malformed input is a syntax error.
#[test]
fn test_syntax_errors() {
    assert!(matches!(
        CompiledExpression::compile("row['a'] =="),
        Err(ExpressionError::Syntax(_))
    ));
    assert!(matches!(CompiledExpression::compile(""), Err(ExpressionError::Syntax(_))));
    assert!(matches!(
        CompiledExpression::compile("row['a'] = 1"),
        Err(ExpressionError::Syntax(_))
    ));
}
