// crates/datatrail-core/tests/hashing.rs
// ============================================================================
// Module: Hashing Tests
// Description: Tests for canonical JSON hashing and decimal canonicalization.
// ============================================================================
//! ## Overview
//! Validates deterministic hashing using RFC 8785 canonicalization, the
//! decimal discriminator rule, and non-canonical metadata capture.

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

use std::str::FromStr;

use bigdecimal::BigDecimal;
use datatrail_core::DECIMAL_DISCRIMINATOR;
use datatrail_core::DEFAULT_HASH_ALGORITHM;
use datatrail_core::HashError;
use datatrail_core::NonCanonicalMetadata;
use datatrail_core::canonical_decimal;
use datatrail_core::canonical_json_bytes;
use datatrail_core::hash_bytes;
use datatrail_core::hash_canonical_json;
use proptest::prelude::*;
use serde_json::json;

// ============================================================================
// SECTION: Canonical Hashing
// ============================================================================

/// Tests canonical json hash is stable under key order.
#[test]
fn test_canonical_json_hash_is_stable() {
    let value_a = json!({"b": 1, "a": 2});
    let value_b = json!({"a": 2, "b": 1});

    let hash_a = hash_canonical_json(DEFAULT_HASH_ALGORITHM, &value_a).unwrap();
    let hash_b = hash_canonical_json(DEFAULT_HASH_ALGORITHM, &value_b).unwrap();

    assert_eq!(hash_a, hash_b);
}

/// Tests distinct values produce distinct hashes.
#[test]
fn test_distinct_values_hash_distinctly() {
    let hash_a = hash_canonical_json(DEFAULT_HASH_ALGORITHM, &json!({"a": 1})).unwrap();
    let hash_b = hash_canonical_json(DEFAULT_HASH_ALGORITHM, &json!({"a": 2})).unwrap();
    assert_ne!(hash_a.value, hash_b.value);
}

/// Tests the digest is lowercase hex of the expected length.
#[test]
fn test_digest_is_lowercase_hex() {
    let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, b"datatrail");
    assert_eq!(digest.value.len(), 64);
    assert!(digest.value.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

/// Tests canonical bytes have no insignificant whitespace and sorted keys.
#[test]
fn test_canonical_bytes_sorted_and_compact() {
    let bytes = canonical_json_bytes(&json!({"z": 1, "a": {"m": true, "b": null}})).unwrap();
    let text = String::from_utf8(bytes).unwrap();
    assert_eq!(text, r#"{"a":{"b":null,"m":true},"z":1}"#);
}

// ============================================================================
// SECTION: Decimal Canonicalization
// ============================================================================

/// Tests a float-exact decimal is emitted as a plain number.
#[test]
fn test_exact_decimal_is_plain_number() {
    let value = canonical_decimal(&BigDecimal::from_str("0.5").unwrap());
    assert_eq!(value, json!(0.5));
}

/// Tests a lossy decimal carries the discriminator.
#[test]
fn test_lossy_decimal_carries_discriminator() {
    let value = canonical_decimal(&BigDecimal::from_str("0.1").unwrap());
    let object = value.as_object().unwrap();
    assert_eq!(object.get(DECIMAL_DISCRIMINATOR), Some(&json!("0.1")));
}

// ============================================================================
// SECTION: Non-Canonical Metadata
// ============================================================================

/// Tests metadata captures the value and the failure reason.
#[test]
fn test_non_canonical_metadata_capture() {
    let value = json!({"score": "NaN"});
    let error = HashError::Canonicalization("non-finite float".to_string());
    let metadata = NonCanonicalMetadata::from_error(&value, &error);
    assert!(metadata.repr_value.contains("NaN"));
    assert_eq!(metadata.type_name, "object");
    assert!(metadata.canonical_error.contains("non-finite"));
}

/// Tests metadata serializes with its discriminator keys.
#[test]
fn test_non_canonical_metadata_keys() {
    let value = json!(1);
    let error = HashError::Canonicalization("x".to_string());
    let metadata = NonCanonicalMetadata::from_error(&value, &error);
    let serialized = serde_json::to_value(&metadata).unwrap();
    assert!(serialized.get("__repr__").is_some());
    assert!(serialized.get("__type__").is_some());
    assert!(serialized.get("__canonical_error__").is_some());
}

// ============================================================================
// SECTION: Properties
// ============================================================================

proptest! {
    /// Canonical bytes are a deterministic function of the value.
    #[test]
    fn prop_canonical_bytes_deterministic(
        entries in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..8)
    ) {
        let value = serde_json::to_value(&entries).unwrap();
        let first = canonical_json_bytes(&value).unwrap();
        let second = canonical_json_bytes(&value).unwrap();
        prop_assert_eq!(first, second);
    }

    /// Hashing commutes with key insertion order.
    #[test]
    fn prop_hash_ignores_key_order(
        entries in proptest::collection::vec(("[a-z]{1,8}", any::<i64>()), 0..8)
    ) {
        let forward: serde_json::Map<String, serde_json::Value> = entries
            .iter()
            .map(|(key, value)| (key.clone(), serde_json::Value::from(*value)))
            .collect();
        let reverse: serde_json::Map<String, serde_json::Value> = entries
            .iter()
            .rev()
            .map(|(key, value)| (key.clone(), serde_json::Value::from(*value)))
            .collect();
        let hash_forward =
            hash_canonical_json(DEFAULT_HASH_ALGORITHM, &forward).unwrap();
        let hash_reverse =
            hash_canonical_json(DEFAULT_HASH_ALGORITHM, &reverse).unwrap();
        prop_assert_eq!(hash_forward, hash_reverse);
    }
}
