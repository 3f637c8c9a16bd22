// crates/datatrail-core/src/core/hashing.rs
// ============================================================================
// Module: Datatrail Canonical Hashing
// Description: RFC 8785 JSON canonicalization and content hashing utilities.
// Purpose: Provide deterministic hashes for rows, payloads, configs, and topology.
// Dependencies: bigdecimal, serde, serde_jcs, sha2
// ============================================================================

//! ## Overview
//! Datatrail hashes all canonical JSON using RFC 8785 (JCS) to guarantee
//! stable, replayable digests. Binary payloads are hashed directly over raw
//! bytes. Values that cannot be canonicalized are captured as
//! [`NonCanonicalMetadata`] so the owning row can be quarantined instead of
//! poisoning the audit trail.

// ============================================================================
// SECTION: Imports
// ============================================================================

use bigdecimal::BigDecimal;
use bigdecimal::FromPrimitive;
use bigdecimal::ToPrimitive;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

// ============================================================================
// SECTION: Canonical Version
// ============================================================================

/// Canonical encoding version tag recorded on every run.
///
/// Downstream consumers compare this tag to decide cross-run hash
/// compatibility.
pub const CANONICAL_VERSION: &str = "jcs-sha256/1";

/// Discriminator key used when a decimal cannot be represented losslessly.
pub const DECIMAL_DISCRIMINATOR: &str = "__decimal__";

// ============================================================================
// SECTION: Hash Algorithm
// ============================================================================

/// Supported hash algorithms for Datatrail artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// SHA-256 hashing (FIPS-friendly default).
    Sha256,
}

/// Default hash algorithm for Datatrail.
pub const DEFAULT_HASH_ALGORITHM: HashAlgorithm = HashAlgorithm::Sha256;

// ============================================================================
// SECTION: Hash Digest
// ============================================================================

/// Deterministic content hash representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashDigest {
    /// Hash algorithm identifier.
    pub algorithm: HashAlgorithm,
    /// Lowercase hex-encoded digest bytes.
    pub value: String,
}

impl HashDigest {
    /// Creates a new digest from raw bytes.
    #[must_use]
    pub fn new(algorithm: HashAlgorithm, bytes: &[u8]) -> Self {
        Self { algorithm, value: hex_encode(bytes) }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when computing canonical hashes.
#[derive(Debug, Error)]
pub enum HashError {
    /// JSON canonicalization failed.
    #[error("failed to canonicalize json: {0}")]
    Canonicalization(String),
}

// ============================================================================
// SECTION: Non-Canonical Metadata
// ============================================================================

/// Forensic record stored in place of a payload that failed canonicalization.
///
/// # Invariants
/// - `repr_value` is never empty; it captures what was seen.
/// - `canonical_error` explains why canonical serialization failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonCanonicalMetadata {
    /// Debug rendering of the offending value.
    #[serde(rename = "__repr__")]
    pub repr_value: String,
    /// Type name of the offending value.
    #[serde(rename = "__type__")]
    pub type_name: String,
    /// Why canonicalization failed.
    #[serde(rename = "__canonical_error__")]
    pub canonical_error: String,
}

impl NonCanonicalMetadata {
    /// Builds metadata from a value that failed canonicalization.
    #[must_use]
    pub fn from_error(value: &Value, error: &HashError) -> Self {
        Self {
            repr_value: value.to_string(),
            type_name: json_type_name(value).to_string(),
            canonical_error: error.to_string(),
        }
    }
}

/// Returns the JSON type name for a value.
const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// SECTION: Hashing Helpers
// ============================================================================

/// Returns canonical JSON bytes for a serializable value using RFC 8785.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn canonical_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, HashError> {
    serde_jcs::to_vec(value).map_err(|err| HashError::Canonicalization(err.to_string()))
}

/// Hashes canonical JSON using the provided algorithm.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn hash_canonical_json<T: Serialize + ?Sized>(
    algorithm: HashAlgorithm,
    value: &T,
) -> Result<HashDigest, HashError> {
    let bytes = canonical_json_bytes(value)?;
    Ok(hash_bytes(algorithm, &bytes))
}

/// Hashes raw bytes using the provided algorithm.
#[must_use]
pub fn hash_bytes(algorithm: HashAlgorithm, bytes: &[u8]) -> HashDigest {
    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(bytes);
            let digest = hasher.finalize();
            HashDigest::new(HashAlgorithm::Sha256, &digest)
        }
    }
}

// ============================================================================
// SECTION: Decimal Canonicalization
// ============================================================================

/// Converts a decimal into its canonical JSON form.
///
/// Decimals that survive a round trip through `f64` are emitted as plain
/// numbers. Anything else is emitted as a discriminated object carrying the
/// exact decimal string, so audit hashes never depend on lossy float
/// formatting.
#[must_use]
pub fn canonical_decimal(value: &BigDecimal) -> Value {
    if let Some(float) = value.to_f64()
        && float.is_finite()
        && BigDecimal::from_f64(float).is_some_and(|round_tripped| &round_tripped == value)
        && let Some(number) = serde_json::Number::from_f64(float)
    {
        return Value::Number(number);
    }
    let mut object = serde_json::Map::with_capacity(1);
    object.insert(DECIMAL_DISCRIMINATOR.to_string(), Value::String(value.to_string()));
    Value::Object(object)
}

// ============================================================================
// SECTION: Hex Encoding
// ============================================================================

/// Encodes bytes as a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}
