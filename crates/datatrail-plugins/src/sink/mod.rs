// crates/datatrail-plugins/src/sink/mod.rs
// ============================================================================
// Module: Datatrail Sinks
// Description: File sinks with durable flush and resume support.
// Purpose: Write rows to CSV and JSONL artifacts with audit descriptors.
// Dependencies: crate::sink submodules
// ============================================================================

//! ## Overview
//! File sinks append incrementally, report artifacts with content hashes and
//! sizes, and make `flush()` mean fsync. Both sinks support resume: append
//! mode plus output-target validation against the existing file.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod csv;
pub mod json;

// ============================================================================
// SECTION: Shared Helpers
// ============================================================================

use std::path::Path;

use datatrail_core::DEFAULT_HASH_ALGORITHM;
use datatrail_core::SinkError;
use datatrail_core::hash_bytes;

/// Hashes a written artifact file, returning (hash, size).
///
/// # Errors
///
/// Returns [`SinkError::Io`] when the file cannot be read.
pub fn hash_artifact(path: &Path) -> Result<(String, u64), SinkError> {
    let bytes = std::fs::read(path).map_err(|err| SinkError::Io(err.to_string()))?;
    let size = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
    Ok((hash_bytes(DEFAULT_HASH_ALGORITHM, &bytes).value, size))
}

/// Sink write mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Create the file; fail when it already exists.
    #[default]
    Write,
    /// Append to an existing file (resume).
    Append,
    /// Replace any existing file.
    Replace,
}
