// crates/datatrail-core/src/core/identifiers.rs
// ============================================================================
// Module: Datatrail Identifiers
// Description: Canonical opaque identifiers for Datatrail audit records.
// Purpose: Provide strongly typed, serializable IDs with stable string forms.
// Dependencies: serde, sha2
// ============================================================================

//! ## Overview
//! This module defines the canonical string-based identifiers used throughout
//! Datatrail. Identifiers are opaque and serialize as strings; uniqueness is
//! scoped to a run unless noted. Generated identifiers are deterministic per
//! run so that resumed runs re-derive the same IDs for the same work.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

// ============================================================================
// SECTION: Identifier Macro
// ============================================================================

/// Declares an opaque string identifier newtype with the standard surface.
macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }
    };
}

// ============================================================================
// SECTION: Identifier Types
// ============================================================================

string_id! {
    /// Run identifier for one pipeline execution.
    RunId
}

string_id! {
    /// Node identifier for a plugin instance in the execution graph.
    NodeId
}

string_id! {
    /// Edge identifier for a directed connection between nodes.
    EdgeId
}

string_id! {
    /// Row identifier for a single source row.
    RowId
}

string_id! {
    /// Token identifier for a row instance on one DAG path.
    TokenId
}

string_id! {
    /// Node state identifier for one processing attempt.
    StateId
}

string_id! {
    /// Call identifier for one external I/O call.
    CallId
}

string_id! {
    /// Operation identifier for source- or sink-level I/O.
    OperationId
}

string_id! {
    /// Artifact identifier for a sink output.
    ArtifactId
}

string_id! {
    /// Routing event identifier for a gate decision.
    EventId
}

string_id! {
    /// Batch identifier for an aggregation window.
    BatchId
}

string_id! {
    /// Checkpoint identifier for a crash-recovery marker.
    CheckpointId
}

string_id! {
    /// Outcome identifier for a recorded token outcome.
    OutcomeId
}

string_id! {
    /// Group identifier shared by tokens created together (fork, join, expand).
    GroupId
}

string_id! {
    /// Error record identifier for validation and transform errors.
    ErrorId
}

// ============================================================================
// SECTION: Deterministic Generation
// ============================================================================

/// Deterministic identifier generator seeded by the run.
///
/// # Invariants
/// - The same seed and call sequence always yields the same identifiers.
/// - Generated IDs are unique within a run for a given kind.
#[derive(Debug)]
pub struct IdGenerator {
    /// Seed string, typically the run identifier.
    seed: String,
    /// Monotonic counter shared across kinds.
    counter: u64,
}

impl IdGenerator {
    /// Creates a generator seeded by the provided string.
    #[must_use]
    pub fn new(seed: impl Into<String>) -> Self {
        Self { seed: seed.into(), counter: 0 }
    }

    /// Returns the next identifier for the given kind prefix.
    #[must_use]
    pub fn next_id(&mut self, kind: &str) -> String {
        let counter = self.counter;
        self.counter = self.counter.wrapping_add(1);
        let mut hasher = Sha256::new();
        hasher.update(self.seed.as_bytes());
        hasher.update([0u8]);
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(counter.to_be_bytes());
        let digest = hasher.finalize();
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut hex = String::with_capacity(24);
        for byte in digest.iter().take(12) {
            hex.push(HEX[(byte >> 4) as usize] as char);
            hex.push(HEX[(byte & 0x0f) as usize] as char);
        }
        format!("{kind}_{hex}")
    }
}
