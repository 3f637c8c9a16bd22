// crates/datatrail-core/src/core/time.rs
// ============================================================================
// Module: Datatrail Time Model
// Description: Canonical timestamp representation for audit records.
// Purpose: Provide deterministic, replayable time values across Datatrail records.
// Dependencies: serde, time
// ============================================================================

//! ## Overview
//! Datatrail records carry explicit UTC timestamps so that replay and audit
//! verification stay deterministic. The core engine never reads wall-clock
//! time directly; hosts supply time through a [`Clock`] implementation. Tests
//! use [`LogicalClock`] to obtain a reproducible monotonic sequence.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

// ============================================================================
// SECTION: Timestamp
// ============================================================================

/// Canonical UTC timestamp stored as unix epoch milliseconds.
///
/// # Invariants
/// - Values are explicitly provided by callers; the core never reads wall-clock time.
/// - Monotonicity within a run is a caller responsibility.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from unix epoch milliseconds.
    #[must_use]
    pub const fn from_unix_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as unix epoch milliseconds.
    #[must_use]
    pub const fn as_unix_millis(self) -> i64 {
        self.0
    }

    /// Renders the timestamp as an RFC 3339 UTC string for exports.
    ///
    /// Falls back to the raw millisecond value when the instant is outside
    /// the representable datetime range.
    #[must_use]
    pub fn to_rfc3339(self) -> String {
        let nanos = i128::from(self.0).saturating_mul(1_000_000);
        OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .ok()
            .and_then(|datetime| datetime.format(&Rfc3339).ok())
            .unwrap_or_else(|| self.0.to_string())
    }
}

// ============================================================================
// SECTION: Clock
// ============================================================================

/// Time source supplied by the host.
pub trait Clock: Send + Sync {
    /// Returns the current timestamp.
    fn now(&self) -> Timestamp;
}

/// Deterministic clock yielding a strictly increasing logical sequence.
#[derive(Debug, Default)]
pub struct LogicalClock {
    /// Next logical millisecond value to hand out.
    next: AtomicI64,
}

impl LogicalClock {
    /// Creates a logical clock starting at the provided millisecond value.
    #[must_use]
    pub const fn starting_at(start: i64) -> Self {
        Self { next: AtomicI64::new(start) }
    }
}

impl Clock for LogicalClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_unix_millis(self.next.fetch_add(1, Ordering::SeqCst))
    }
}
