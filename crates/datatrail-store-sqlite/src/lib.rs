// crates/datatrail-store-sqlite/src/lib.rs
// ============================================================================
// Module: Datatrail SQLite Store Library
// Description: Durable Landscape store and filesystem payload store.
// Purpose: Expose the SQLite Landscape and content-addressed payload storage.
// Dependencies: datatrail-core, rusqlite
// ============================================================================

//! ## Overview
//! This crate provides the durable halves of Datatrail persistence: the
//! [`SqliteLandscape`] audit store (WAL journal, per-record transactions,
//! foreign keys with RESTRICT semantics, partial-unique terminal outcomes)
//! and the [`FsPayloadStore`] content-addressed blob store.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod payload;
pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use payload::FsPayloadStore;
pub use store::SqliteJournalMode;
pub use store::SqliteLandscape;
pub use store::SqliteStoreConfig;
pub use store::SqliteStoreError;
pub use store::SqliteSyncMode;
