// crates/datatrail-config/src/lib.rs
// ============================================================================
// Module: Datatrail Config Library
// Description: Strict TOML configuration loading for Datatrail pipelines.
// Purpose: Turn configuration files into wired pipelines, failing closed.
// Dependencies: datatrail-core, datatrail-plugins, toml
// ============================================================================

//! ## Overview
//! Configuration is the only place a pipeline is described outside code.
//! Loading is strict: unknown keys, missing required options, unknown plugin
//! names, and structural limit violations are errors before any run begins.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::ConfigError;
pub use config::LoadedConfig;
pub use config::MAX_CONFIG_FILE_SIZE;
pub use config::StoreDeclaration;
pub use config::load_config;
