// crates/datatrail-plugins/src/config.rs
// ============================================================================
// Module: Datatrail Plugin Configuration
// Description: Strict configuration parsing shared by the built-in plugins.
// Purpose: Fail closed on malformed plugin options before a run begins.
// Dependencies: datatrail-core, serde, serde_json
// ============================================================================

//! ## Overview
//! Plugin configurations deserialize from JSON values with unknown keys
//! rejected. Schema declarations use the same `field: type` shape everywhere
//! and compile into [`SchemaContract`]s at construction time.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use datatrail_core::ContractError;
use datatrail_core::FieldContract;
use datatrail_core::FieldType;
use datatrail_core::SchemaContract;
use datatrail_core::SchemaMode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while parsing plugin configuration.
#[derive(Debug, Error)]
pub enum PluginConfigError {
    /// The configuration value did not match the plugin's schema.
    #[error("plugin '{plugin}' configuration invalid: {reason}")]
    Invalid {
        /// Plugin name.
        plugin: String,
        /// Parse failure reason.
        reason: String,
    },
    /// A declared field used an unknown type name.
    #[error(transparent)]
    Contract(#[from] ContractError),
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Deserializes a plugin configuration value strictly.
///
/// # Errors
///
/// Returns [`PluginConfigError::Invalid`] when the value does not match.
pub fn parse_config<T: serde::de::DeserializeOwned>(
    plugin: &str,
    value: &Value,
) -> Result<T, PluginConfigError> {
    serde_json::from_value(value.clone()).map_err(|err| PluginConfigError::Invalid {
        plugin: plugin.to_string(),
        reason: err.to_string(),
    })
}

/// Declared schema shape shared by sources and transforms: field name to
/// type name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct SchemaDeclaration(pub BTreeMap<String, String>);

impl SchemaDeclaration {
    /// Compiles the declaration into a contract.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError::Contract`] for unknown type names.
    pub fn compile(&self, mode: SchemaMode) -> Result<SchemaContract, PluginConfigError> {
        let mut fields = Vec::with_capacity(self.0.len());
        for (name, type_name) in &self.0 {
            fields.push(FieldContract::declared(
                name.clone(),
                FieldType::parse(type_name)?,
                true,
            ));
        }
        Ok(SchemaContract::declared(mode, fields))
    }
}
