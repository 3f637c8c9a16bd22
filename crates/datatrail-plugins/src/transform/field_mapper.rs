// crates/datatrail-plugins/src/transform/field_mapper.rs
// ============================================================================
// Module: Datatrail Field Mapper
// Description: Field renaming and selection with original-name preservation.
// Purpose: Reshape rows while keeping the contract's source headers intact.
// Dependencies: datatrail-core, serde, serde_json
// ============================================================================

//! ## Overview
//! The field mapper renames fields (`mapping: {new_name: source_field}`) and
//! optionally drops everything not mentioned (`select_only`). In strict mode
//! a missing source field is an error; otherwise it is skipped. A renamed
//! field loses its original header unless `original_names` supplies one
//! explicitly; unchanged fields keep their original names through contract
//! propagation.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use datatrail_core::Determinism;
use datatrail_core::FieldContract;
use datatrail_core::FieldSource;
use datatrail_core::FieldType;
use datatrail_core::PipelineRow;
use datatrail_core::PluginContext;
use datatrail_core::RouteTarget;
use datatrail_core::SchemaContract;
use datatrail_core::SchemaMode;
use datatrail_core::TransformPlugin;
use datatrail_core::TransformResult;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;

use crate::config::PluginConfigError;
use crate::config::parse_config;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Field mapper options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldMapperConfig {
    /// Renames: new field name to source field name.
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
    /// Drop fields not mentioned in the mapping.
    #[serde(default)]
    pub select_only: bool,
    /// Fail rows whose mapped source field is missing.
    #[serde(default)]
    pub strict: bool,
    /// Explicit original header names for renamed fields.
    #[serde(default)]
    pub original_names: BTreeMap<String, String>,
    /// Destination sink for rows leaving this transform's branch.
    pub on_success: String,
    /// Destination for rejected rows: a sink name or "discard".
    pub on_error: String,
}

// ============================================================================
// SECTION: Transform
// ============================================================================

/// Field renaming and selection transform.
pub struct FieldMapper {
    /// Parsed configuration.
    config: FieldMapperConfig,
    /// Error route.
    on_error: RouteTarget,
    /// Dynamic contract: the output shape depends on configuration, not on
    /// the input schema.
    schema: SchemaContract,
}

impl FieldMapper {
    /// Plugin name.
    pub const NAME: &'static str = "field_mapper";

    /// Builds a field mapper from its configuration value.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] on malformed configuration.
    pub fn from_config(value: &Value) -> Result<Self, PluginConfigError> {
        let config: FieldMapperConfig = parse_config(Self::NAME, value)?;
        for target in config.original_names.keys() {
            if !config.mapping.contains_key(target) {
                return Err(PluginConfigError::Invalid {
                    plugin: Self::NAME.to_string(),
                    reason: format!(
                        "original_names entry '{target}' has no matching mapping entry"
                    ),
                });
            }
        }
        let on_error = RouteTarget::parse(&config.on_error);
        let schema = SchemaContract::declared(SchemaMode::Dynamic, Vec::new());
        Ok(Self { config, on_error, schema })
    }
}

impl TransformPlugin for FieldMapper {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn input_schema(&self) -> &SchemaContract {
        &self.schema
    }

    fn output_schema(&self) -> &SchemaContract {
        &self.schema
    }

    fn transform_adds_fields(&self) -> bool {
        true
    }

    fn on_error(&self) -> &RouteTarget {
        &self.on_error
    }

    fn on_success(&self) -> &str {
        &self.config.on_success
    }

    fn map_contract(&self, input: &SchemaContract) -> Option<SchemaContract> {
        Some(self.mapped_contract(input))
    }

    fn process(&mut self, row: PipelineRow, _ctx: &PluginContext) -> TransformResult {
        let mut output = Map::new();
        let mut renamed_sources: Vec<&String> = Vec::new();
        for (target, source) in &self.config.mapping {
            match row.get(source) {
                Some(value) => {
                    output.insert(target.clone(), value.clone());
                    renamed_sources.push(source);
                }
                None => {
                    if self.config.strict {
                        return TransformResult::error(
                            serde_json::json!({
                                "error": "mapped field missing",
                                "field": source,
                            }),
                            false,
                        );
                    }
                }
            }
        }
        if !self.config.select_only {
            for (name, value) in row.data() {
                if renamed_sources.iter().any(|source| *source == name) {
                    continue;
                }
                output.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
        TransformResult::success(output)
    }
}

// ============================================================================
// SECTION: Contract Restoration
// ============================================================================

impl FieldMapper {
    /// Builds the output contract for a given input contract, carrying
    /// unchanged fields' original names through and applying explicit
    /// original names for renamed fields.
    fn mapped_contract(&self, input: &SchemaContract) -> SchemaContract {
        let mut fields: Vec<FieldContract> = Vec::new();
        for (target, source) in &self.config.mapping {
            let data_type = input
                .field(source)
                .map_or(FieldType::Json, |field| field.data_type);
            let original_name = self
                .config
                .original_names
                .get(target)
                .cloned()
                .unwrap_or_else(|| target.clone());
            fields.push(FieldContract {
                normalized_name: target.clone(),
                original_name,
                data_type,
                required: false,
                source: FieldSource::Declared,
            });
        }
        if !self.config.select_only {
            for field in &input.fields {
                if self.config.mapping.values().any(|source| *source == field.normalized_name) {
                    continue;
                }
                if fields.iter().any(|existing| {
                    existing.normalized_name == field.normalized_name
                }) {
                    continue;
                }
                fields.push(field.clone());
            }
        }
        SchemaContract::declared(input.mode, fields)
    }
}
