// crates/datatrail-plugins/src/source/json.rs
// ============================================================================
// Module: Datatrail JSON Source
// Description: JSON and JSONL file source with nested data keys.
// Purpose: Load object rows from JSON arrays, JSONL streams, or nested keys.
// Dependencies: datatrail-core, serde, serde_json
// ============================================================================

//! ## Overview
//! The JSON source accepts three layouts: a top-level array of objects, a
//! JSONL stream of one object per line, or an object whose `data_key` holds
//! the row array. `auto` sniffs the layout from the first non-whitespace
//! byte. Rows that are not objects, or that fail validation, are quarantined.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::path::PathBuf;

use datatrail_core::Determinism;
use datatrail_core::PluginContext;
use datatrail_core::RouteTarget;
use datatrail_core::SchemaContract;
use datatrail_core::SchemaMode;
use datatrail_core::SourceError;
use datatrail_core::SourcePlugin;
use datatrail_core::SourceRow;
use serde::Deserialize;
use serde_json::Value;

use crate::config::PluginConfigError;
use crate::config::SchemaDeclaration;
use crate::config::parse_config;
use crate::source::validate_source_row;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// JSON source file layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JsonFormat {
    /// A top-level JSON array (or `data_key` object).
    Json,
    /// One JSON object per line.
    Jsonl,
    /// Sniff the layout from the file.
    #[default]
    Auto,
}

/// JSON source options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonSourceConfig {
    /// Path to the JSON file.
    pub path: PathBuf,
    /// File layout.
    #[serde(default)]
    pub format: JsonFormat,
    /// Key holding the row array for nested JSON documents.
    #[serde(default)]
    pub data_key: Option<String>,
    /// Declared schema: field name to type name.
    #[serde(default)]
    pub schema: SchemaDeclaration,
    /// Destination sink for valid rows.
    pub on_success: String,
    /// Destination for invalid rows: a sink name or "discard".
    pub on_validation_failure: String,
}

// ============================================================================
// SECTION: Source
// ============================================================================

/// JSON file source.
pub struct JsonSource {
    /// Parsed configuration.
    config: JsonSourceConfig,
    /// Compiled output contract.
    contract: SchemaContract,
    /// Quarantine destination.
    on_validation_failure: RouteTarget,
}

impl JsonSource {
    /// Plugin name.
    pub const NAME: &'static str = "json";

    /// Builds a JSON source from its configuration value.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] on malformed configuration.
    pub fn from_config(value: &Value) -> Result<Self, PluginConfigError> {
        let config: JsonSourceConfig = parse_config(Self::NAME, value)?;
        let mode =
            if config.schema.0.is_empty() { SchemaMode::Free } else { SchemaMode::Strict };
        let contract = config.schema.compile(mode)?;
        let on_validation_failure = RouteTarget::parse(&config.on_validation_failure);
        Ok(Self { config, contract, on_validation_failure })
    }

    /// Converts one parsed value into a source row.
    fn row_from_value(
        &self,
        value: Value,
    ) -> SourceRow {
        match value {
            Value::Object(map) => {
                validate_source_row(map, &self.contract, &self.on_validation_failure)
            }
            other => SourceRow::quarantined(
                other,
                self.on_validation_failure.clone(),
                "row is not a JSON object",
            ),
        }
    }
}

impl SourcePlugin for JsonSource {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }

    fn output_schema(&self) -> &SchemaContract {
        &self.contract
    }

    fn on_success(&self) -> &str {
        &self.config.on_success
    }

    fn on_validation_failure(&self) -> &RouteTarget {
        &self.on_validation_failure
    }

    fn load(
        &mut self,
        _ctx: &PluginContext,
    ) -> Result<Box<dyn Iterator<Item = Result<SourceRow, SourceError>> + '_>, SourceError> {
        let text = fs::read_to_string(&self.config.path).map_err(|err| {
            SourceError::Io(format!("open {}: {err}", self.config.path.display()))
        })?;
        let format = match self.config.format {
            JsonFormat::Auto => {
                // An array or object document is JSON; anything else is
                // treated as JSONL.
                match text.trim_start().chars().next() {
                    Some('[' | '{') => JsonFormat::Json,
                    _ => JsonFormat::Jsonl,
                }
            }
            declared => declared,
        };
        let rows: Vec<SourceRow> = match format {
            JsonFormat::Json | JsonFormat::Auto => {
                let document: Value = serde_json::from_str(&text)
                    .map_err(|err| SourceError::Io(format!("parse json: {err}")))?;
                let items = match (&self.config.data_key, document) {
                    (Some(key), Value::Object(mut map)) => match map.remove(key) {
                        Some(Value::Array(items)) => items,
                        Some(other) => {
                            return Err(SourceError::InvalidConfig(format!(
                                "data_key '{key}' does not hold an array, found {other}"
                            )));
                        }
                        None => {
                            return Err(SourceError::InvalidConfig(format!(
                                "data_key '{key}' is missing from the document"
                            )));
                        }
                    },
                    (None, Value::Array(items)) => items,
                    (None, other) => {
                        return Err(SourceError::InvalidConfig(format!(
                            "expected a top-level array; found {}",
                            match other {
                                Value::Object(_) => "an object (set data_key)",
                                _ => "a scalar",
                            }
                        )));
                    }
                    (Some(_), other) => {
                        return Err(SourceError::InvalidConfig(format!(
                            "data_key requires an object document, found {other}"
                        )));
                    }
                };
                items.into_iter().map(|item| self.row_from_value(item)).collect()
            }
            JsonFormat::Jsonl => text
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| match serde_json::from_str::<Value>(line) {
                    Ok(value) => self.row_from_value(value),
                    Err(err) => SourceRow::quarantined(
                        Value::String(line.to_string()),
                        self.on_validation_failure.clone(),
                        format!("jsonl parse error: {err}"),
                    ),
                })
                .collect(),
        };
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn get_schema_contract(&self) -> Option<SchemaContract> {
        Some(self.contract.clone())
    }
}
