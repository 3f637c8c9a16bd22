// crates/datatrail-plugins/src/source/csv.rs
// ============================================================================
// Module: Datatrail CSV Source
// Description: CSV file source with normalization and typed parsing.
// Purpose: Load delimited rows, validate them against the declared schema,
//          and expose the original-to-normalized header resolution.
// Dependencies: csv, datatrail-core, serde
// ============================================================================

//! ## Overview
//! The CSV source reads one file, optionally normalizes headers (recording
//! the original-to-normalized mapping for sinks and resume), parses cell text
//! into the declared field types, and validates each row. Malformed rows are
//! yielded as quarantined, never raised. Missing files and permission errors
//! propagate as hard source errors.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;

use datatrail_core::Determinism;
use datatrail_core::FieldResolution;
use datatrail_core::FieldType;
use datatrail_core::NORMALIZATION_VERSION;
use datatrail_core::PluginContext;
use datatrail_core::RouteTarget;
use datatrail_core::SchemaContract;
use datatrail_core::SourceError;
use datatrail_core::SourcePlugin;
use datatrail_core::SourceRow;
use datatrail_core::normalize_field_name;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Number;
use serde_json::Value;

use crate::config::PluginConfigError;
use crate::config::SchemaDeclaration;
use crate::config::parse_config;
use crate::source::validate_source_row;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// CSV source options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CsvSourceConfig {
    /// Path to the CSV file.
    pub path: PathBuf,
    /// Field delimiter; a single ASCII character.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Data rows to skip after the header.
    #[serde(default)]
    pub skip_rows: usize,
    /// Whether to normalize header names.
    #[serde(default = "default_true")]
    pub normalize_fields: bool,
    /// Declared schema: field name to type name.
    #[serde(default)]
    pub schema: SchemaDeclaration,
    /// Destination sink for valid rows.
    pub on_success: String,
    /// Destination for invalid rows: a sink name or "discard".
    pub on_validation_failure: String,
}

/// Default CSV delimiter.
const fn default_delimiter() -> char {
    ','
}

/// Serde default helper.
const fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION: Source
// ============================================================================

/// CSV file source.
pub struct CsvSource {
    /// Parsed configuration.
    config: CsvSourceConfig,
    /// Compiled output contract keyed by normalized names.
    contract: SchemaContract,
    /// Quarantine destination.
    on_validation_failure: RouteTarget,
    /// Original-to-normalized header mapping captured during load.
    resolution: Option<FieldResolution>,
}

impl CsvSource {
    /// Plugin name.
    pub const NAME: &'static str = "csv";

    /// Builds a CSV source from its configuration value.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] on malformed configuration.
    pub fn from_config(value: &Value) -> Result<Self, PluginConfigError> {
        let config: CsvSourceConfig = parse_config(Self::NAME, value)?;
        let declared = config.schema.compile(datatrail_core::SchemaMode::Strict)?;
        // Contract keys follow the engine-facing normalized names while the
        // declared names are preserved as the original headers.
        let contract = if config.normalize_fields {
            let mut fields = Vec::with_capacity(declared.fields.len());
            for field in &declared.fields {
                let mut normalized = field.clone();
                normalized.original_name = field.normalized_name.clone();
                normalized.normalized_name = normalize_field_name(&field.normalized_name);
                fields.push(normalized);
            }
            SchemaContract::declared(declared.mode, fields)
        } else {
            declared
        };
        let on_validation_failure = RouteTarget::parse(&config.on_validation_failure);
        Ok(Self { config, contract, on_validation_failure, resolution: None })
    }

    /// Parses one CSV cell into the field's declared type.
    ///
    /// Unparseable cells are passed through as strings so contract
    /// validation reports the violation instead of the parser.
    fn parse_cell(text: &str, field_type: Option<FieldType>) -> Value {
        match field_type {
            Some(FieldType::Integer) => text
                .trim()
                .parse::<i64>()
                .map_or_else(|_| Value::String(text.to_string()), |int| Value::Number(int.into())),
            Some(FieldType::Float | FieldType::Decimal) => text
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map_or_else(|| Value::String(text.to_string()), Value::Number),
            Some(FieldType::Boolean) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Value::Bool(true),
                "false" | "0" | "no" => Value::Bool(false),
                _ => Value::String(text.to_string()),
            },
            _ => Value::String(text.to_string()),
        }
    }
}

impl SourcePlugin for CsvSource {
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
        let file = File::open(&self.config.path).map_err(|err| {
            SourceError::Io(format!("open {}: {err}", self.config.path.display()))
        })?;
        let mut delimiter_byte = [0u8; 4];
        let encoded = self.config.delimiter.encode_utf8(&mut delimiter_byte);
        let delimiter = encoded.as_bytes().first().copied().unwrap_or(b',');
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(file);
        let headers = reader
            .headers()
            .map_err(|err| SourceError::Io(format!("read headers: {err}")))?
            .clone();

        // Capture the header resolution before any row is yielded.
        let mut mapping = BTreeMap::new();
        let normalized_headers: Vec<String> = headers
            .iter()
            .map(|header| {
                let normalized = if self.config.normalize_fields {
                    normalize_field_name(header)
                } else {
                    header.to_string()
                };
                mapping.insert(header.to_string(), normalized.clone());
                normalized
            })
            .collect();
        self.resolution = Some(FieldResolution {
            mapping: mapping.clone(),
            normalization_version: self
                .config
                .normalize_fields
                .then(|| NORMALIZATION_VERSION.to_string()),
        });
        // The declared contract learns the file's actual headers so sinks in
        // original-header mode can restore them.
        for field in &mut self.contract.fields {
            if let Some((original, _)) = mapping
                .iter()
                .find(|(_, normalized)| **normalized == field.normalized_name)
            {
                field.original_name = original.clone();
            }
        }

        let contract = self.contract.clone();
        let on_validation_failure = self.on_validation_failure.clone();
        let skip_rows = self.config.skip_rows;
        let iterator = reader.into_records().skip(skip_rows).map(move |record| {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    // Malformed rows are yielded, not raised.
                    return Ok(SourceRow::quarantined(
                        Value::Null,
                        on_validation_failure.clone(),
                        format!("csv parse error: {err}"),
                    ));
                }
            };
            let mut row = Map::new();
            for (index, cell) in record.iter().enumerate() {
                let name = normalized_headers
                    .get(index)
                    .cloned()
                    .unwrap_or_else(|| format!("column_{index}"));
                let field_type = contract.field(&name).map(|field| field.data_type);
                row.insert(name, Self::parse_cell(cell, field_type));
            }
            Ok(validate_source_row(row, &contract, &on_validation_failure))
        });
        Ok(Box::new(iterator))
    }

    fn get_field_resolution(&self) -> Option<FieldResolution> {
        self.resolution.clone()
    }

    fn get_schema_contract(&self) -> Option<SchemaContract> {
        Some(self.contract.clone())
    }
}
