// crates/datatrail-core/src/core/contract.rs
// ============================================================================
// Module: Datatrail Schema Contracts
// Description: Per-row field contracts with normalization, merge, and propagation.
// Purpose: Carry field guarantees through the graph and restore names at sinks.
// Dependencies: serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! A schema contract lists the fields a row is guaranteed to carry, keyed by
//! normalized name while preserving the original source name. Contracts merge
//! at coalesce points, propagate through transforms, and are restored at
//! sinks when original headers are requested. Merging is a partial function:
//! conflicting field types raise [`ContractMergeError`] and are treated as a
//! configuration failure, never repaired silently.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Version tag for the field-name normalization algorithm.
pub const NORMALIZATION_VERSION: &str = "norm/1";

// ============================================================================
// SECTION: Field Types
// ============================================================================

/// Declared or inferred field value type.
///
/// # Invariants
/// - Variants are stable for serialization and contract matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// UTF-8 string value.
    String,
    /// Integer value.
    Integer,
    /// Floating point value.
    Float,
    /// Exact decimal value carried as a discriminated string.
    Decimal,
    /// Boolean value.
    Boolean,
    /// RFC 3339 timestamp carried as a string.
    Timestamp,
    /// Arbitrary nested JSON value.
    Json,
}

impl FieldType {
    /// Parses a configuration type string.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::UnknownType`] for unrecognized names.
    pub fn parse(name: &str) -> Result<Self, ContractError> {
        match name.to_ascii_lowercase().as_str() {
            "str" | "string" => Ok(Self::String),
            "int" | "integer" => Ok(Self::Integer),
            "float" | "number" => Ok(Self::Float),
            "decimal" => Ok(Self::Decimal),
            "bool" | "boolean" => Ok(Self::Boolean),
            "datetime" | "timestamp" => Ok(Self::Timestamp),
            "json" => Ok(Self::Json),
            _ => Err(ContractError::UnknownType(name.to_string())),
        }
    }

    /// Infers a field type from a JSON value.
    #[must_use]
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Bool(_) => Self::Boolean,
            Value::Number(number) => {
                if number.is_i64() || number.is_u64() {
                    Self::Integer
                } else {
                    Self::Float
                }
            }
            Value::String(_) => Self::String,
            Value::Null | Value::Array(_) | Value::Object(_) => Self::Json,
        }
    }

    /// Returns true when the JSON value is acceptable for this type.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String | Self::Timestamp => value.is_string(),
            Self::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
            Self::Float => value.is_number(),
            Self::Decimal => value.is_number() || value.is_string() || value.is_object(),
            Self::Boolean => value.is_boolean(),
            Self::Json => true,
        }
    }
}

/// Origin of a field contract entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    /// Declared in pipeline configuration.
    Declared,
    /// Inferred from observed row data.
    Inferred,
}

// ============================================================================
// SECTION: Field Contract
// ============================================================================

/// Contract for a single row field.
///
/// # Invariants
/// - `normalized_name` is the engine-facing key; `original_name` is the
///   source-facing header restored at sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldContract {
    /// Normalized field name used for row access.
    pub normalized_name: String,
    /// Original field name as seen at the source.
    pub original_name: String,
    /// Field value type.
    pub data_type: FieldType,
    /// Whether the field must be present and non-null.
    pub required: bool,
    /// Whether the field was declared or inferred.
    pub source: FieldSource,
}

impl FieldContract {
    /// Creates a declared field whose original name equals the normalized name.
    #[must_use]
    pub fn declared(name: impl Into<String>, data_type: FieldType, required: bool) -> Self {
        let name = name.into();
        Self {
            normalized_name: name.clone(),
            original_name: name,
            data_type,
            required,
            source: FieldSource::Declared,
        }
    }

    /// Creates an inferred field whose original name equals the normalized name.
    #[must_use]
    pub fn inferred(name: impl Into<String>, data_type: FieldType) -> Self {
        let name = name.into();
        Self {
            normalized_name: name.clone(),
            original_name: name,
            data_type,
            required: false,
            source: FieldSource::Inferred,
        }
    }
}

// ============================================================================
// SECTION: Schema Mode
// ============================================================================

/// Contract enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMode {
    /// Declared fields only; violations quarantine the row.
    Strict,
    /// No validation; rows pass through untouched.
    Free,
    /// Declared fields validated; new fields inferred and added.
    Dynamic,
    /// Contract inferred from the first row, then locked.
    Observed,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by contract construction and parsing.
#[derive(Debug, Error)]
pub enum ContractError {
    /// Unrecognized field type name in configuration.
    #[error("unknown field type: {0}")]
    UnknownType(String),
}

/// Error raised when two contracts cannot merge.
#[derive(Debug, Error)]
#[error(
    "contract merge conflict on field '{field}': {left:?} vs {right:?}"
)]
pub struct ContractMergeError {
    /// Normalized name of the conflicting field.
    pub field: String,
    /// Type carried by the left contract.
    pub left: FieldType,
    /// Type carried by the right contract.
    pub right: FieldType,
}

/// A single row's failure against a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    /// Normalized name of the violating field.
    pub field: String,
    /// Human-readable description of the violation.
    pub message: String,
}

// ============================================================================
// SECTION: Schema Contract
// ============================================================================

/// Ordered field contract for a row.
///
/// # Invariants
/// - `fields` is sorted by `normalized_name` and holds at most one entry per
///   normalized name, so merged contracts order deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaContract {
    /// Enforcement mode.
    pub mode: SchemaMode,
    /// Field contracts sorted by normalized name.
    pub fields: Vec<FieldContract>,
    /// Whether the contract is locked against further inference.
    pub locked: bool,
}

impl SchemaContract {
    /// Creates a contract from declared fields.
    #[must_use]
    pub fn declared(mode: SchemaMode, mut fields: Vec<FieldContract>) -> Self {
        fields.sort_by(|a, b| a.normalized_name.cmp(&b.normalized_name));
        fields.dedup_by(|a, b| a.normalized_name == b.normalized_name);
        Self { mode, fields, locked: false }
    }

    /// Creates an empty free-mode contract.
    #[must_use]
    pub const fn free() -> Self {
        Self { mode: SchemaMode::Free, fields: Vec::new(), locked: false }
    }

    /// Infers a contract from an observed row.
    #[must_use]
    pub fn infer_from_row(mode: SchemaMode, row: &Map<String, Value>) -> Self {
        let mut fields: Vec<FieldContract> = row
            .iter()
            .map(|(name, value)| FieldContract::inferred(name.clone(), FieldType::infer(value)))
            .collect();
        fields.sort_by(|a, b| a.normalized_name.cmp(&b.normalized_name));
        Self { mode, fields, locked: false }
    }

    /// Returns the field contract for a normalized name.
    #[must_use]
    pub fn field(&self, normalized_name: &str) -> Option<&FieldContract> {
        self.fields.iter().find(|field| field.normalized_name == normalized_name)
    }

    /// Returns the normalized names of all required fields.
    #[must_use]
    pub fn required_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|field| field.required)
            .map(|field| field.normalized_name.as_str())
            .collect()
    }

    /// Returns the normalized names of all fields.
    #[must_use]
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|field| field.normalized_name.as_str()).collect()
    }

    /// Locks the contract against further inference.
    pub const fn lock(&mut self) {
        self.locked = true;
    }

    /// Merges two contracts at a coalesce point.
    ///
    /// Fields present in both inputs must agree on type; the output is the
    /// union of fields sorted by normalized name. The locked flag is the OR
    /// of the inputs; declared provenance wins over inferred.
    ///
    /// # Errors
    ///
    /// Returns [`ContractMergeError`] when a field carries conflicting types.
    pub fn merge(&self, other: &Self) -> Result<Self, ContractMergeError> {
        let mut merged: BTreeMap<String, FieldContract> = BTreeMap::new();
        for field in &self.fields {
            merged.insert(field.normalized_name.clone(), field.clone());
        }
        for field in &other.fields {
            match merged.get_mut(&field.normalized_name) {
                None => {
                    merged.insert(field.normalized_name.clone(), field.clone());
                }
                Some(existing) => {
                    if existing.data_type != field.data_type {
                        return Err(ContractMergeError {
                            field: field.normalized_name.clone(),
                            left: existing.data_type,
                            right: field.data_type,
                        });
                    }
                    existing.required = existing.required || field.required;
                    if existing.source == FieldSource::Inferred
                        && field.source == FieldSource::Declared
                    {
                        existing.original_name = field.original_name.clone();
                        existing.source = FieldSource::Declared;
                    }
                }
            }
        }
        Ok(Self {
            mode: self.mode,
            fields: merged.into_values().collect(),
            locked: self.locked || other.locked,
        })
    }

    /// Propagates the contract through a transform.
    ///
    /// When `transform_adds_fields` is false the contract is returned as-is.
    /// Otherwise fields present in the output row but absent from the
    /// contract are added as inferred fields with their normalized name as
    /// the original name.
    #[must_use]
    pub fn propagate(&self, output_row: &Map<String, Value>, transform_adds_fields: bool) -> Self {
        if !transform_adds_fields {
            return self.clone();
        }
        let mut propagated = self.clone();
        for (name, value) in output_row {
            if propagated.field(name).is_none() {
                propagated
                    .fields
                    .push(FieldContract::inferred(name.clone(), FieldType::infer(value)));
            }
        }
        propagated.fields.sort_by(|a, b| a.normalized_name.cmp(&b.normalized_name));
        propagated
    }

    /// Validates a row against the contract.
    ///
    /// Free mode accepts everything. Strict mode additionally rejects fields
    /// not present in the contract.
    #[must_use]
    pub fn validate_row(&self, row: &Map<String, Value>) -> Vec<SchemaViolation> {
        let mut violations = Vec::new();
        if self.mode == SchemaMode::Free {
            return violations;
        }
        for field in &self.fields {
            match row.get(&field.normalized_name) {
                None => {
                    if field.required {
                        violations.push(SchemaViolation {
                            field: field.normalized_name.clone(),
                            message: "required field missing".to_string(),
                        });
                    }
                }
                Some(Value::Null) => {
                    if field.required {
                        violations.push(SchemaViolation {
                            field: field.normalized_name.clone(),
                            message: "required field is null".to_string(),
                        });
                    }
                }
                Some(value) => {
                    if !field.data_type.accepts(value) {
                        violations.push(SchemaViolation {
                            field: field.normalized_name.clone(),
                            message: format!(
                                "expected {:?}, got {}",
                                field.data_type,
                                match value {
                                    Value::Bool(_) => "bool",
                                    Value::Number(_) => "number",
                                    Value::String(_) => "string",
                                    Value::Array(_) => "array",
                                    Value::Object(_) => "object",
                                    Value::Null => "null",
                                }
                            ),
                        });
                    }
                }
            }
        }
        if self.mode == SchemaMode::Strict {
            for name in row.keys() {
                if self.field(name).is_none() {
                    violations.push(SchemaViolation {
                        field: name.clone(),
                        message: "field not declared in strict contract".to_string(),
                    });
                }
            }
        }
        violations
    }
}

// ============================================================================
// SECTION: Field Normalization
// ============================================================================

/// Normalizes an original header name into an engine-facing field name.
///
/// Lowercases, maps non-alphanumeric runs to single underscores, trims
/// leading and trailing underscores, and prefixes names that would start
/// with a digit.
#[must_use]
pub fn normalize_field_name(original: &str) -> String {
    let mut out = String::with_capacity(original.len());
    let mut last_was_separator = true;
    for character in original.chars() {
        if character.is_ascii_alphanumeric() {
            out.extend(character.to_lowercase());
            last_was_separator = false;
        } else if !last_was_separator {
            out.push('_');
            last_was_separator = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() {
        return "field".to_string();
    }
    if out.starts_with(|character: char| character.is_ascii_digit()) {
        return format!("f_{out}");
    }
    out
}

// ============================================================================
// SECTION: Pipeline Row
// ============================================================================

/// A row paired with its schema contract.
///
/// Supports dual access by normalized name or by the original source name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRow {
    /// Row data keyed by normalized field name.
    data: Map<String, Value>,
    /// Contract describing the row's fields.
    contract: SchemaContract,
}

impl PipelineRow {
    /// Creates a pipeline row from data and its contract.
    #[must_use]
    pub const fn new(data: Map<String, Value>, contract: SchemaContract) -> Self {
        Self { data, contract }
    }

    /// Returns the value for a normalized or original field name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        if let Some(value) = self.data.get(name) {
            return Some(value);
        }
        let field = self.contract.fields.iter().find(|field| field.original_name == name)?;
        self.data.get(&field.normalized_name)
    }

    /// Returns the row data keyed by normalized names.
    #[must_use]
    pub const fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Returns the row's schema contract.
    #[must_use]
    pub const fn contract(&self) -> &SchemaContract {
        &self.contract
    }

    /// Consumes the row and returns its parts.
    #[must_use]
    pub fn into_parts(self) -> (Map<String, Value>, SchemaContract) {
        (self.data, self.contract)
    }

    /// Returns the row as a JSON value for hashing and storage.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone())
    }
}
