// crates/datatrail-plugins/src/transform/keyword_filter.rs
// ============================================================================
// Module: Datatrail Keyword Filter
// Description: Blocks rows whose fields match configured patterns.
// Purpose: Route rows containing blocked content to the error destination.
// Dependencies: datatrail-core, regex, serde
// ============================================================================

//! ## Overview
//! The keyword filter scans configured fields (or every string field with
//! `"all"`) against a list of blocked regular expressions. A match routes the
//! row to `on_error` with the matched pattern in the error payload. Patterns
//! are validated at construction: empty lists and nested quantifiers (a
//! catastrophic-backtracking hazard) are configuration errors.

// ============================================================================
// SECTION: Imports
// ============================================================================

use datatrail_core::Determinism;
use datatrail_core::PipelineRow;
use datatrail_core::PluginContext;
use datatrail_core::RouteTarget;
use datatrail_core::SchemaContract;
use datatrail_core::TransformPlugin;
use datatrail_core::TransformResult;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::config::PluginConfigError;
use crate::config::parse_config;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Which fields the filter scans.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FilterFields {
    /// A single field name, or the literal "all" for every string field.
    One(String),
    /// An explicit field list.
    Many(Vec<String>),
}

/// Keyword filter options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeywordFilterConfig {
    /// Fields to scan.
    pub fields: FilterFields,
    /// Blocked regular expression patterns.
    pub blocked_patterns: Vec<String>,
    /// Destination sink for rows leaving this transform's branch.
    pub on_success: String,
    /// Destination for blocked rows: a sink name or "discard".
    pub on_error: String,
}

// ============================================================================
// SECTION: Pattern Safety
// ============================================================================

/// Rejects patterns with nested quantifiers such as `(a+)+` or `(a*)*`.
fn validate_regex_safety(pattern: &str) -> Result<(), String> {
    let mut previous_quantified = false;
    let mut depth_quantified: Vec<bool> = Vec::new();
    for character in pattern.chars() {
        match character {
            '(' => {
                depth_quantified.push(false);
                previous_quantified = false;
            }
            ')' => {
                let inner = depth_quantified.pop().unwrap_or(false);
                previous_quantified = inner;
            }
            '*' | '+' => {
                if previous_quantified {
                    return Err(format!("nested quantifier in pattern '{pattern}'"));
                }
                if let Some(top) = depth_quantified.last_mut() {
                    *top = true;
                }
                previous_quantified = true;
            }
            '{' => {
                if previous_quantified {
                    return Err(format!("nested quantifier in pattern '{pattern}'"));
                }
                previous_quantified = true;
            }
            _ => {
                previous_quantified = false;
            }
        }
    }
    Ok(())
}

// ============================================================================
// SECTION: Transform
// ============================================================================

/// Blocked-content filter transform.
pub struct KeywordFilter {
    /// Parsed configuration.
    config: KeywordFilterConfig,
    /// Compiled blocked patterns.
    patterns: Vec<Regex>,
    /// Error route.
    on_error: RouteTarget,
    /// Free contract: the filter does not reshape rows.
    schema: SchemaContract,
}

impl KeywordFilter {
    /// Plugin name.
    pub const NAME: &'static str = "keyword_filter";

    /// Builds a keyword filter from its configuration value.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] on malformed configuration, empty
    /// pattern lists, or unsafe patterns.
    pub fn from_config(value: &Value) -> Result<Self, PluginConfigError> {
        let config: KeywordFilterConfig = parse_config(Self::NAME, value)?;
        if config.blocked_patterns.is_empty() {
            return Err(PluginConfigError::Invalid {
                plugin: Self::NAME.to_string(),
                reason: "blocked_patterns must not be empty".to_string(),
            });
        }
        let mut patterns = Vec::with_capacity(config.blocked_patterns.len());
        for pattern in &config.blocked_patterns {
            validate_regex_safety(pattern).map_err(|reason| PluginConfigError::Invalid {
                plugin: Self::NAME.to_string(),
                reason,
            })?;
            let compiled = Regex::new(pattern).map_err(|err| PluginConfigError::Invalid {
                plugin: Self::NAME.to_string(),
                reason: format!("pattern '{pattern}' does not compile: {err}"),
            })?;
            patterns.push(compiled);
        }
        let on_error = RouteTarget::parse(&config.on_error);
        Ok(Self { config, patterns, on_error, schema: SchemaContract::free() })
    }

    /// Returns the text values the filter scans for a row.
    fn scanned_values<'row>(&'row self, row: &'row PipelineRow) -> Vec<(&'row str, &'row str)> {
        let mut values = Vec::new();
        match &self.config.fields {
            FilterFields::One(name) if name == "all" => {
                for (field, value) in row.data() {
                    if let Value::String(text) = value {
                        values.push((field.as_str(), text.as_str()));
                    }
                }
            }
            FilterFields::One(name) => {
                if let Some(Value::String(text)) = row.get(name) {
                    values.push((name.as_str(), text.as_str()));
                }
            }
            FilterFields::Many(names) => {
                for name in names {
                    if let Some(Value::String(text)) = row.get(name) {
                        values.push((name.as_str(), text.as_str()));
                    }
                }
            }
        }
        values
    }
}

impl TransformPlugin for KeywordFilter {
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

    fn on_error(&self) -> &RouteTarget {
        &self.on_error
    }

    fn on_success(&self) -> &str {
        &self.config.on_success
    }

    fn process(&mut self, row: PipelineRow, _ctx: &PluginContext) -> TransformResult {
        for (field, text) in self.scanned_values(&row) {
            for (index, pattern) in self.patterns.iter().enumerate() {
                if pattern.is_match(text) {
                    return TransformResult::error(
                        serde_json::json!({
                            "error": "blocked content",
                            "field": field,
                            "pattern": self.config.blocked_patterns[index],
                        }),
                        false,
                    );
                }
            }
        }
        let (data, _) = row.into_parts();
        TransformResult::success(data)
    }
}
