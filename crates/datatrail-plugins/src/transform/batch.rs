// crates/datatrail-plugins/src/transform/batch.rs
// ============================================================================
// Module: Datatrail Batch Transforms
// Description: Batch-aware transforms for aggregation nodes.
// Purpose: Pass buffered rows through or reduce them to summary rows.
// Dependencies: datatrail-core, serde
// ============================================================================

//! ## Overview
//! Aggregation nodes require batch-aware transforms. [`BatchPassthrough`]
//! emits every buffered row unchanged (passthrough output mode);
//! [`BatchStats`] reduces the buffer to one summary row with a count and
//! per-field numeric sums (single output mode).

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use datatrail_core::Determinism;
use datatrail_core::PipelineRow;
use datatrail_core::PluginContext;
use datatrail_core::RouteTarget;
use datatrail_core::SchemaContract;
use datatrail_core::TransformPlugin;
use datatrail_core::TransformResult;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Number;
use serde_json::Value;

use crate::config::PluginConfigError;
use crate::config::parse_config;

// ============================================================================
// SECTION: Shared Configuration
// ============================================================================

/// Options shared by the built-in batch transforms.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchTransformConfig {
    /// Destination sink for rows leaving this transform's branch.
    pub on_success: String,
    /// Destination for rejected rows: a sink name or "discard".
    pub on_error: String,
}

// ============================================================================
// SECTION: Batch Passthrough
// ============================================================================

/// Batch transform that emits every buffered row unchanged.
pub struct BatchPassthrough {
    /// Parsed configuration.
    config: BatchTransformConfig,
    /// Error route.
    on_error: RouteTarget,
    /// Free contract.
    schema: SchemaContract,
}

impl BatchPassthrough {
    /// Plugin name.
    pub const NAME: &'static str = "batch_passthrough";

    /// Builds a batch passthrough from its configuration value.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] on malformed configuration.
    pub fn from_config(value: &Value) -> Result<Self, PluginConfigError> {
        let config: BatchTransformConfig = parse_config(Self::NAME, value)?;
        let on_error = RouteTarget::parse(&config.on_error);
        Ok(Self { config, on_error, schema: SchemaContract::free() })
    }
}

impl TransformPlugin for BatchPassthrough {
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

    fn is_batch_aware(&self) -> bool {
        true
    }

    fn on_error(&self) -> &RouteTarget {
        &self.on_error
    }

    fn on_success(&self) -> &str {
        &self.config.on_success
    }

    fn process(&mut self, row: PipelineRow, _ctx: &PluginContext) -> TransformResult {
        let (data, _) = row.into_parts();
        TransformResult::success(data)
    }

    fn process_batch(&mut self, rows: Vec<PipelineRow>, _ctx: &PluginContext) -> TransformResult {
        TransformResult::success_multi(
            rows.into_iter().map(|row| row.into_parts().0).collect(),
        )
    }
}

// ============================================================================
// SECTION: Batch Stats
// ============================================================================

/// Batch transform that reduces the buffer to one summary row.
pub struct BatchStats {
    /// Parsed configuration.
    config: BatchTransformConfig,
    /// Error route.
    on_error: RouteTarget,
    /// Free contract: the summary shape depends on the observed fields.
    schema: SchemaContract,
}

impl BatchStats {
    /// Plugin name.
    pub const NAME: &'static str = "batch_stats";

    /// Builds a batch stats transform from its configuration value.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] on malformed configuration.
    pub fn from_config(value: &Value) -> Result<Self, PluginConfigError> {
        let config: BatchTransformConfig = parse_config(Self::NAME, value)?;
        let on_error = RouteTarget::parse(&config.on_error);
        Ok(Self { config, on_error, schema: SchemaContract::free() })
    }
}

impl TransformPlugin for BatchStats {
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

    fn is_batch_aware(&self) -> bool {
        true
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

    fn process(&mut self, row: PipelineRow, _ctx: &PluginContext) -> TransformResult {
        let (data, _) = row.into_parts();
        TransformResult::success(data)
    }

    fn process_batch(&mut self, rows: Vec<PipelineRow>, _ctx: &PluginContext) -> TransformResult {
        let mut sums: BTreeMap<String, f64> = BTreeMap::new();
        for row in &rows {
            for (field, value) in row.data() {
                if let Some(number) = value.as_f64() {
                    *sums.entry(format!("{field}_sum")).or_insert(0.0) += number;
                }
            }
        }
        let mut summary = Map::new();
        summary.insert("row_count".to_string(), Value::Number(Number::from(rows.len())));
        for (field, sum) in sums {
            if let Some(number) = Number::from_f64(sum) {
                summary.insert(field, Value::Number(number));
            }
        }
        TransformResult::success(summary)
    }
}
