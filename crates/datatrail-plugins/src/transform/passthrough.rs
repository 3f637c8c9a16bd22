// crates/datatrail-plugins/src/transform/passthrough.rs
// ============================================================================
// Module: Datatrail Passthrough Transform
// Description: Identity transform.
// Purpose: Forward rows unchanged; useful as a pipeline seam and in tests.
// Dependencies: datatrail-core, serde
// ============================================================================

//! ## Overview
//! [`Passthrough`] forwards rows unchanged; useful as a pipeline seam and in
//! tests.

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
use serde::Deserialize;
use serde_json::Value;

use crate::config::PluginConfigError;
use crate::config::parse_config;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Passthrough options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PassthroughConfig {
    /// Destination sink for rows leaving this transform's branch.
    pub on_success: String,
    /// Destination for rejected rows: a sink name or "discard".
    pub on_error: String,
}

// ============================================================================
// SECTION: Transform
// ============================================================================

/// Identity transform.
pub struct Passthrough {
    /// Parsed configuration.
    config: PassthroughConfig,
    /// Error route.
    on_error: RouteTarget,
    /// Free contract: passthrough guarantees nothing beyond its input.
    schema: SchemaContract,
}

impl Passthrough {
    /// Plugin name.
    pub const NAME: &'static str = "passthrough";

    /// Builds a passthrough from its configuration value.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] on malformed configuration.
    pub fn from_config(value: &Value) -> Result<Self, PluginConfigError> {
        let config: PassthroughConfig = parse_config(Self::NAME, value)?;
        let on_error = RouteTarget::parse(&config.on_error);
        Ok(Self { config, on_error, schema: SchemaContract::free() })
    }
}

impl TransformPlugin for Passthrough {
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
        let (data, _) = row.into_parts();
        TransformResult::success(data)
    }
}
