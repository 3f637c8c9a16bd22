// crates/datatrail-plugins/src/registry.rs
// ============================================================================
// Module: Datatrail Plugin Registry
// Description: Name-to-constructor registry for the built-in plugins.
// Purpose: Build plugin instances from configuration values by plugin name.
// Dependencies: crate plugins, datatrail-core
// ============================================================================

//! ## Overview
//! The registry maps plugin names to constructors. It is built once at
//! orchestrator start and passed by reference; there is no process-wide
//! mutable state. Unknown plugin names fail closed at configuration time.

// ============================================================================
// SECTION: Imports
// ============================================================================

use datatrail_core::GatePlugin;
use datatrail_core::SinkPlugin;
use datatrail_core::SourcePlugin;
use datatrail_core::TransformPlugin;
use serde_json::Value;

use crate::config::PluginConfigError;
use crate::gate::RuleGate;
use crate::sink::csv::CsvSink;
use crate::sink::json::JsonSink;
use crate::source::csv::CsvSource;
use crate::source::json::JsonSource;
use crate::transform::batch::BatchPassthrough;
use crate::transform::batch::BatchStats;
use crate::transform::field_mapper::FieldMapper;
use crate::transform::keyword_filter::KeywordFilter;
use crate::transform::passthrough::Passthrough;

// ============================================================================
// SECTION: Registry
// ============================================================================

/// Built-in plugin registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct PluginRegistry;

impl PluginRegistry {
    /// Creates the registry.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds a source plugin by name.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] for unknown names or bad configuration.
    pub fn build_source(
        &self,
        plugin: &str,
        config: &Value,
    ) -> Result<Box<dyn SourcePlugin>, PluginConfigError> {
        match plugin {
            CsvSource::NAME => Ok(Box::new(CsvSource::from_config(config)?)),
            JsonSource::NAME => Ok(Box::new(JsonSource::from_config(config)?)),
            other => Err(PluginConfigError::Invalid {
                plugin: other.to_string(),
                reason: "unknown source plugin".to_string(),
            }),
        }
    }

    /// Builds a transform plugin by name.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] for unknown names or bad configuration.
    pub fn build_transform(
        &self,
        plugin: &str,
        config: &Value,
    ) -> Result<Box<dyn TransformPlugin>, PluginConfigError> {
        match plugin {
            Passthrough::NAME => Ok(Box::new(Passthrough::from_config(config)?)),
            FieldMapper::NAME => Ok(Box::new(FieldMapper::from_config(config)?)),
            KeywordFilter::NAME => Ok(Box::new(KeywordFilter::from_config(config)?)),
            BatchPassthrough::NAME => Ok(Box::new(BatchPassthrough::from_config(config)?)),
            BatchStats::NAME => Ok(Box::new(BatchStats::from_config(config)?)),
            other => Err(PluginConfigError::Invalid {
                plugin: other.to_string(),
                reason: "unknown transform plugin".to_string(),
            }),
        }
    }

    /// Builds a gate plugin by name.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] for unknown names or bad configuration.
    pub fn build_gate(
        &self,
        plugin: &str,
        config: &Value,
    ) -> Result<Box<dyn GatePlugin>, PluginConfigError> {
        match plugin {
            RuleGate::NAME => Ok(Box::new(RuleGate::from_config(config)?)),
            other => Err(PluginConfigError::Invalid {
                plugin: other.to_string(),
                reason: "unknown gate plugin".to_string(),
            }),
        }
    }

    /// Builds a sink plugin by name.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] for unknown names or bad configuration.
    pub fn build_sink(
        &self,
        plugin: &str,
        config: &Value,
    ) -> Result<Box<dyn SinkPlugin>, PluginConfigError> {
        match plugin {
            CsvSink::NAME => Ok(Box::new(CsvSink::from_config(config)?)),
            JsonSink::NAME => Ok(Box::new(JsonSink::from_config(config)?)),
            other => Err(PluginConfigError::Invalid {
                plugin: other.to_string(),
                reason: "unknown sink plugin".to_string(),
            }),
        }
    }
}
