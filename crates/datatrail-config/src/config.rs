// crates/datatrail-config/src/config.rs
// ============================================================================
// Module: Datatrail Configuration
// Description: Configuration loading and validation for Datatrail pipelines.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: datatrail-core, datatrail-plugins, serde, toml
// ============================================================================

//! ## Overview
//! Pipeline configuration is loaded from a TOML file with strict size limits
//! and unknown keys rejected. Parsing produces a fully wired
//! [`PipelineConfig`]: every plugin is constructed through the registry, gate
//! targets are resolved, and missing or invalid options fail closed before a
//! run can begin.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use datatrail_core::AggregationSettings;
use datatrail_core::CoalescePolicy;
use datatrail_core::CoalesceSettings;
use datatrail_core::ExportSettings;
use datatrail_core::MergeStrategy;
use datatrail_core::NodeId;
use datatrail_core::OutputMode;
use datatrail_core::PipelineConfig;
use datatrail_core::StepConfig;
use datatrail_core::StepTarget;
use datatrail_plugins::PluginConfigError;
use datatrail_plugins::PluginRegistry;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum configuration file size in bytes.
pub const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum number of pipeline steps.
pub const MAX_STEPS: usize = 256;
/// Maximum number of sinks.
pub const MAX_SINKS: usize = 64;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("config io error: {0}")]
    Io(String),
    /// Config file exceeded the size limit.
    #[error("config file too large: {actual} bytes (max {max})")]
    TooLarge {
        /// Maximum allowed bytes.
        max: usize,
        /// Actual size in bytes.
        actual: usize,
    },
    /// Config file did not parse as TOML.
    #[error("config parse error: {0}")]
    Parse(String),
    /// A structural limit was exceeded.
    #[error("config limit exceeded: {0}")]
    Limit(String),
    /// A required field is missing or invalid.
    #[error("config field invalid: {0}")]
    Field(String),
    /// A plugin rejected its options.
    #[error(transparent)]
    Plugin(#[from] PluginConfigError),
}

// ============================================================================
// SECTION: File Schema
// ============================================================================

/// Top-level configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    /// Pipeline name.
    pipeline_name: String,
    /// Create a checkpoint every N rows.
    #[serde(default)]
    checkpoint_every_rows: Option<u64>,
    /// Source declaration.
    source: PluginDeclaration,
    /// Ordered pipeline steps.
    #[serde(default, rename = "step")]
    steps: Vec<StepDeclaration>,
    /// Sink declarations.
    #[serde(rename = "sink")]
    sinks: Vec<PluginDeclaration>,
    /// Optional audit export.
    #[serde(default)]
    export: Option<ExportDeclaration>,
    /// Optional store configuration handed to the runner.
    #[serde(default)]
    store: Option<StoreDeclaration>,
}

/// A plugin name plus its options table.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PluginDeclaration {
    /// Plugin name in the registry.
    plugin: String,
    /// Plugin options, passed through verbatim.
    #[serde(default)]
    options: toml::Table,
}

/// One pipeline step declaration.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StepDeclaration {
    /// A single-row transform.
    Transform {
        /// Plugin name in the registry.
        plugin: String,
        /// Plugin options.
        #[serde(default)]
        options: toml::Table,
    },
    /// A gate with labeled targets.
    Gate {
        /// Plugin name in the registry.
        plugin: String,
        /// Plugin options.
        #[serde(default)]
        options: toml::Table,
        /// Edge label to target ("continue", "sink:NAME", "step:N").
        #[serde(default)]
        targets: BTreeMap<String, String>,
    },
    /// An aggregation step owning a batch transform.
    Aggregation {
        /// Batch transform plugin name.
        plugin: String,
        /// Plugin options.
        #[serde(default)]
        options: toml::Table,
        /// Aggregation instance name.
        name: String,
        /// Count trigger.
        #[serde(default)]
        count_trigger: Option<usize>,
        /// Time trigger in milliseconds.
        #[serde(default)]
        timeout_ms: Option<i64>,
        /// Output mode: single, passthrough, or transform.
        output_mode: String,
    },
    /// A coalesce join step.
    Coalesce {
        /// Coalesce instance name.
        name: String,
        /// Expected branch labels in declaration order.
        expected_branches: Vec<String>,
        /// Join policy: require_all, best_effort, first, or quorum:N.
        policy: String,
        /// Merge strategy: union, nested, or select:a,b,c.
        merge: String,
    },
}

/// Audit export declaration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExportDeclaration {
    /// Export format: json or csv.
    format: String,
    /// Destination path.
    path: PathBuf,
    /// Sign the export with the environment key.
    #[serde(default)]
    sign: bool,
}

/// Store configuration surfaced to the runner.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreDeclaration {
    /// SQLite database path.
    pub database_path: PathBuf,
    /// Payload store directory.
    #[serde(default)]
    pub payload_dir: Option<PathBuf>,
}

// ============================================================================
// SECTION: Loading
// ============================================================================

/// A loaded configuration: the wired pipeline plus runner-level settings.
#[derive(Debug)]
pub struct LoadedConfig {
    /// The wired pipeline.
    pub pipeline: PipelineConfig,
    /// Store configuration, when declared.
    pub store: Option<StoreDeclaration>,
}

/// Loads and validates a pipeline configuration file.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file cannot be read, exceeds limits,
/// fails to parse, or declares invalid plugins.
pub fn load_config(path: &Path, registry: &PluginRegistry) -> Result<LoadedConfig, ConfigError> {
    let bytes = fs::read(path).map_err(|err| ConfigError::Io(err.to_string()))?;
    if bytes.len() > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::TooLarge { max: MAX_CONFIG_FILE_SIZE, actual: bytes.len() });
    }
    let text = String::from_utf8(bytes)
        .map_err(|err| ConfigError::Parse(format!("config is not UTF-8: {err}")))?;
    let file: ConfigFile = toml::from_str(&text).map_err(|err| ConfigError::Parse(err.to_string()))?;
    build_pipeline(file, registry)
}

/// Converts a parsed config file into a wired pipeline.
fn build_pipeline(
    file: ConfigFile,
    registry: &PluginRegistry,
) -> Result<LoadedConfig, ConfigError> {
    if file.pipeline_name.is_empty() {
        return Err(ConfigError::Field("pipeline_name must not be empty".to_string()));
    }
    if file.steps.len() > MAX_STEPS {
        return Err(ConfigError::Limit(format!("more than {MAX_STEPS} steps")));
    }
    if file.sinks.is_empty() {
        return Err(ConfigError::Field("at least one sink is required".to_string()));
    }
    if file.sinks.len() > MAX_SINKS {
        return Err(ConfigError::Limit(format!("more than {MAX_SINKS} sinks")));
    }

    let settings = toml_to_json(&toml::Value::Table({
        let mut table = toml::Table::new();
        table.insert("pipeline_name".to_string(), toml::Value::String(file.pipeline_name.clone()));
        table
    }));

    let source = registry
        .build_source(&file.source.plugin, &toml_to_json(&toml::Value::Table(file.source.options)))?;

    let mut steps = Vec::with_capacity(file.steps.len());
    for declaration in file.steps {
        match declaration {
            StepDeclaration::Transform { plugin, options } => {
                let transform =
                    registry.build_transform(&plugin, &toml_to_json(&toml::Value::Table(options)))?;
                steps.push(StepConfig::Transform(transform));
            }
            StepDeclaration::Gate { plugin, options, targets } => {
                let gate =
                    registry.build_gate(&plugin, &toml_to_json(&toml::Value::Table(options)))?;
                let mut resolved = BTreeMap::new();
                for (label, target) in targets {
                    resolved.insert(label, parse_target(&target)?);
                }
                steps.push(StepConfig::Gate { plugin: gate, targets: resolved });
            }
            StepDeclaration::Aggregation {
                plugin,
                options,
                name,
                count_trigger,
                timeout_ms,
                output_mode,
            } => {
                let transform =
                    registry.build_transform(&plugin, &toml_to_json(&toml::Value::Table(options)))?;
                if count_trigger.is_none() && timeout_ms.is_none() {
                    return Err(ConfigError::Field(format!(
                        "aggregation '{name}' declares no trigger; set count_trigger or \
                         timeout_ms"
                    )));
                }
                let output_mode = match output_mode.as_str() {
                    "single" => OutputMode::Single,
                    "passthrough" => OutputMode::Passthrough,
                    "transform" => OutputMode::Transform,
                    other => {
                        return Err(ConfigError::Field(format!(
                            "aggregation '{name}' has unknown output_mode '{other}'"
                        )));
                    }
                };
                steps.push(StepConfig::Aggregation {
                    transform,
                    settings: AggregationSettings {
                        node_id: NodeId::new("pending"),
                        name,
                        count_trigger,
                        timeout_ms,
                        output_mode,
                    },
                });
            }
            StepDeclaration::Coalesce { name, expected_branches, policy, merge } => {
                if expected_branches.is_empty() {
                    return Err(ConfigError::Field(format!(
                        "coalesce '{name}' declares no expected branches"
                    )));
                }
                steps.push(StepConfig::Coalesce {
                    settings: CoalesceSettings {
                        node_id: NodeId::new("pending"),
                        name: name.clone(),
                        expected_branches,
                        policy: parse_policy(&name, &policy)?,
                        merge: parse_merge(&name, &merge)?,
                    },
                });
            }
        }
    }

    let mut sinks = Vec::with_capacity(file.sinks.len());
    for declaration in file.sinks {
        sinks.push(
            registry
                .build_sink(&declaration.plugin, &toml_to_json(&toml::Value::Table(declaration.options)))?,
        );
    }

    let export = file.export.map(|declaration| ExportSettings {
        format: declaration.format,
        path: declaration.path,
        sign: declaration.sign,
    });

    Ok(LoadedConfig {
        pipeline: PipelineConfig {
            pipeline_name: file.pipeline_name,
            source,
            steps,
            sinks,
            settings,
            checkpoint_every_rows: file.checkpoint_every_rows,
            export,
        },
        store: file.store,
    })
}

/// Parses a gate target string.
fn parse_target(target: &str) -> Result<StepTarget, ConfigError> {
    if target == "continue" {
        return Ok(StepTarget::Continue);
    }
    if let Some(sink) = target.strip_prefix("sink:") {
        return Ok(StepTarget::Sink(sink.to_string()));
    }
    if let Some(index) = target.strip_prefix("step:") {
        let index = index
            .parse::<usize>()
            .map_err(|_| ConfigError::Field(format!("invalid step target '{target}'")))?;
        return Ok(StepTarget::Step(index));
    }
    Err(ConfigError::Field(format!(
        "invalid gate target '{target}'; expected 'continue', 'sink:NAME', or 'step:N'"
    )))
}

/// Parses a coalesce policy string.
fn parse_policy(name: &str, policy: &str) -> Result<CoalescePolicy, ConfigError> {
    match policy {
        "require_all" => Ok(CoalescePolicy::RequireAll),
        "best_effort" => Ok(CoalescePolicy::BestEffort),
        "first" => Ok(CoalescePolicy::First),
        other => {
            if let Some(quorum) = other.strip_prefix("quorum:") {
                let quorum = quorum.parse::<usize>().map_err(|_| {
                    ConfigError::Field(format!("coalesce '{name}' has invalid quorum '{other}'"))
                })?;
                if quorum == 0 {
                    return Err(ConfigError::Field(format!(
                        "coalesce '{name}' quorum must be at least 1"
                    )));
                }
                return Ok(CoalescePolicy::Quorum(quorum));
            }
            Err(ConfigError::Field(format!("coalesce '{name}' has unknown policy '{other}'")))
        }
    }
}

/// Parses a coalesce merge strategy string.
fn parse_merge(name: &str, merge: &str) -> Result<MergeStrategy, ConfigError> {
    match merge {
        "union" => Ok(MergeStrategy::Union),
        "nested" => Ok(MergeStrategy::Nested),
        other => {
            if let Some(fields) = other.strip_prefix("select:") {
                let fields: Vec<String> = fields
                    .split(',')
                    .map(str::trim)
                    .filter(|field| !field.is_empty())
                    .map(String::from)
                    .collect();
                if fields.is_empty() {
                    return Err(ConfigError::Field(format!(
                        "coalesce '{name}' select strategy names no fields"
                    )));
                }
                return Ok(MergeStrategy::Select(fields));
            }
            Err(ConfigError::Field(format!(
                "coalesce '{name}' has unknown merge strategy '{other}'"
            )))
        }
    }
}

// ============================================================================
// SECTION: TOML Conversion
// ============================================================================

/// Converts TOML values into JSON values for plugin construction.
fn toml_to_json(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(text) => Value::String(text.clone()),
        toml::Value::Integer(int) => Value::Number((*int).into()),
        toml::Value::Float(float) => serde_json::Number::from_f64(*float)
            .map_or(Value::Null, Value::Number),
        toml::Value::Boolean(boolean) => Value::Bool(*boolean),
        toml::Value::Datetime(datetime) => Value::String(datetime.to_string()),
        toml::Value::Array(items) => Value::Array(items.iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table.iter().map(|(key, value)| (key.clone(), toml_to_json(value))).collect(),
        ),
    }
}
