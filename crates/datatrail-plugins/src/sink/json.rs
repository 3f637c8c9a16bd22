// crates/datatrail-plugins/src/sink/json.rs
// ============================================================================
// Module: Datatrail JSON Sink
// Description: JSONL file sink with durable flush.
// Purpose: Write one JSON object per row with fsync on flush.
// Dependencies: datatrail-core, serde, serde_json
// ============================================================================

//! ## Overview
//! The JSON sink writes one object per line. Rows are written with their
//! normalized field names; the contract travels in the audit trail, not the
//! artifact. `flush()` does not return until the file is fsync'd.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;

use datatrail_core::ArtifactDescriptor;
use datatrail_core::Determinism;
use datatrail_core::OutputValidation;
use datatrail_core::PipelineRow;
use datatrail_core::PluginContext;
use datatrail_core::SchemaContract;
use datatrail_core::SinkError;
use datatrail_core::SinkPlugin;
use serde::Deserialize;
use serde_json::Value;

use crate::config::PluginConfigError;
use crate::config::parse_config;
use crate::sink::WriteMode;
use crate::sink::hash_artifact;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// JSON sink options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonSinkConfig {
    /// Sink instance name; pipelines route to this name.
    pub name: String,
    /// Path of the output file.
    pub path: PathBuf,
    /// Write mode.
    #[serde(default)]
    pub mode: WriteMode,
    /// Whether an existing target may be replaced; required, no default.
    pub overwrite: bool,
}

// ============================================================================
// SECTION: Sink
// ============================================================================

/// JSONL file sink.
pub struct JsonSink {
    /// Parsed configuration.
    config: JsonSinkConfig,
    /// Open output file once the first write happened.
    file: Option<File>,
    /// Free input contract.
    schema: SchemaContract,
}

impl JsonSink {
    /// Plugin name.
    pub const NAME: &'static str = "json";

    /// Builds a JSON sink from its configuration value.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] on malformed configuration.
    pub fn from_config(value: &Value) -> Result<Self, PluginConfigError> {
        let config: JsonSinkConfig = parse_config(Self::NAME, value)?;
        Ok(Self { config, file: None, schema: SchemaContract::free() })
    }

    /// Opens the output file according to the write mode.
    fn open_file(&self) -> Result<File, SinkError> {
        if let Some(parent) = self.config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|err| SinkError::Io(err.to_string()))?;
        }
        let mut options = OpenOptions::new();
        options.write(true);
        match self.config.mode {
            WriteMode::Write => {
                if self.config.path.exists() && !self.config.overwrite {
                    return Err(SinkError::TargetMismatch(format!(
                        "{} already exists and overwrite is false",
                        self.config.path.display()
                    )));
                }
                options.create(true).truncate(true);
            }
            WriteMode::Append => {
                options.create(true).append(true);
            }
            WriteMode::Replace => {
                options.create(true).truncate(true);
            }
        }
        options.open(&self.config.path).map_err(|err| SinkError::Io(err.to_string()))
    }
}

impl SinkPlugin for JsonSink {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn plugin_version(&self) -> &str {
        "1.0.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::IoWrite
    }

    fn input_schema(&self) -> &SchemaContract {
        &self.schema
    }

    fn idempotent(&self) -> bool {
        false
    }

    fn supports_resume(&self) -> bool {
        true
    }

    fn write(
        &mut self,
        rows: &[PipelineRow],
        _ctx: &PluginContext,
    ) -> Result<ArtifactDescriptor, SinkError> {
        if self.file.is_none() {
            self.file = Some(self.open_file()?);
        }
        let mut buffer = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut buffer, &Value::Object(row.data().clone()))
                .map_err(|err| SinkError::Io(err.to_string()))?;
            buffer.push(b'\n');
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SinkError::Io("sink file handle missing".to_string()))?;
        file.write_all(&buffer).map_err(|err| SinkError::Io(err.to_string()))?;
        let (content_hash, size_bytes) = hash_artifact(&self.config.path)?;
        Ok(ArtifactDescriptor {
            path_or_uri: self.config.path.display().to_string(),
            content_hash,
            size_bytes,
            artifact_type: "jsonl".to_string(),
            idempotency_key: None,
        })
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        if let Some(file) = &mut self.file {
            file.flush().map_err(|err| SinkError::Durability(err.to_string()))?;
            file.sync_all().map_err(|err| SinkError::Durability(err.to_string()))?;
        }
        Ok(())
    }

    fn configure_for_resume(&mut self) -> Result<(), SinkError> {
        self.config.mode = WriteMode::Append;
        Ok(())
    }

    fn validate_output_target(&self) -> Result<OutputValidation, SinkError> {
        Ok(OutputValidation { matches: true, reason: None })
    }

    fn close(&mut self) {
        self.file = None;
    }
}
