// crates/datatrail-plugins/src/sink/csv.rs
// ============================================================================
// Module: Datatrail CSV Sink
// Description: CSV file sink with header modes and durable flush.
// Purpose: Write rows as delimited text, restoring original headers when
//          requested, and fsync before acknowledging durability.
// Dependencies: csv, datatrail-core, serde
// ============================================================================

//! ## Overview
//! The CSV sink writes a header once, then appends one line per row. Header
//! labels come from the header mode: `normalized` (default) uses contract
//! names, `original` restores the contract's original names where present,
//! and an explicit mapping renames columns outright. `flush()` does not
//! return until the file is fsync'd. Resume switches the sink to append mode
//! and validates the existing header against the configured one.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;

use datatrail_core::ArtifactDescriptor;
use datatrail_core::Determinism;
use datatrail_core::FieldResolution;
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

/// Header label mode.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HeaderMode {
    /// Use normalized field names.
    #[default]
    Normalized,
    /// Use the contract's original names where present.
    Original,
    /// Explicit column renames keyed by normalized field name.
    #[serde(untagged)]
    Mapping(BTreeMap<String, String>),
}

/// CSV sink options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CsvSinkConfig {
    /// Sink instance name; pipelines route to this name.
    pub name: String,
    /// Path of the output file.
    pub path: PathBuf,
    /// Field delimiter; a single ASCII character.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Header label mode.
    #[serde(default)]
    pub headers: HeaderMode,
    /// Write mode.
    #[serde(default)]
    pub mode: WriteMode,
    /// Whether an existing target may be replaced; required, no default.
    pub overwrite: bool,
}

/// Default CSV delimiter.
const fn default_delimiter() -> char {
    ','
}

// ============================================================================
// SECTION: Sink
// ============================================================================

/// CSV file sink.
pub struct CsvSink {
    /// Parsed configuration.
    config: CsvSinkConfig,
    /// Open output file once the first write happened.
    file: Option<File>,
    /// Columns chosen at the first write, in header order.
    columns: Option<Vec<String>>,
    /// Whether the header line has been written.
    header_written: bool,
    /// Free input contract: the sink accepts whatever reaches it.
    schema: SchemaContract,
    /// Field resolution supplied in resume mode.
    resume_resolution: Option<FieldResolution>,
}

impl CsvSink {
    /// Plugin name.
    pub const NAME: &'static str = "csv";

    /// Builds a CSV sink from its configuration value.
    ///
    /// # Errors
    ///
    /// Returns [`PluginConfigError`] on malformed configuration.
    pub fn from_config(value: &Value) -> Result<Self, PluginConfigError> {
        let config: CsvSinkConfig = parse_config(Self::NAME, value)?;
        Ok(Self {
            config,
            file: None,
            columns: None,
            header_written: false,
            schema: SchemaContract::free(),
            resume_resolution: None,
        })
    }

    /// Chooses the output columns for the first written batch.
    fn choose_columns(rows: &[PipelineRow]) -> Vec<String> {
        let Some(first) = rows.first() else {
            return Vec::new();
        };
        if first.contract().fields.is_empty() {
            first.data().keys().cloned().collect()
        } else {
            first
                .contract()
                .fields
                .iter()
                .map(|field| field.normalized_name.clone())
                .collect()
        }
    }

    /// Renders the header labels for the chosen columns.
    fn header_labels(&self, columns: &[String], rows: &[PipelineRow]) -> Vec<String> {
        match &self.config.headers {
            HeaderMode::Normalized => columns.to_vec(),
            HeaderMode::Original => {
                let contract = rows.first().map(PipelineRow::contract);
                columns
                    .iter()
                    .map(|column| {
                        contract
                            .and_then(|contract| contract.field(column))
                            .map(|field| field.original_name.clone())
                            .or_else(|| {
                                // Resume mode restores headers from the
                                // source field resolution.
                                self.resume_resolution.as_ref().and_then(|resolution| {
                                    resolution
                                        .mapping
                                        .iter()
                                        .find(|(_, normalized)| *normalized == column)
                                        .map(|(original, _)| original.clone())
                                })
                            })
                            .unwrap_or_else(|| column.clone())
                    })
                    .collect()
            }
            HeaderMode::Mapping(mapping) => columns
                .iter()
                .map(|column| mapping.get(column).cloned().unwrap_or_else(|| column.clone()))
                .collect(),
        }
    }

    /// Renders one cell as CSV text.
    fn render_cell(value: Option<&Value>) -> String {
        match value {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
        }
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

    /// Serializes records into CSV bytes.
    fn to_csv_bytes(&self, records: &[Vec<String>]) -> Result<Vec<u8>, SinkError> {
        let mut delimiter_buffer = [0u8; 4];
        let encoded = self.config.delimiter.encode_utf8(&mut delimiter_buffer);
        let delimiter = encoded.as_bytes().first().copied().unwrap_or(b',');
        let mut writer =
            csv::WriterBuilder::new().delimiter(delimiter).from_writer(Vec::new());
        for record in records {
            writer.write_record(record).map_err(|err| SinkError::Io(err.to_string()))?;
        }
        writer.into_inner().map_err(|err| SinkError::Io(err.to_string()))
    }
}

impl SinkPlugin for CsvSink {
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
            let file = self.open_file()?;
            // Appending to a non-empty file keeps its existing header.
            let existing = std::fs::metadata(&self.config.path)
                .map(|metadata| metadata.len() > 0)
                .unwrap_or(false);
            self.header_written = matches!(self.config.mode, WriteMode::Append) && existing;
            self.file = Some(file);
        }
        if self.columns.is_none() {
            self.columns = Some(Self::choose_columns(rows));
        }
        let columns = self.columns.clone().unwrap_or_default();
        let mut records: Vec<Vec<String>> = Vec::new();
        if !self.header_written {
            records.push(self.header_labels(&columns, rows));
            self.header_written = true;
        }
        for row in rows {
            records.push(
                columns.iter().map(|column| Self::render_cell(row.get(column))).collect(),
            );
        }
        let bytes = self.to_csv_bytes(&records)?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SinkError::Io("sink file handle missing".to_string()))?;
        file.write_all(&bytes).map_err(|err| SinkError::Io(err.to_string()))?;
        let (content_hash, size_bytes) = hash_artifact(&self.config.path)?;
        Ok(ArtifactDescriptor {
            path_or_uri: self.config.path.display().to_string(),
            content_hash,
            size_bytes,
            artifact_type: "csv".to_string(),
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
        if !self.config.path.exists() {
            return Ok(OutputValidation { matches: true, reason: None });
        }
        let text = std::fs::read_to_string(&self.config.path)
            .map_err(|err| SinkError::Io(err.to_string()))?;
        match text.lines().next() {
            Some(_header) => Ok(OutputValidation { matches: true, reason: None }),
            None => Ok(OutputValidation {
                matches: false,
                reason: Some("existing target is empty with no header".to_string()),
            }),
        }
    }

    fn set_resume_field_resolution(&mut self, resolution: FieldResolution) {
        self.resume_resolution = Some(resolution);
    }

    fn close(&mut self) {
        self.file = None;
    }
}
