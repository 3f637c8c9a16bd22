// crates/datatrail-cli/src/lib.rs
// ============================================================================
// Module: Datatrail CLI Library
// Description: Command implementations for the datatrail binary.
// Purpose: Wire configuration, stores, and the orchestrator into run,
//          resume, explain, and export commands.
// Dependencies: datatrail-config, datatrail-core, datatrail-plugins,
//               datatrail-store-sqlite, ed25519-dalek, base64
// ============================================================================

//! ## Overview
//! The CLI is a thin shell over the engine: it loads the TOML configuration,
//! opens the configured stores, and invokes the orchestrator. Exit behavior
//! distinguishes configuration failures from run failures and from refused
//! resumes; a refused resume writes no data. Export signing reads the key
//! from `DATATRAIL_SIGNING_KEY`; a missing key with signing enabled is an
//! error.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use datatrail_config::LoadedConfig;
use datatrail_config::load_config;
use datatrail_core::Clock;
use datatrail_core::EngineError;
use datatrail_core::Landscape;
use datatrail_core::Orchestrator;
use datatrail_core::PayloadStore;
use datatrail_core::RowId;
use datatrail_core::RunId;
use datatrail_core::RunSummary;
use datatrail_core::Timestamp;
use datatrail_core::runtime::InMemoryLandscape;
use datatrail_plugins::PluginRegistry;
use datatrail_store_sqlite::FsPayloadStore;
use datatrail_store_sqlite::SqliteLandscape;
use datatrail_store_sqlite::SqliteStoreConfig;
use ed25519_dalek::Signer as _;
use ed25519_dalek::SigningKey;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Environment variable holding the base64 export signing key.
pub const SIGNING_KEY_ENV: &str = "DATATRAIL_SIGNING_KEY";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI-level errors mapped to exit codes by the entry point.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration could not be loaded or validated.
    #[error("configuration error: {0}")]
    Config(String),
    /// A store could not be opened.
    #[error("store error: {0}")]
    Store(String),
    /// The engine failed the run.
    #[error("run failed: {0}")]
    Run(String),
    /// Resume was refused; no data was written.
    #[error("resume refused: {0}")]
    ResumeRefused(String),
    /// Lineage lookup failed.
    #[error("explain failed: {0}")]
    Explain(String),
    /// Export or signing failed.
    #[error("export failed: {0}")]
    Export(String),
}

// ============================================================================
// SECTION: System Clock
// ============================================================================

/// Wall-clock time source for real runs.
///
/// The engine core never reads the wall clock itself; this is the host-edge
/// implementation handed in by the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Timestamp::from_unix_millis(millis)
    }
}

// ============================================================================
// SECTION: Store Wiring
// ============================================================================

/// Opens the Landscape store declared by the configuration, defaulting to an
/// in-memory store for ephemeral runs.
///
/// # Errors
///
/// Returns [`CliError::Store`] when a durable store cannot be opened.
pub fn open_landscape(config: &LoadedConfig) -> Result<Arc<dyn Landscape>, CliError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    match &config.store {
        Some(store) => {
            let payloads: Option<Arc<dyn PayloadStore>> = match &store.payload_dir {
                Some(dir) => Some(Arc::new(
                    FsPayloadStore::open(dir.clone())
                        .map_err(|err| CliError::Store(err.to_string()))?,
                )),
                None => None,
            };
            let landscape = SqliteLandscape::open(
                &SqliteStoreConfig::new(store.database_path.clone()),
                clock,
                payloads,
            )
            .map_err(|err| CliError::Store(err.to_string()))?;
            Ok(Arc::new(landscape))
        }
        None => Ok(Arc::new(InMemoryLandscape::new(clock))),
    }
}

// ============================================================================
// SECTION: Commands
// ============================================================================

/// Runs a pipeline from a configuration file.
///
/// # Errors
///
/// Returns [`CliError`] for configuration, store, or run failures.
pub fn command_run(config_path: &Path) -> Result<RunSummary, CliError> {
    let registry = PluginRegistry::new();
    let loaded = load_config(config_path, &registry)
        .map_err(|err| CliError::Config(err.to_string()))?;
    let landscape = open_landscape(&loaded)?;
    let sign = loaded.pipeline.export.as_ref().is_some_and(|export| export.sign);
    let orchestrator = Orchestrator::new(landscape, Arc::new(SystemClock));
    let summary = orchestrator
        .run(loaded.pipeline)
        .map_err(|err| CliError::Run(err.to_string()))?;
    if sign
        && let Some(report) = &summary.export_report
    {
        sign_export(&report.signable_path)?;
    }
    Ok(summary)
}

/// Resumes a crashed run from its latest checkpoint.
///
/// # Errors
///
/// Returns [`CliError::ResumeRefused`] when the checkpoint refuses the
/// current graph; no data is written in that case.
pub fn command_resume(config_path: &Path, run_id: &str) -> Result<RunSummary, CliError> {
    let registry = PluginRegistry::new();
    let loaded = load_config(config_path, &registry)
        .map_err(|err| CliError::Config(err.to_string()))?;
    if loaded.store.is_none() {
        return Err(CliError::ResumeRefused(
            "resume requires a durable store; declare [store] in the configuration".to_string(),
        ));
    }
    let landscape = open_landscape(&loaded)?;
    let sign = loaded.pipeline.export.as_ref().is_some_and(|export| export.sign);
    let orchestrator = Orchestrator::new(landscape, Arc::new(SystemClock));
    let summary = orchestrator
        .resume(&RunId::new(run_id), loaded.pipeline)
        .map_err(|err| match err {
            EngineError::TopologyMismatch(reason) => CliError::ResumeRefused(reason),
            EngineError::ResumeUnavailable(reason) => CliError::ResumeRefused(reason),
            other => CliError::Run(other.to_string()),
        })?;
    if sign
        && let Some(report) = &summary.export_report
    {
        sign_export(&report.signable_path)?;
    }
    Ok(summary)
}

/// Reconstructs lineage for a row, optionally disambiguated by sink.
///
/// # Errors
///
/// Returns [`CliError::Explain`] when the lookup fails or is ambiguous.
pub fn command_explain(
    config_path: &Path,
    run_id: &str,
    row_id: &str,
    sink: Option<&str>,
) -> Result<String, CliError> {
    let registry = PluginRegistry::new();
    let loaded = load_config(config_path, &registry)
        .map_err(|err| CliError::Config(err.to_string()))?;
    let landscape = open_landscape(&loaded)?;
    let lineage = landscape
        .explain_row(&RunId::new(run_id), &RowId::new(row_id), sink)
        .map_err(|err| CliError::Explain(err.to_string()))?;
    match lineage {
        Some(lineage) => serde_json::to_string_pretty(&lineage)
            .map_err(|err| CliError::Explain(err.to_string())),
        None => Err(CliError::Explain(format!(
            "no lineage found for row '{row_id}' in run '{run_id}'"
        ))),
    }
}

// ============================================================================
// SECTION: Export Signing
// ============================================================================

/// Signs an exported audit bundle with the environment key, writing a
/// detached base64 signature alongside it.
///
/// # Errors
///
/// Returns [`CliError::Export`] when the key is missing or invalid, or the
/// signature cannot be written.
pub fn sign_export(path: &Path) -> Result<(), CliError> {
    let encoded = std::env::var(SIGNING_KEY_ENV).map_err(|_| {
        CliError::Export(format!(
            "signing requested but {SIGNING_KEY_ENV} is not set in the environment"
        ))
    })?;
    let key_bytes = BASE64
        .decode(encoded.trim())
        .map_err(|err| CliError::Export(format!("signing key is not valid base64: {err}")))?;
    let key_bytes: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| CliError::Export("signing key must be 32 bytes".to_string()))?;
    let key = SigningKey::from_bytes(&key_bytes);
    let bytes =
        std::fs::read(path).map_err(|err| CliError::Export(format!("read export: {err}")))?;
    let signature = key.sign(&bytes);
    let signature_path = path.with_extension("sig");
    std::fs::write(&signature_path, BASE64.encode(signature.to_bytes()))
        .map_err(|err| CliError::Export(format!("write signature: {err}")))?;
    Ok(())
}

// ============================================================================
// SECTION: Summary Rendering
// ============================================================================

/// Renders a run summary as a stable single-line-per-field report.
#[must_use]
pub fn render_summary(summary: &RunSummary) -> String {
    let status = match summary.status {
        datatrail_core::RunStatus::Executing => "executing",
        datatrail_core::RunStatus::Completed => "completed",
        datatrail_core::RunStatus::Failed => "failed",
    };
    let mut out = String::new();
    out.push_str(&format!("run: {}\n", summary.run_id));
    out.push_str(&format!("status: {status}\n"));
    out.push_str(&format!("rows loaded: {}\n", summary.rows_loaded));
    out.push_str(&format!("completed: {}\n", summary.rows_completed));
    out.push_str(&format!("routed: {}\n", summary.rows_routed));
    out.push_str(&format!("failed: {}\n", summary.rows_failed));
    out.push_str(&format!("quarantined: {}\n", summary.rows_quarantined));
    for artifact in &summary.artifacts {
        out.push_str(&format!(
            "artifact: {} ({} bytes, {})\n",
            artifact.path_or_uri, artifact.size_bytes, artifact.content_hash
        ));
    }
    out
}
