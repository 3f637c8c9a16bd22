// crates/datatrail-config/tests/load_validation.rs
// ============================================================================
// Module: Config Load Tests
// Description: Tests for strict TOML pipeline configuration loading.
// ============================================================================
//! ## Overview
//! Validates that well-formed configurations wire into pipelines and that
//! unknown keys, unknown plugins, missing sinks, and malformed step options
//! fail closed with named reasons.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::io::Write;

use datatrail_config::ConfigError;
use datatrail_config::load_config;
use datatrail_plugins::PluginRegistry;
use tempfile::NamedTempFile;

/// Writes a temp TOML file.
fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// A minimal valid configuration.
fn minimal() -> String {
    r#"
pipeline_name = "orders"

[source]
plugin = "csv"
[source.options]
path = "input.csv"
on_success = "output"
on_validation_failure = "discard"

[[sink]]
plugin = "csv"
[sink.options]
name = "output"
path = "out.csv"
overwrite = true
"#
    .to_string()
}

// ============================================================================
// SECTION: Valid Configurations
// ============================================================================

/// Tests a minimal configuration loads and wires the pipeline.
#[test]
fn test_minimal_config_loads() {
    let file = config_file(&minimal());
    let loaded = load_config(file.path(), &PluginRegistry::new()).unwrap();
    assert_eq!(loaded.pipeline.pipeline_name, "orders");
    assert!(loaded.pipeline.steps.is_empty());
    assert_eq!(loaded.pipeline.sinks.len(), 1);
    assert!(loaded.store.is_none());
}

/// Tests steps, gates, aggregations, and exports parse.
#[test]
fn test_full_config_loads() {
    let file = config_file(
        r#"
pipeline_name = "scored"
checkpoint_every_rows = 10

[source]
plugin = "json"
[source.options]
path = "input.json"
on_success = "kept"
on_validation_failure = "discard"

[[step]]
kind = "transform"
plugin = "passthrough"
[step.options]
on_success = "kept"
on_error = "discard"

[[step]]
kind = "gate"
plugin = "rule_gate"
[step.options]
name = "score_gate"
on_no_match = "rejected"
[[step.options.rules]]
label = "keep"
condition = "row['score'] >= 0.5"
[step.targets]
keep = "continue"

[[step]]
kind = "aggregation"
plugin = "batch_passthrough"
name = "window"
count_trigger = 5
output_mode = "passthrough"
[step.options]
on_success = "kept"
on_error = "discard"

[[sink]]
plugin = "csv"
[sink.options]
name = "kept"
path = "kept.csv"
overwrite = true

[[sink]]
plugin = "csv"
[sink.options]
name = "rejected"
path = "rejected.csv"
overwrite = true

[export]
format = "json"
path = "audit.json"

[store]
database_path = "landscape.db"
payload_dir = "payloads"
"#,
    );
    let loaded = load_config(file.path(), &PluginRegistry::new()).unwrap();
    assert_eq!(loaded.pipeline.steps.len(), 3);
    assert_eq!(loaded.pipeline.checkpoint_every_rows, Some(10));
    assert!(loaded.pipeline.export.is_some());
    assert!(loaded.store.is_some());
}

// ============================================================================
// SECTION: Rejections
// ============================================================================

/// Tests unknown top-level keys are rejected.
#[test]
fn test_unknown_key_rejected() {
    let file = config_file(&format!("mystery_key = 1\n{}", minimal()));
    assert!(matches!(
        load_config(file.path(), &PluginRegistry::new()),
        Err(ConfigError::Parse(_))
    ));
}

/// Tests an unknown plugin name is rejected.
#[test]
fn test_unknown_plugin_rejected() {
    let file = config_file(&minimal().replace("plugin = \"csv\"", "plugin = \"mystery\""));
    assert!(matches!(
        load_config(file.path(), &PluginRegistry::new()),
        Err(ConfigError::Plugin(_))
    ));
}

/// Tests a configuration without sinks is rejected.
#[test]
fn test_missing_sinks_rejected() {
    let file = config_file(
        r#"
pipeline_name = "empty"
sink = []

[source]
plugin = "csv"
[source.options]
path = "input.csv"
on_success = "output"
on_validation_failure = "discard"
"#,
    );
    assert!(matches!(
        load_config(file.path(), &PluginRegistry::new()),
        Err(ConfigError::Field(_))
    ));
}

/// Tests an aggregation without triggers is rejected.
#[test]
fn test_aggregation_without_trigger_rejected() {
    let file = config_file(
        r#"
pipeline_name = "agg"

[source]
plugin = "csv"
[source.options]
path = "input.csv"
on_success = "output"
on_validation_failure = "discard"

[[step]]
kind = "aggregation"
plugin = "batch_passthrough"
name = "window"
output_mode = "passthrough"
[step.options]
on_success = "output"
on_error = "discard"

[[sink]]
plugin = "csv"
[sink.options]
name = "output"
path = "out.csv"
overwrite = true
"#,
    );
    let error = load_config(file.path(), &PluginRegistry::new()).unwrap_err();
    assert!(error.to_string().contains("trigger"));
}

/// Tests a malformed gate target string is rejected.
#[test]
fn test_bad_gate_target_rejected() {
    let file = config_file(
        r#"
pipeline_name = "gated"

[source]
plugin = "csv"
[source.options]
path = "input.csv"
on_success = "output"
on_validation_failure = "discard"

[[step]]
kind = "gate"
plugin = "rule_gate"
[step.options]
name = "gate"
[[step.options.rules]]
label = "keep"
condition = "row['x'] == 1"
[step.targets]
keep = "teleport:nowhere"

[[sink]]
plugin = "csv"
[sink.options]
name = "output"
path = "out.csv"
overwrite = true
"#,
    );
    let error = load_config(file.path(), &PluginRegistry::new()).unwrap_err();
    assert!(error.to_string().contains("teleport"));
}

/// Tests a sink missing its required overwrite flag is rejected.
#[test]
fn test_sink_missing_overwrite_rejected() {
    let file = config_file(&minimal().replace("overwrite = true\n", ""));
    assert!(matches!(
        load_config(file.path(), &PluginRegistry::new()),
        Err(ConfigError::Plugin(_))
    ));
}
