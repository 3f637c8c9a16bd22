// crates/datatrail-cli/src/main.rs
// ============================================================================
// Module: Datatrail CLI Entry Point
// Description: Command dispatcher for Datatrail pipeline runs.
// Purpose: Provide run, resume, explain, and export commands with exit codes
//          that distinguish configuration errors from run failures.
// Dependencies: clap, datatrail-cli, tracing-subscriber
// ============================================================================

//! ## Overview
//! `datatrail run` executes a pipeline from a TOML configuration;
//! `datatrail resume` continues a crashed run from its latest checkpoint,
//! refusing loudly (and writing nothing) when the topology has drifted;
//! `datatrail explain` reconstructs the lineage of a row.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;
use datatrail_cli::CliError;
use datatrail_cli::command_explain;
use datatrail_cli::command_resume;
use datatrail_cli::command_run;
use datatrail_cli::render_summary;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "datatrail", version, arg_required_else_help = true)]
struct Cli {
    /// Command to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline from a configuration file.
    Run {
        /// Path to the pipeline TOML configuration.
        #[arg(long)]
        config: PathBuf,
    },
    /// Resume a crashed run from its latest checkpoint.
    Resume {
        /// Path to the pipeline TOML configuration.
        #[arg(long)]
        config: PathBuf,
        /// Run identifier to resume.
        #[arg(long = "run")]
        run_id: String,
    },
    /// Reconstruct the lineage of a row.
    Explain {
        /// Path to the pipeline TOML configuration.
        #[arg(long)]
        config: PathBuf,
        /// Run identifier.
        #[arg(long = "run")]
        run_id: String,
        /// Row identifier.
        #[arg(long = "row")]
        row_id: String,
        /// Disambiguating sink name when the row fanned out.
        #[arg(long)]
        sink: Option<String>,
    },
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// Binary entry point.
fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match dispatch(cli.command) {
        Ok(output) => {
            if write_stdout(&output).is_err() {
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            let _ = write_stderr(&error.to_string());
            match error {
                CliError::Config(_) | CliError::Store(_) => ExitCode::from(2),
                CliError::ResumeRefused(_) => ExitCode::from(3),
                CliError::Run(_) | CliError::Explain(_) | CliError::Export(_) => {
                    ExitCode::FAILURE
                }
            }
        }
    }
}

/// Dispatches a parsed command.
fn dispatch(command: Command) -> Result<String, CliError> {
    match command {
        Command::Run { config } => {
            let summary = command_run(&config)?;
            Ok(render_summary(&summary))
        }
        Command::Resume { config, run_id } => {
            let summary = command_resume(&config, &run_id)?;
            Ok(render_summary(&summary))
        }
        Command::Explain { config, run_id, row_id, sink } => {
            command_explain(&config, &run_id, &row_id, sink.as_deref())
        }
    }
}

/// Writes a message to stdout.
fn write_stdout(message: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    write!(&mut stdout, "{message}")?;
    stdout.flush()
}

/// Writes a line to stderr.
fn write_stderr(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")?;
    stderr.flush()
}
