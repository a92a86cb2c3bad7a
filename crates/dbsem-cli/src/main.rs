// crates/dbsem-cli/src/main.rs
// ============================================================================
// Module: dbsem CLI Entry Point
// Description: Command dispatcher for semaphore administration and acquisition.
// Purpose: Operate configured semaphore sections from the shell.
// Dependencies: clap, dbsem-config, dbsem-core, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! `dbsem` loads the services file, selects a section, and runs one of:
//! `init` (prepare the schema), `register` (create slots), `status` (show
//! slot usage), or `acquire` (take a slot, optionally hold it, release it).
//! Results are printed as text or JSON; failures go to stderr with a
//! non-zero exit code.

// ============================================================================
// SECTION: Modules
// ============================================================================

#[cfg(test)]
mod main_tests;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use dbsem_config::ConfiguredStore;
use dbsem_config::ServicesConfig;
use dbsem_core::AcquireRequest;
use dbsem_core::AcquisitionEngine;
use dbsem_core::ReleaseOutcome;
use dbsem_core::SemaphoreName;
use dbsem_core::SlotUsage;
use dbsem_core::TaskId;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: CLI Definitions
// ============================================================================

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "dbsem", version, disable_help_subcommand = true)]
struct Cli {
    /// Services file (defaults to `$DBSEM_CONFIG`, then `dbsem.toml`).
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Section to operate on (defaults to `$DBSEM_SECTION`, then the sole
    /// section).
    #[arg(long, value_name = "NAME", global = true)]
    section: Option<String>,
    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Prepare the section's schema.
    Init,
    /// Register a semaphore with a number of slots.
    Register(RegisterCommand),
    /// Show slot usage of a semaphore.
    Status(StatusCommand),
    /// Acquire one slot, hold it, then release it.
    Acquire(AcquireCommand),
}

/// Arguments for `register`.
#[derive(Args, Debug)]
struct RegisterCommand {
    /// Semaphore name.
    name: String,
    /// Number of slots.
    #[arg(long, value_name = "N")]
    slots: u32,
}

/// Arguments for `status`.
#[derive(Args, Debug)]
struct StatusCommand {
    /// Semaphore name.
    name: String,
}

/// Arguments for `acquire`.
#[derive(Args, Debug)]
struct AcquireCommand {
    /// Semaphore name.
    name: String,
    /// Task id recorded in the audit trail.
    #[arg(long = "task-id", value_name = "N")]
    task_id: i64,
    /// Milliseconds to hold the slot before releasing it.
    #[arg(long = "hold-ms", value_name = "MS", default_value_t = 0)]
    hold_ms: u64,
    /// Bound on the whole acquisition in milliseconds.
    #[arg(long = "timeout-ms", value_name = "MS")]
    timeout_ms: Option<u64>,
}

/// Output formats.
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
enum OutputFormat {
    /// Human-readable text output.
    Text,
    /// JSON output.
    Json,
}

// ============================================================================
// SECTION: Reports
// ============================================================================

/// Result of `init`.
#[derive(Debug, Serialize)]
struct InitReport {
    /// Section name.
    section: String,
    /// Backend label.
    backend: &'static str,
}

/// Result of `register`.
#[derive(Debug, Serialize)]
struct RegisterReport {
    /// Semaphore name.
    name: String,
    /// Registered slot count.
    slots: u32,
}

/// Result of `status`.
#[derive(Debug, Serialize, PartialEq, Eq)]
struct StatusReport {
    /// Semaphore name.
    name: String,
    /// Registered slots.
    total: u32,
    /// Slots currently held.
    in_use: u32,
    /// Slots currently free.
    free: u32,
}

impl StatusReport {
    /// Builds a report from slot usage.
    fn new(name: &SemaphoreName, usage: SlotUsage) -> Self {
        Self {
            name: name.as_str().to_string(),
            total: usage.total,
            in_use: usage.in_use,
            free: usage.free(),
        }
    }

    /// Renders the text form.
    fn to_text(&self) -> String {
        format!("{}: total={} in_use={} free={}", self.name, self.total, self.in_use, self.free)
    }
}

/// Result of `acquire`.
#[derive(Debug, Serialize, PartialEq, Eq)]
struct AcquireReport {
    /// Semaphore name.
    name: String,
    /// Task id.
    task_id: i64,
    /// Audit record id.
    audit_id: i64,
    /// Slot held, absent when attempts were exhausted.
    slot: Option<i64>,
    /// Wait attempts made.
    attempts: u32,
    /// Release result.
    release: &'static str,
}

impl AcquireReport {
    /// Renders the text form.
    fn to_text(&self) -> String {
        let slot = self.slot.map_or_else(|| "none".to_string(), |slot| slot.to_string());
        format!(
            "{}: slot={slot} audit_id={} attempts={} release={}",
            self.name, self.audit_id, self.attempts, self.release
        )
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI error wrapper.
#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    /// Human-readable error message.
    message: String,
}

impl CliError {
    /// Constructs a new [`CliError`].
    const fn new(message: String) -> Self {
        Self {
            message,
        }
    }
}

/// CLI result alias for fallible operations.
type CliResult<T> = Result<T, CliError>;

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Executes the CLI command dispatcher.
fn run(cli: Cli) -> CliResult<ExitCode> {
    let config = ServicesConfig::load(cli.config.as_deref())
        .map_err(|err| CliError::new(err.to_string()))?;
    let (section_name, section) =
        config.section(cli.section.as_deref()).map_err(|err| CliError::new(err.to_string()))?;
    let store = section
        .open()
        .map_err(|err| CliError::new(format!("section {section_name}: {err}")))?;

    match cli.command {
        Commands::Init => {
            store.initialize().map_err(|err| CliError::new(err.to_string()))?;
            let report = InitReport {
                section: section_name.to_string(),
                backend: section.backend(),
            };
            let text = format!("initialized section {} ({})", report.section, report.backend);
            emit_report(cli.format, &report, &text)?;
        }
        Commands::Register(command) => {
            let name = parse_name(&command.name)?;
            store
                .register_semaphore(&name, command.slots)
                .map_err(|err| CliError::new(err.to_string()))?;
            let report = RegisterReport {
                name: name.as_str().to_string(),
                slots: command.slots,
            };
            let text = format!("registered {} with {} slots", report.name, report.slots);
            emit_report(cli.format, &report, &text)?;
        }
        Commands::Status(command) => {
            let report = command_status(&store, &command)?;
            emit_report(cli.format, &report, &report.to_text())?;
        }
        Commands::Acquire(command) => {
            let report = command_acquire(&config, store, &command)?;
            emit_report(cli.format, &report, &report.to_text())?;
            if report.release == "failed" {
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Commands
// ============================================================================

/// Executes the `status` command.
fn command_status(store: &ConfiguredStore, command: &StatusCommand) -> CliResult<StatusReport> {
    let name = parse_name(&command.name)?;
    let listed = store.list_semaphores().map_err(|err| CliError::new(err.to_string()))?;
    listed
        .into_iter()
        .find(|(listed_name, _)| *listed_name == name)
        .map(|(_, usage)| StatusReport::new(&name, usage))
        .ok_or_else(|| CliError::new(format!("unknown semaphore: {name}")))
}

/// Executes the `acquire` command.
fn command_acquire(
    config: &ServicesConfig,
    store: ConfiguredStore,
    command: &AcquireCommand,
) -> CliResult<AcquireReport> {
    let name = parse_name(&command.name)?;
    let acquisition =
        config.semaphore.acquisition_config().map_err(|err| CliError::new(err.to_string()))?;
    let events = config.events.build_sink().map_err(|err| CliError::new(err.to_string()))?;
    let engine = AcquisitionEngine::new(store, acquisition).with_events(events);
    let mut request = AcquireRequest::new(name, TaskId::new(command.task_id));
    if let Some(timeout_ms) = command.timeout_ms {
        request = request.with_timeout(Duration::from_millis(timeout_ms));
    }

    let mut handle = engine.acquire(&request).map_err(|err| CliError::new(err.to_string()))?;
    if handle.is_held() && command.hold_ms > 0 {
        thread::sleep(Duration::from_millis(command.hold_ms));
    }
    let slot = handle.slot();
    let release = match handle.release() {
        ReleaseOutcome::Released(_) => "released",
        ReleaseOutcome::NotHeld => "not_held",
        ReleaseOutcome::Failed {
            error, ..
        } => {
            let _ = write_stderr_line(&format!("release failed: {error}"));
            "failed"
        }
    };
    Ok(AcquireReport {
        name: handle.name().as_str().to_string(),
        task_id: handle.task_id().get(),
        audit_id: handle.audit_id().get(),
        slot: slot.map(|slot| slot.get()),
        attempts: handle.attempts(),
        release,
    })
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Parses and validates a semaphore name argument.
fn parse_name(value: &str) -> CliResult<SemaphoreName> {
    SemaphoreName::parse(value)
        .map_err(|err| CliError::new(format!("invalid semaphore name: {err}")))
}

/// Prints a report as JSON or text.
fn emit_report<T: Serialize>(format: OutputFormat, report: &T, text: &str) -> CliResult<()> {
    let line = match format {
        OutputFormat::Text => text.to_string(),
        OutputFormat::Json => serde_json::to_string(report)
            .map_err(|err| CliError::new(format!("failed to encode output: {err}")))?,
    };
    write_stdout_line(&line).map_err(|err| CliError::new(format!("failed to write stdout: {err}")))
}

/// Writes a single line to stdout.
fn write_stdout_line(message: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    writeln!(&mut stdout, "{message}")
}

/// Writes a single line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Emits an error message to stderr and returns a failure exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(message);
    ExitCode::FAILURE
}
