// crates/dbsem-cli/src/main_tests.rs
// ============================================================================
// Module: CLI Main Helpers Tests
// Description: Unit tests for argument parsing and report rendering.
// Purpose: Keep the command surface and output shapes stable.
// Dependencies: dbsem-cli main helpers
// ============================================================================

//! ## Overview
//! Validates clap parsing of global flags and subcommands, semaphore name
//! validation, and the text and JSON report forms.

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

// ============================================================================
// SECTION: Imports
// ============================================================================

use clap::Parser;
use dbsem_core::SemaphoreName;
use dbsem_core::SlotUsage;

use super::AcquireReport;
use super::Cli;
use super::Commands;
use super::OutputFormat;
use super::StatusReport;
use super::parse_name;

// ============================================================================
// SECTION: Tests
// ============================================================================

#[test]
fn global_flags_parse_after_subcommand() {
    let cli = Cli::try_parse_from([
        "dbsem", "status", "db", "--config", "svc.toml", "--section", "main", "--format", "json",
    ])
    .unwrap();

    assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("svc.toml")));
    assert_eq!(cli.section.as_deref(), Some("main"));
    assert_eq!(cli.format, OutputFormat::Json);
    let Commands::Status(command) = cli.command else {
        panic!("expected status command");
    };
    assert_eq!(command.name, "db");
}

#[test]
fn acquire_defaults_hold_and_timeout() {
    let cli = Cli::try_parse_from(["dbsem", "acquire", "db", "--task-id", "42"]).unwrap();

    assert_eq!(cli.format, OutputFormat::Text);
    let Commands::Acquire(command) = cli.command else {
        panic!("expected acquire command");
    };
    assert_eq!(command.task_id, 42);
    assert_eq!(command.hold_ms, 0);
    assert_eq!(command.timeout_ms, None);
}

#[test]
fn register_requires_slots() {
    assert!(Cli::try_parse_from(["dbsem", "register", "db"]).is_err());
    let cli = Cli::try_parse_from(["dbsem", "register", "db", "--slots", "3"]).unwrap();
    let Commands::Register(command) = cli.command else {
        panic!("expected register command");
    };
    assert_eq!(command.slots, 3);
}

#[test]
fn unknown_format_is_rejected() {
    assert!(Cli::try_parse_from(["dbsem", "--format", "yaml", "init"]).is_err());
}

#[test]
fn parse_name_rejects_blank_and_control_characters() {
    assert_eq!(parse_name(" db ").unwrap(), SemaphoreName::new("db"));
    assert!(parse_name("   ").is_err());
    assert!(parse_name("a\u{7}b").is_err());
}

#[test]
fn status_report_renders_text_and_json() {
    let report = StatusReport::new(
        &SemaphoreName::new("db"),
        SlotUsage {
            total: 4,
            in_use: 1,
        },
    );

    assert_eq!(report.to_text(), "db: total=4 in_use=1 free=3");
    let json: serde_json::Value = serde_json::to_value(&report).unwrap();
    assert_eq!(json["free"], 3);
}

#[test]
fn acquire_report_renders_missing_slot_as_none() {
    let report = AcquireReport {
        name: "db".to_string(),
        task_id: 7,
        audit_id: 11,
        slot: None,
        attempts: 5,
        release: "not_held",
    };

    assert_eq!(report.to_text(), "db: slot=none audit_id=11 attempts=5 release=not_held");
    let json: serde_json::Value = serde_json::to_value(&report).unwrap();
    assert!(json["slot"].is_null());
}
