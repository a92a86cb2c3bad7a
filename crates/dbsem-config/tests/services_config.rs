// crates/dbsem-config/tests/services_config.rs
// ============================================================================
// Module: Services Config Tests
// Description: Services file parsing, validation, and configured stores.
// Purpose: Ensure config inputs fail closed and sections open working stores.
// ============================================================================

//! Services configuration tests.

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
    reason = "Test-only assertions and helpers are permitted."
)]

use std::fs;
use std::path::Path;
use std::time::Duration;

use dbsem_config::ConfigError;
use dbsem_config::EventSinkKind;
use dbsem_config::SectionConfig;
use dbsem_config::ServicesConfig;
use dbsem_core::AcquireRequest;
use dbsem_core::AcquisitionEngine;
use dbsem_core::EventLevel;
use dbsem_core::ExhaustionPolicy;
use dbsem_core::SemaphoreEvent;
use dbsem_core::SemaphoreEventKind;
use dbsem_core::SemaphoreName;
use dbsem_core::TaskId;

type TestResult = Result<(), String>;

/// Writes `content` to a services file inside `dir`.
fn write_config(dir: &Path, content: &str) -> std::path::PathBuf {
    let path = dir.join("dbsem.toml");
    fs::write(&path, content).unwrap();
    path
}

/// Minimal single-section `SQLite` services file.
fn sqlite_config(dir: &Path) -> String {
    format!(
        "[semaphore]\nmax_tries = 2\ntry_interval_ms = 10\n\n[events]\nsink = \"none\"\n\n\
         [sections.local]\nbackend = \"sqlite\"\npath = {:?}\npoll_interval_ms = 5\n",
        dir.join("semaphores.db").display().to_string()
    )
}

#[test]
fn defaults_apply_when_tables_are_omitted() -> TestResult {
    let config = ServicesConfig::parse(
        "[sections.main]\nbackend = \"postgres\"\nconnection = \"host=db user=sem\"\n",
    )
    .map_err(|err| err.to_string())?;

    assert_eq!(config.semaphore.max_tries, 5);
    assert_eq!(config.semaphore.try_interval_ms, 10_000);
    assert_eq!(config.semaphore.on_exhausted, ExhaustionPolicy::Error);
    assert!(!config.semaphore.threaded);
    assert_eq!(config.events.sink, EventSinkKind::Stderr);
    assert_eq!(config.events.min_level, EventLevel::Error);
    let (name, section) = config.section(Some("main")).map_err(|err| err.to_string())?;
    assert_eq!(name, "main");
    let SectionConfig::Postgres(postgres) = section else {
        return Err("expected postgres section".to_string());
    };
    assert_eq!(postgres.wait_routine, "sem_wait");
    Ok(())
}

#[test]
fn semaphore_settings_build_acquisition_config() -> TestResult {
    let config = ServicesConfig::parse(
        "[semaphore]\nmax_tries = 3\ntry_interval_ms = 250\non_exhausted = \"dead_handle\"\n\
         threaded = true\n\n[sections.main]\nbackend = \"sqlite\"\npath = \"sem.db\"\n",
    )
    .map_err(|err| err.to_string())?;

    let acquisition = config.semaphore.acquisition_config().map_err(|err| err.to_string())?;

    assert_eq!(acquisition.retry.max_tries(), 3);
    assert_eq!(acquisition.retry.try_interval(), Duration::from_millis(250));
    assert_eq!(acquisition.on_exhausted, ExhaustionPolicy::DeadHandle);
    assert!(acquisition.threaded);
    Ok(())
}

#[test]
fn unknown_keys_are_rejected() {
    for content in [
        "[semaphore]\nretries = 3\n[sections.a]\nbackend = \"sqlite\"\npath = \"a.db\"\n",
        "[sections.a]\nbackend = \"sqlite\"\npath = \"a.db\"\npool = 4\n",
        "[metrics]\nenabled = true\n[sections.a]\nbackend = \"sqlite\"\npath = \"a.db\"\n",
        "[sections.a]\nbackend = \"mysql\"\n",
    ] {
        let result = ServicesConfig::parse(content);
        assert!(matches!(result, Err(ConfigError::Parse(_))), "accepted {content:?}");
    }
}

#[test]
fn out_of_range_values_are_invalid() {
    for content in [
        "[semaphore]\nmax_tries = 0\n[sections.a]\nbackend = \"sqlite\"\npath = \"a.db\"\n",
        "[events]\nsink = \"file\"\n[sections.a]\nbackend = \"sqlite\"\npath = \"a.db\"\n",
        "[events]\npath = \"e.jsonl\"\n[sections.a]\nbackend = \"sqlite\"\npath = \"a.db\"\n",
        "[sections.a]\nbackend = \"sqlite\"\npath = \"a.db\"\npoll_interval_ms = 0\n",
        "[sections.a]\nbackend = \"postgres\"\nwait_routine = \"x; drop\"\n",
        "[sections.\"bad name\"]\nbackend = \"sqlite\"\npath = \"a.db\"\n",
        "[semaphore]\nmax_tries = 2\n",
    ] {
        let result = ServicesConfig::parse(content);
        assert!(matches!(result, Err(ConfigError::Invalid(_))), "accepted {content:?}");
    }
}

#[test]
fn section_errors_name_the_section() {
    let error = ServicesConfig::parse(
        "[sections.batch]\nbackend = \"postgres\"\nconnect_timeout_ms = 0\n",
    )
    .unwrap_err();
    let message = error.to_string();
    assert!(message.starts_with("invalid config: sections.batch:"), "{message}");
    assert_eq!(message.matches("invalid config").count(), 1);
}

#[test]
fn load_reads_explicit_path() -> TestResult {
    let dir = tempfile::tempdir().map_err(|err| err.to_string())?;
    let path = write_config(dir.path(), &sqlite_config(dir.path()));

    let config = ServicesConfig::load(Some(&path)).map_err(|err| err.to_string())?;

    assert_eq!(config.sections.len(), 1);
    assert_eq!(config.section(None).map_err(|err| err.to_string())?.0, "local");
    Ok(())
}

#[test]
fn load_reports_missing_file_as_io() {
    let dir = tempfile::tempdir().unwrap();
    let result = ServicesConfig::load(Some(&dir.path().join("absent.toml")));
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

#[test]
fn load_rejects_oversized_and_non_utf8_files() {
    let dir = tempfile::tempdir().unwrap();
    let big = dir.path().join("big.toml");
    fs::write(&big, format!("# {}\n", "x".repeat(1024 * 1024))).unwrap();
    assert!(matches!(ServicesConfig::load(Some(&big)), Err(ConfigError::Invalid(_))));

    let binary = dir.path().join("binary.toml");
    fs::write(&binary, [0xff, 0xfe, 0x00]).unwrap();
    assert!(matches!(ServicesConfig::load(Some(&binary)), Err(ConfigError::Invalid(_))));
}

#[test]
fn file_sink_writes_filtered_events() -> TestResult {
    let dir = tempfile::tempdir().map_err(|err| err.to_string())?;
    let events_path = dir.path().join("events.jsonl");
    let content = format!(
        "[events]\nsink = \"file\"\npath = {:?}\nmin_level = \"error\"\n\n\
         [sections.a]\nbackend = \"sqlite\"\npath = \"a.db\"\n",
        events_path.display().to_string()
    );
    let config = ServicesConfig::parse(&content).map_err(|err| err.to_string())?;
    let sink = config.events.build_sink().map_err(|err| err.to_string())?;
    let name = SemaphoreName::new("db");

    sink.record(&SemaphoreEvent::new(SemaphoreEventKind::Granted, &name, TaskId::new(1)));
    sink.record(&SemaphoreEvent::new(SemaphoreEventKind::Exhausted, &name, TaskId::new(1)));

    let written = fs::read_to_string(&events_path).map_err(|err| err.to_string())?;
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("\"exhausted\""));
    Ok(())
}

#[test]
fn sqlite_section_opens_a_working_store() -> TestResult {
    let dir = tempfile::tempdir().map_err(|err| err.to_string())?;
    let config = ServicesConfig::parse(&sqlite_config(dir.path())).map_err(|err| err.to_string())?;
    let (_, section) = config.section(None).map_err(|err| err.to_string())?;
    let store = section.open().map_err(|err| err.to_string())?;
    store.initialize().map_err(|err| err.to_string())?;
    let name = SemaphoreName::new("jobs");
    store.register_semaphore(&name, 2).map_err(|err| err.to_string())?;
    let engine = AcquisitionEngine::new(
        store.clone(),
        config.semaphore.acquisition_config().map_err(|err| err.to_string())?,
    )
    .with_events(config.events.build_sink().map_err(|err| err.to_string())?);

    let handle = engine
        .acquire(&AcquireRequest::new("jobs", TaskId::new(9)))
        .map_err(|err| err.to_string())?;
    let listed = store.list_semaphores().map_err(|err| err.to_string())?;
    assert_eq!(listed[0].1.in_use, 1);
    assert!(store.unregister_semaphore(&name).is_err());
    drop(handle);

    assert_eq!(store.list_semaphores().map_err(|err| err.to_string())?[0].1.in_use, 0);
    store.unregister_semaphore(&name).map_err(|err| err.to_string())?;
    Ok(())
}
