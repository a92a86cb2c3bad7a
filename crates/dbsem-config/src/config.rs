// crates/dbsem-config/src/config.rs
// ============================================================================
// Module: dbsem Services Configuration
// Description: Services file loading, validation, and section selection.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: dbsem-core, dbsem-store-sqlite, dbsem-store-postgres, serde, toml
// ============================================================================

//! ## Overview
//! The services file names every database section a process may coordinate
//! through, plus the retry policy and event sink shared by all of them.
//! Configuration is loaded from a TOML file with strict size and path limits;
//! unknown keys and out-of-range values fail closed.
//!
//! ```toml
//! [semaphore]
//! max_tries = 5
//! try_interval_ms = 10000
//!
//! [events]
//! sink = "file"
//! path = "dbsem-events.jsonl"
//!
//! [sections.batch]
//! backend = "sqlite"
//! path = "semaphores.db"
//! ```

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dbsem_core::AcquisitionConfig;
use dbsem_core::EventLevel;
use dbsem_core::ExhaustionPolicy;
use dbsem_core::FileEventSink;
use dbsem_core::NoopEventSink;
use dbsem_core::RetryPolicy;
use dbsem_core::SemaphoreEventSink;
use dbsem_core::StderrEventSink;
use dbsem_core::StoreError;
use dbsem_core::DEFAULT_MAX_TRIES;
use dbsem_core::DEFAULT_TRY_INTERVAL;
use dbsem_store_postgres::PostgresSemaphoreConfig;
use dbsem_store_postgres::PostgresSemaphoreStore;
use dbsem_store_sqlite::SqliteSemaphoreConfig;
use dbsem_store_sqlite::SqliteSemaphoreStore;
use serde::Deserialize;
use thiserror::Error;

use crate::connector::ConfiguredStore;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "dbsem.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "DBSEM_CONFIG";
/// Environment variable used to select a section.
pub const SECTION_ENV_VAR: &str = "DBSEM_SECTION";
/// Maximum configuration file size in bytes.
pub(crate) const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
pub(crate) const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
pub(crate) const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum number of sections in one services file.
pub(crate) const MAX_SECTIONS: usize = 64;
/// Maximum length of a section name.
pub(crate) const MAX_SECTION_NAME_LENGTH: usize = 64;
/// Upper bound on the retry interval (one hour).
pub(crate) const MAX_TRY_INTERVAL_MS: u64 = 60 * 60 * 1000;
/// Upper bound on wait attempts.
pub(crate) const MAX_TRIES_LIMIT: u32 = 10_000;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Reading the file or creating a sink failed.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing failed.
    #[error("config parse error: {0}")]
    Parse(String),
    /// A value was rejected.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Services Config
// ============================================================================

/// Parsed services file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServicesConfig {
    /// Retry behavior shared by every section.
    #[serde(default)]
    pub semaphore: SemaphoreSettings,
    /// Event sink selection.
    #[serde(default)]
    pub events: EventsConfig,
    /// Database sections keyed by name.
    #[serde(default)]
    pub sections: BTreeMap<String, SectionConfig>,
}

impl ServicesConfig {
    /// Loads and validates the services file.
    ///
    /// The path is `path` when given, else `$DBSEM_CONFIG`, else
    /// `dbsem.toml` in the working directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file is missing, oversized, malformed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path, env::var(CONFIG_ENV_VAR).ok())?;
        validate_path(&resolved)?;
        let bytes = fs::read(&resolved).map_err(|err| {
            ConfigError::Io(format!("{}: {err}", resolved.display()))
        })?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        Self::parse(content)
    }

    /// Parses and validates services TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every table.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a value is rejected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.semaphore.validate()?;
        self.events.validate()?;
        if self.sections.is_empty() {
            return Err(ConfigError::Invalid("at least one section is required".to_string()));
        }
        if self.sections.len() > MAX_SECTIONS {
            return Err(ConfigError::Invalid(format!(
                "too many sections (max {MAX_SECTIONS})"
            )));
        }
        for (name, section) in &self.sections {
            validate_section_name(name)?;
            section.validate().map_err(|err| match err {
                ConfigError::Invalid(message) => {
                    ConfigError::Invalid(format!("sections.{name}: {message}"))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Selects a section by explicit name, `$DBSEM_SECTION`, or as the sole
    /// section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the name is unknown or the
    /// choice is ambiguous.
    pub fn section(&self, name: Option<&str>) -> Result<(&str, &SectionConfig), ConfigError> {
        select_section(&self.sections, name, env::var(SECTION_ENV_VAR).ok())
    }
}

// ============================================================================
// SECTION: Semaphore Settings
// ============================================================================

/// Retry behavior from the `[semaphore]` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SemaphoreSettings {
    /// Maximum wait attempts per acquisition.
    pub max_tries: u32,
    /// Pause between attempts in milliseconds.
    pub try_interval_ms: u64,
    /// Outcome when every attempt fails.
    pub on_exhausted: ExhaustionPolicy,
    /// Open connections in thread-safe mode.
    pub threaded: bool,
}

impl Default for SemaphoreSettings {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_MAX_TRIES,
            try_interval_ms: u64::try_from(DEFAULT_TRY_INTERVAL.as_millis()).unwrap_or(u64::MAX),
            on_exhausted: ExhaustionPolicy::default(),
            threaded: false,
        }
    }
}

impl SemaphoreSettings {
    /// Validates attempt and interval bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a bound is exceeded.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tries == 0 || self.max_tries > MAX_TRIES_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "semaphore.max_tries must be between 1 and {MAX_TRIES_LIMIT}"
            )));
        }
        if self.try_interval_ms > MAX_TRY_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "semaphore.try_interval_ms must be at most {MAX_TRY_INTERVAL_MS}"
            )));
        }
        Ok(())
    }

    /// Builds the engine configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `max_tries` is zero.
    pub fn acquisition_config(&self) -> Result<AcquisitionConfig, ConfigError> {
        let retry = RetryPolicy::new(self.max_tries, Duration::from_millis(self.try_interval_ms))
            .map_err(|err| ConfigError::Invalid(format!("semaphore: {err}")))?;
        Ok(AcquisitionConfig {
            retry,
            on_exhausted: self.on_exhausted,
            threaded: self.threaded,
        })
    }
}

// ============================================================================
// SECTION: Events
// ============================================================================

/// Event sink kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSinkKind {
    /// JSON lines on stderr.
    #[default]
    Stderr,
    /// JSON lines appended to `events.path`.
    File,
    /// Discard events.
    None,
}

/// Event sink selection from the `[events]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventsConfig {
    /// Sink kind.
    #[serde(default)]
    pub sink: EventSinkKind,
    /// Output file for the `file` sink.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Events below this level are dropped.
    #[serde(default = "default_min_level")]
    pub min_level: EventLevel,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            sink: EventSinkKind::default(),
            path: None,
            min_level: default_min_level(),
        }
    }
}

/// Returns the default minimum event level.
const fn default_min_level() -> EventLevel {
    EventLevel::Error
}

impl EventsConfig {
    /// Validates sink and path agreement.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the file sink has no path or a
    /// path is given to another sink.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (self.sink, &self.path) {
            (EventSinkKind::File, None) => {
                Err(ConfigError::Invalid("events.path is required for the file sink".to_string()))
            }
            (EventSinkKind::File, Some(path)) => {
                validate_path_string("events.path", &path.to_string_lossy())
            }
            (_, Some(_)) => Err(ConfigError::Invalid(
                "events.path is only valid for the file sink".to_string(),
            )),
            (_, None) => Ok(()),
        }
    }

    /// Builds the configured sink.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the event file cannot be opened.
    pub fn build_sink(&self) -> Result<Arc<dyn SemaphoreEventSink>, ConfigError> {
        match (self.sink, &self.path) {
            (EventSinkKind::Stderr, _) => Ok(Arc::new(StderrEventSink::new(self.min_level))),
            (EventSinkKind::None, _) => Ok(Arc::new(NoopEventSink)),
            (EventSinkKind::File, Some(path)) => {
                let sink = FileEventSink::new(path, self.min_level)
                    .map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?;
                Ok(Arc::new(sink))
            }
            (EventSinkKind::File, None) => {
                Err(ConfigError::Invalid("events.path is required for the file sink".to_string()))
            }
        }
    }
}

// ============================================================================
// SECTION: Sections
// ============================================================================

/// One database section, tagged by `backend`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum SectionConfig {
    /// Local `SQLite` database file.
    Sqlite(SqliteSemaphoreConfig),
    /// Shared Postgres server.
    Postgres(PostgresSemaphoreConfig),
}

impl SectionConfig {
    /// Returns the backend label.
    #[must_use]
    pub const fn backend(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Postgres(_) => "postgres",
        }
    }

    /// Validates the backend configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the backend rejects a value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Sqlite(config) => {
                validate_path_string("path", &config.path.to_string_lossy())?;
                config.validate().map_err(|err| ConfigError::Invalid(err.to_string()))
            }
            Self::Postgres(config) => {
                config.validate().map_err(|err| ConfigError::Invalid(err.to_string()))
            }
        }
    }

    /// Opens the backend store.
    ///
    /// `SQLite` stores create their file and schema here; Postgres stores
    /// only parse the connection string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be opened.
    pub fn open(&self) -> Result<ConfiguredStore, StoreError> {
        match self {
            Self::Sqlite(config) => {
                Ok(ConfiguredStore::Sqlite(SqliteSemaphoreStore::new(config.clone())?))
            }
            Self::Postgres(config) => {
                Ok(ConfiguredStore::Postgres(PostgresSemaphoreStore::new(config)?))
            }
        }
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config path from the explicit path, env value, or default.
fn resolve_path(path: Option<&Path>, env_path: Option<String>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    if let Some(env_path) = env_path {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok(PathBuf::from(env_path));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_NAME))
}

/// Validates the resolved path against length limits.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    if path.to_string_lossy().len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    if path.components().any(|part| part.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH) {
        return Err(ConfigError::Invalid("config path component too long".to_string()));
    }
    Ok(())
}

/// Validates a configured path string against length constraints.
fn validate_path_string(field: &str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must be non-empty")));
    }
    if trimmed.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid(format!("{field} exceeds max length")));
    }
    if Path::new(trimmed)
        .components()
        .any(|part| part.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH)
    {
        return Err(ConfigError::Invalid(format!("{field} path component too long")));
    }
    Ok(())
}

/// Validates a section key.
fn validate_section_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.len() > MAX_SECTION_NAME_LENGTH {
        return Err(ConfigError::Invalid(format!(
            "section name must be 1 to {MAX_SECTION_NAME_LENGTH} characters"
        )));
    }
    if !name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_') {
        return Err(ConfigError::Invalid(format!(
            "section name {name:?} may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

/// Picks a section by explicit name, env value, or as the sole entry.
fn select_section<'a>(
    sections: &'a BTreeMap<String, SectionConfig>,
    explicit: Option<&str>,
    env_name: Option<String>,
) -> Result<(&'a str, &'a SectionConfig), ConfigError> {
    let wanted = explicit.map(str::to_string).or(env_name);
    if let Some(wanted) = wanted {
        return sections
            .get_key_value(wanted.as_str())
            .map(|(name, section)| (name.as_str(), section))
            .ok_or_else(|| ConfigError::Invalid(format!("unknown section: {wanted}")));
    }
    let mut entries = sections.iter();
    match (entries.next(), entries.next()) {
        (Some((name, section)), None) => Ok((name.as_str(), section)),
        (None, _) => Err(ConfigError::Invalid("no sections configured".to_string())),
        (Some(_), Some(_)) => Err(ConfigError::Invalid(format!(
            "multiple sections configured; choose one of: {}",
            sections.keys().cloned().collect::<Vec<_>>().join(", ")
        ))),
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::panic,
        clippy::unwrap_used,
        clippy::expect_used,
        reason = "Test-only assertions and helpers are permitted."
    )]

    use super::*;

    /// Builds two `SQLite` sections named alpha and beta.
    fn two_sections() -> BTreeMap<String, SectionConfig> {
        let mut sections = BTreeMap::new();
        for (name, path) in [("alpha", "a.db"), ("beta", "b.db")] {
            sections.insert(name.to_string(), SectionConfig::Sqlite(SqliteSemaphoreConfig::new(path)));
        }
        sections
    }

    #[test]
    fn resolve_path_prefers_explicit_then_env_then_default() {
        let explicit = resolve_path(Some(Path::new("x.toml")), Some("env.toml".to_string())).unwrap();
        assert_eq!(explicit, PathBuf::from("x.toml"));
        let from_env = resolve_path(None, Some("env.toml".to_string())).unwrap();
        assert_eq!(from_env, PathBuf::from("env.toml"));
        let fallback = resolve_path(None, None).unwrap();
        assert_eq!(fallback, PathBuf::from(DEFAULT_CONFIG_NAME));
    }

    #[test]
    fn resolve_path_rejects_overlong_env_value() {
        let long = "a".repeat(MAX_TOTAL_PATH_LENGTH + 1);
        assert!(matches!(resolve_path(None, Some(long)), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_path_rejects_long_component() {
        let long = "a".repeat(MAX_PATH_COMPONENT_LENGTH + 1);
        let result = validate_path(Path::new(&long));
        assert!(result.unwrap_err().to_string().contains("component too long"));
    }

    #[test]
    fn select_section_prefers_explicit_over_env() {
        let sections = two_sections();
        let (name, _) = select_section(&sections, Some("beta"), Some("alpha".to_string())).unwrap();
        assert_eq!(name, "beta");
        let (name, _) = select_section(&sections, None, Some("alpha".to_string())).unwrap();
        assert_eq!(name, "alpha");
    }

    #[test]
    fn select_section_requires_choice_when_ambiguous() {
        let sections = two_sections();
        let error = select_section(&sections, None, None).unwrap_err();
        assert!(error.to_string().contains("alpha, beta"));
        assert!(select_section(&sections, Some("gamma"), None).is_err());
    }

    #[test]
    fn select_section_uses_sole_entry() {
        let mut sections = two_sections();
        sections.remove("beta");
        let (name, section) = select_section(&sections, None, None).unwrap();
        assert_eq!(name, "alpha");
        assert_eq!(section.backend(), "sqlite");
    }

    #[test]
    fn section_names_are_restricted() {
        validate_section_name("batch-jobs_2").unwrap();
        assert!(validate_section_name("").is_err());
        assert!(validate_section_name("has space").is_err());
        assert!(validate_section_name(&"s".repeat(MAX_SECTION_NAME_LENGTH + 1)).is_err());
    }
}
