// crates/dbsem-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Semaphore Store
// Description: Configuration, schema, and administration of the SQLite store.
// Purpose: Open coordinated connections to a shared semaphore database.
// Dependencies: dbsem-core, rusqlite, serde, thiserror
// ============================================================================

//! ## Overview
//! [`SqliteSemaphoreStore`] owns the store configuration and hands out one
//! fresh [`SqliteConnection`] per [`StoreConnector::connect`] call. Opening the
//! store creates the schema or validates the existing version. Slot
//! registration is an administrative operation and refuses to touch a
//! semaphore with slots in use.
//!
//! Schema:
//! - `semlock (name, slot, in_use, holder)`: slot registry.
//! - `semqueue (seq, name, requester, enqueued_at, heartbeat)`: FIFO wait
//!   queue. Waiters refresh `heartbeat` on every poll; entries whose heartbeat
//!   is older than `stale_after_ms` belong to dead waiters and are pruned.
//! - `seminfo_seq (id)`: audit id sequence.
//! - `seminfo (...)`: audit trail.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use dbsem_core::AuditRecord;
use dbsem_core::ConnectOptions;
use dbsem_core::SemaphoreName;
use dbsem_core::SlotUsage;
use dbsem_core::StoreConnector;
use dbsem_core::StoreError;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use serde::Deserialize;
use thiserror::Error;

use crate::connection::SqliteConnection;
use crate::connection::audit_from_row;
use crate::connection::count_to_u32;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// `SQLite` schema version for the store.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Default poll interval of blocking waits (ms).
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
/// Default age after which an unrefreshed queue entry is dropped (ms).
const DEFAULT_STALE_AFTER_MS: u64 = 5_000;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum number of slots per semaphore.
pub const MAX_SLOTS: u32 = 10_000;

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteStoreMode {
    /// WAL journal mode (recommended for concurrent processes).
    #[default]
    Wal,
    /// Delete journal mode.
    Delete,
}

impl SqliteStoreMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode.
    #[default]
    Full,
    /// Normal synchronous mode.
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the `SQLite` semaphore store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteSemaphoreConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteStoreMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
    /// Delay between claim attempts of a blocking wait, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Bound on a single blocking wait when the caller passes none.
    #[serde(default)]
    pub wait_timeout_ms: Option<u64>,
    /// Age in milliseconds after which a queue entry whose waiter stopped
    /// polling is dropped. Must exceed `poll_interval_ms`.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

impl SqliteSemaphoreConfig {
    /// Creates a configuration with defaults for everything but the path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteStoreMode::default(),
            sync_mode: SqliteSyncMode::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            wait_timeout_ms: None,
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteSemaphoreError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), SqliteSemaphoreError> {
        validate_store_path(&self.path)?;
        if self.poll_interval_ms == 0 {
            return Err(SqliteSemaphoreError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.wait_timeout_ms == Some(0) {
            return Err(SqliteSemaphoreError::Invalid(
                "wait_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.stale_after_ms <= self.poll_interval_ms {
            return Err(SqliteSemaphoreError::Invalid(
                "stale_after_ms must be greater than poll_interval_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

/// Returns the default poll interval of blocking waits.
const fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

/// Returns the default queue entry lease.
const fn default_stale_after_ms() -> u64 {
    DEFAULT_STALE_AFTER_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// `SQLite` semaphore store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqliteSemaphoreError {
    /// Store I/O error.
    #[error("sqlite semaphore store io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("sqlite semaphore store db error: {0}")]
    Db(String),
    /// Store schema version mismatch.
    #[error("sqlite semaphore store version mismatch: {0}")]
    VersionMismatch(String),
    /// Invalid configuration or store data.
    #[error("sqlite semaphore store invalid data: {0}")]
    Invalid(String),
}

impl From<SqliteSemaphoreError> for StoreError {
    fn from(error: SqliteSemaphoreError) -> Self {
        match error {
            SqliteSemaphoreError::Io(message) => Self::Io(message),
            SqliteSemaphoreError::Db(message) => Self::Store(message),
            SqliteSemaphoreError::VersionMismatch(message)
            | SqliteSemaphoreError::Invalid(message) => Self::Invalid(message),
        }
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// `SQLite`-backed semaphore store.
#[derive(Debug, Clone)]
pub struct SqliteSemaphoreStore {
    /// Store configuration.
    config: SqliteSemaphoreConfig,
}

impl SqliteSemaphoreStore {
    /// Opens the store, creating the schema when missing.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteSemaphoreError`] when the configuration is invalid or
    /// the database cannot be opened or initialized.
    pub fn new(config: SqliteSemaphoreConfig) -> Result<Self, SqliteSemaphoreError> {
        config.validate()?;
        ensure_parent_dir(&config.path)?;
        let mut connection = open_connection(&config, true)?;
        initialize_schema(&mut connection)?;
        Ok(Self {
            config,
        })
    }

    /// Returns the store configuration.
    #[must_use]
    pub const fn config(&self) -> &SqliteSemaphoreConfig {
        &self.config
    }

    /// Registers `slots` free slots under `name`, replacing an idle set.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteSemaphoreError::Invalid`] when `slots` is out of range
    /// or the semaphore has slots in use.
    pub fn register_semaphore(
        &self,
        name: &SemaphoreName,
        slots: u32,
    ) -> Result<(), SqliteSemaphoreError> {
        if slots == 0 || slots > MAX_SLOTS {
            return Err(SqliteSemaphoreError::Invalid(format!(
                "slots must be between 1 and {MAX_SLOTS}"
            )));
        }
        self.replace_slots(name, slots)
    }

    /// Removes every slot registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteSemaphoreError::Invalid`] when slots are in use.
    pub fn unregister_semaphore(&self, name: &SemaphoreName) -> Result<(), SqliteSemaphoreError> {
        self.replace_slots(name, 0)
    }

    /// Lists registered semaphores with their slot usage.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteSemaphoreError`] when the query fails.
    pub fn list_semaphores(&self) -> Result<Vec<(SemaphoreName, SlotUsage)>, SqliteSemaphoreError> {
        let connection = open_connection(&self.config, false)?;
        let mut statement = connection
            .prepare(
                "SELECT name, COUNT(*), COALESCE(SUM(in_use), 0) FROM semlock GROUP BY name \
                 ORDER BY name",
            )
            .map_err(db_error)?;
        let rows = statement
            .query_map(params![], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })
            .map_err(db_error)?;
        let mut semaphores = Vec::new();
        for row in rows {
            let (name, total, in_use) = row.map_err(db_error)?;
            let usage = SlotUsage {
                total: count_to_u32(total).map_err(invalid)?,
                in_use: count_to_u32(in_use).map_err(invalid)?,
            };
            semaphores.push((SemaphoreName::new(name), usage));
        }
        Ok(semaphores)
    }

    /// Returns the audit trail of `name`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteSemaphoreError`] when the query fails or a row is
    /// malformed.
    pub fn audit_records(
        &self,
        name: &SemaphoreName,
    ) -> Result<Vec<AuditRecord>, SqliteSemaphoreError> {
        let connection = open_connection(&self.config, false)?;
        let mut statement = connection
            .prepare(
                "SELECT id, name, task_id, num_slots, request_time, grant_time, num_requests, \
                 slot, release_time FROM seminfo WHERE name = ?1 ORDER BY id",
            )
            .map_err(db_error)?;
        let rows = statement.query_map(params![name.as_str()], audit_from_row).map_err(db_error)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(db_error)?.into_record().map_err(invalid)?);
        }
        Ok(records)
    }

    /// Replaces the slot set of `name` with `slots` free slots.
    fn replace_slots(&self, name: &SemaphoreName, slots: u32) -> Result<(), SqliteSemaphoreError> {
        let mut connection = open_connection(&self.config, false)?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_error)?;
        let in_use: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM semlock WHERE name = ?1 AND in_use = 1",
                params![name.as_str()],
                |row| row.get(0),
            )
            .map_err(db_error)?;
        if in_use > 0 {
            return Err(SqliteSemaphoreError::Invalid(format!(
                "semaphore {name} has {in_use} slots in use"
            )));
        }
        tx.execute("DELETE FROM semlock WHERE name = ?1", params![name.as_str()])
            .map_err(db_error)?;
        for slot in 1 ..= slots {
            tx.execute(
                "INSERT INTO semlock (name, slot, in_use, holder) VALUES (?1, ?2, 0, NULL)",
                params![name.as_str(), slot],
            )
            .map_err(db_error)?;
        }
        tx.commit().map_err(db_error)?;
        Ok(())
    }
}

impl StoreConnector for SqliteSemaphoreStore {
    type Connection = SqliteConnection;

    fn connect(&self, options: ConnectOptions) -> Result<Self::Connection, StoreError> {
        let connection = open_connection(&self.config, options.threaded)
            .map_err(|err| StoreError::Connect(err.to_string()))?;
        Ok(SqliteConnection::new(
            connection,
            Duration::from_millis(self.config.poll_interval_ms),
            self.config.wait_timeout_ms.map(Duration::from_millis),
            Duration::from_millis(self.config.stale_after_ms),
        ))
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Maps a `SQLite` error into a store error.
fn db_error(error: rusqlite::Error) -> SqliteSemaphoreError {
    SqliteSemaphoreError::Db(error.to_string())
}

/// Maps a row conversion failure into a store error.
fn invalid(error: StoreError) -> SqliteSemaphoreError {
    SqliteSemaphoreError::Invalid(error.to_string())
}

/// Ensures the parent directory for the store exists.
fn ensure_parent_dir(path: &Path) -> Result<(), SqliteSemaphoreError> {
    let Some(parent) = path.parent() else {
        return Err(SqliteSemaphoreError::Io("store path missing parent directory".to_string()));
    };
    std::fs::create_dir_all(parent).map_err(|err| SqliteSemaphoreError::Io(err.to_string()))
}

/// Validates store paths for safety limits.
fn validate_store_path(path: &Path) -> Result<(), SqliteSemaphoreError> {
    if path.as_os_str().is_empty() {
        return Err(SqliteSemaphoreError::Invalid("store path must be non-empty".to_string()));
    }
    if path.display().to_string().len() > MAX_TOTAL_PATH_LENGTH {
        return Err(SqliteSemaphoreError::Invalid("store path exceeds length limit".to_string()));
    }
    if path
        .components()
        .any(|component| component.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH)
    {
        return Err(SqliteSemaphoreError::Invalid(
            "store path contains an overlong component".to_string(),
        ));
    }
    if path.is_dir() {
        return Err(SqliteSemaphoreError::Invalid(
            "store path must be a file, not a directory".to_string(),
        ));
    }
    Ok(())
}

/// Opens an `SQLite` connection; `threaded` selects serialized mode.
fn open_connection(
    config: &SqliteSemaphoreConfig,
    threaded: bool,
) -> Result<Connection, SqliteSemaphoreError> {
    let mutex = if threaded {
        OpenFlags::SQLITE_OPEN_FULL_MUTEX
    } else {
        OpenFlags::SQLITE_OPEN_NO_MUTEX
    };
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | mutex;
    let connection = Connection::open_with_flags(&config.path, flags).map_err(db_error)?;
    apply_pragmas(&connection, config)?;
    Ok(connection)
}

/// Applies `SQLite` pragmas required for durability.
fn apply_pragmas(
    connection: &Connection,
    config: &SqliteSemaphoreConfig,
) -> Result<(), SqliteSemaphoreError> {
    connection
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .map_err(db_error)?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))
        .map_err(db_error)?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))
        .map_err(db_error)?;
    Ok(())
}

/// Initializes the `SQLite` schema or validates the existing version.
fn initialize_schema(connection: &mut Connection) -> Result<(), SqliteSemaphoreError> {
    let tx = connection
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_error)?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
        .map_err(db_error)?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
        .optional()
        .map_err(db_error)?;
    match version {
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])
                .map_err(db_error)?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS semlock (
                    name TEXT NOT NULL,
                    slot INTEGER NOT NULL,
                    in_use INTEGER NOT NULL DEFAULT 0 CHECK (in_use IN (0, 1)),
                    holder INTEGER,
                    PRIMARY KEY (name, slot)
                );
                CREATE TABLE IF NOT EXISTS semqueue (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    requester INTEGER NOT NULL,
                    enqueued_at INTEGER NOT NULL,
                    heartbeat INTEGER NOT NULL DEFAULT 0,
                    UNIQUE (name, requester)
                );
                CREATE TABLE IF NOT EXISTS seminfo_seq (
                    id INTEGER PRIMARY KEY AUTOINCREMENT
                );
                CREATE TABLE IF NOT EXISTS seminfo (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    task_id INTEGER NOT NULL,
                    num_slots INTEGER NOT NULL,
                    request_time INTEGER NOT NULL,
                    grant_time INTEGER,
                    num_requests INTEGER,
                    slot INTEGER,
                    release_time INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_seminfo_name ON seminfo (name);",
            )
            .map_err(db_error)?;
        }
        Some(value) if value == SCHEMA_VERSION => {}
        Some(value) => {
            return Err(SqliteSemaphoreError::VersionMismatch(format!(
                "unsupported schema version: {value}"
            )));
        }
    }
    tx.commit().map_err(db_error)?;
    Ok(())
}
