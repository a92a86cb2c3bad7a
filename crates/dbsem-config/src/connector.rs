// crates/dbsem-config/src/connector.rs
// ============================================================================
// Module: Configured Store
// Description: Backend-agnostic connector chosen by a services section.
// Purpose: Let callers drive one engine type over either backend.
// Dependencies: dbsem-core, dbsem-store-sqlite, dbsem-store-postgres
// ============================================================================

//! ## Overview
//! [`ConfiguredStore`] wraps whichever backend a section selects and
//! implements [`StoreConnector`] by delegation, so an
//! `AcquisitionEngine<ConfiguredStore>` works the same for `SQLite` and
//! Postgres. Administration calls are forwarded with backend errors mapped
//! into [`StoreError`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use dbsem_core::AuditId;
use dbsem_core::AuditRecord;
use dbsem_core::ConnectOptions;
use dbsem_core::GrantUpdate;
use dbsem_core::NewAuditRecord;
use dbsem_core::SemaphoreName;
use dbsem_core::SlotNumber;
use dbsem_core::SlotUsage;
use dbsem_core::StoreConnection;
use dbsem_core::StoreConnector;
use dbsem_core::StoreError;
use dbsem_core::Timestamp;
use dbsem_store_postgres::PostgresConnection;
use dbsem_store_postgres::PostgresSemaphoreStore;
use dbsem_store_sqlite::SqliteConnection;
use dbsem_store_sqlite::SqliteSemaphoreStore;

// ============================================================================
// SECTION: Store
// ============================================================================

/// Store opened from a services section.
#[derive(Debug, Clone)]
pub enum ConfiguredStore {
    /// `SQLite` backend.
    Sqlite(SqliteSemaphoreStore),
    /// Postgres backend.
    Postgres(PostgresSemaphoreStore),
}

impl ConfiguredStore {
    /// Prepares the backing schema.
    ///
    /// `SQLite` stores create their schema when opened, so this only
    /// affects Postgres, where the tables and sequence are created.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the DDL fails.
    pub fn initialize(&self) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(_) => Ok(()),
            Self::Postgres(store) => Ok(store.install_tables()?),
        }
    }

    /// Registers `slots` free slots under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the slot count is out of range or the
    /// semaphore has slots in use.
    pub fn register_semaphore(&self, name: &SemaphoreName, slots: u32) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(store) => Ok(store.register_semaphore(name, slots)?),
            Self::Postgres(store) => Ok(store.register_semaphore(name, slots)?),
        }
    }

    /// Removes every slot registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when slots are in use.
    pub fn unregister_semaphore(&self, name: &SemaphoreName) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(store) => Ok(store.unregister_semaphore(name)?),
            Self::Postgres(store) => Ok(store.unregister_semaphore(name)?),
        }
    }

    /// Lists registered semaphores with their slot usage.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    pub fn list_semaphores(&self) -> Result<Vec<(SemaphoreName, SlotUsage)>, StoreError> {
        match self {
            Self::Sqlite(store) => Ok(store.list_semaphores()?),
            Self::Postgres(store) => Ok(store.list_semaphores()?),
        }
    }
}

impl StoreConnector for ConfiguredStore {
    type Connection = ConfiguredConnection;

    fn connect(&self, options: ConnectOptions) -> Result<Self::Connection, StoreError> {
        match self {
            Self::Sqlite(store) => store.connect(options).map(ConfiguredConnection::Sqlite),
            Self::Postgres(store) => store.connect(options).map(ConfiguredConnection::Postgres),
        }
    }
}

// ============================================================================
// SECTION: Connection
// ============================================================================

/// Connection opened by a [`ConfiguredStore`].
pub enum ConfiguredConnection {
    /// `SQLite` connection.
    Sqlite(SqliteConnection),
    /// Postgres connection.
    Postgres(PostgresConnection),
}

/// Forwards a call to whichever backend connection is held.
macro_rules! delegate {
    ($self:ident, $conn:ident => $call:expr) => {
        match $self {
            Self::Sqlite($conn) => $call,
            Self::Postgres($conn) => $call,
        }
    };
}

impl StoreConnection for ConfiguredConnection {
    fn count_slots(&mut self, name: &SemaphoreName) -> Result<u32, StoreError> {
        delegate!(self, conn => conn.count_slots(name))
    }

    fn slot_usage(&mut self, name: &SemaphoreName) -> Result<SlotUsage, StoreError> {
        delegate!(self, conn => conn.slot_usage(name))
    }

    fn next_audit_id(&mut self) -> Result<AuditId, StoreError> {
        delegate!(self, conn => conn.next_audit_id())
    }

    fn current_timestamp(&mut self) -> Result<Timestamp, StoreError> {
        delegate!(self, conn => conn.current_timestamp())
    }

    fn insert_audit(&mut self, record: &NewAuditRecord) -> Result<(), StoreError> {
        delegate!(self, conn => conn.insert_audit(record))
    }

    fn record_grant(&mut self, update: &GrantUpdate) -> Result<(), StoreError> {
        delegate!(self, conn => conn.record_grant(update))
    }

    fn record_attempts(&mut self, id: AuditId, num_requests: u32) -> Result<(), StoreError> {
        delegate!(self, conn => conn.record_attempts(id, num_requests))
    }

    fn record_release(&mut self, id: AuditId, release_time: Timestamp) -> Result<(), StoreError> {
        delegate!(self, conn => conn.record_release(id, release_time))
    }

    fn load_audit(&mut self, id: AuditId) -> Result<Option<AuditRecord>, StoreError> {
        delegate!(self, conn => conn.load_audit(id))
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        delegate!(self, conn => conn.commit())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        delegate!(self, conn => conn.rollback())
    }

    fn wait(
        &mut self,
        name: &SemaphoreName,
        requester: AuditId,
        timeout: Option<Duration>,
    ) -> Result<SlotNumber, StoreError> {
        delegate!(self, conn => conn.wait(name, requester, timeout))
    }

    fn signal(&mut self, name: &SemaphoreName, slot: SlotNumber) -> Result<(), StoreError> {
        delegate!(self, conn => conn.signal(name, slot))
    }

    fn dequeue(
        &mut self,
        name: &SemaphoreName,
        requester: AuditId,
    ) -> Result<Option<SlotNumber>, StoreError> {
        delegate!(self, conn => conn.dequeue(name, requester))
    }

    fn coordination_commits(&self) -> bool {
        delegate!(self, conn => conn.coordination_commits())
    }

    fn close(self) -> Result<(), StoreError> {
        delegate!(self, conn => conn.close())
    }
}
