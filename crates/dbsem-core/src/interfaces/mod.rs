// crates/dbsem-core/src/interfaces/mod.rs
// ============================================================================
// Module: dbsem Interfaces
// Description: Backend-agnostic store connector and connection contracts.
// Purpose: Define the store surface the semaphore protocol depends on.
// Dependencies: crate::core, thiserror
// ============================================================================

//! ## Overview
//! The protocol core never talks SQL. It drives a [`StoreConnection`] obtained
//! from a [`StoreConnector`]: plain reads and writes for the slot registry and
//! the audit trail, transaction control, and the three coordination routines
//! (`wait`, `signal`, `dequeue`) that own all mutation of slot state.
//!
//! Implementations must treat every coordination routine as atomic. The core
//! does not re-verify exclusion.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use thiserror::Error;

use crate::core::AuditId;
use crate::core::AuditRecord;
use crate::core::GrantUpdate;
use crate::core::NewAuditRecord;
use crate::core::SemaphoreName;
use crate::core::SlotNumber;
use crate::core::SlotUsage;
use crate::core::Timestamp;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Store connector errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Connection could not be established.
    #[error("store connect error: {0}")]
    Connect(String),
    /// Statement execution or transport failure.
    #[error("store io error: {0}")]
    Io(String),
    /// Coordination routine reported a failure.
    #[error("coordination routine error: {0}")]
    Coordination(String),
    /// Blocking wait exceeded its timeout.
    #[error("coordination wait timed out after {0:?}")]
    Timeout(Duration),
    /// Store returned or was given invalid data.
    #[error("store invalid data: {0}")]
    Invalid(String),
    /// Store reported an error.
    #[error("store error: {0}")]
    Store(String),
}

// ============================================================================
// SECTION: Connector
// ============================================================================

/// Options applied when opening a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectOptions {
    /// Open the connection in a thread-safe mode.
    pub threaded: bool,
}

/// Factory for fresh store connections.
pub trait StoreConnector {
    /// Connection type produced by this connector.
    type Connection: StoreConnection;

    /// Opens a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store is unreachable or rejects the
    /// connection.
    fn connect(&self, options: ConnectOptions) -> Result<Self::Connection, StoreError>;
}

// ============================================================================
// SECTION: Connection
// ============================================================================

/// One live connection to the backing store.
///
/// Writes (`insert_audit`, `record_*`) join the connection's current
/// transaction and become durable only on [`StoreConnection::commit`].
pub trait StoreConnection {
    /// Counts registered slots for a semaphore.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn count_slots(&mut self, name: &SemaphoreName) -> Result<u32, StoreError>;

    /// Reads total and in-use slot counts for a semaphore.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn slot_usage(&mut self, name: &SemaphoreName) -> Result<SlotUsage, StoreError>;

    /// Issues the next audit identifier from the store sequence.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the sequence cannot be advanced.
    fn next_audit_id(&mut self) -> Result<AuditId, StoreError>;

    /// Reads the store clock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the clock query fails.
    fn current_timestamp(&mut self) -> Result<Timestamp, StoreError>;

    /// Inserts a new audit record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the insert fails.
    fn insert_audit(&mut self, record: &NewAuditRecord) -> Result<(), StoreError>;

    /// Stamps grant time, slot, and attempt count onto an audit record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the update fails or the record is missing.
    fn record_grant(&mut self, update: &GrantUpdate) -> Result<(), StoreError>;

    /// Stores the attempt count of an acquisition that was never granted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the update fails or the record is missing.
    fn record_attempts(&mut self, id: AuditId, num_requests: u32) -> Result<(), StoreError>;

    /// Stamps the release time onto an audit record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the update fails or the record is missing.
    fn record_release(&mut self, id: AuditId, release_time: Timestamp) -> Result<(), StoreError>;

    /// Loads an audit record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails or the row is malformed.
    fn load_audit(&mut self, id: AuditId) -> Result<Option<AuditRecord>, StoreError>;

    /// Commits the current transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the commit fails.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Rolls back the current transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the rollback fails.
    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Blocks until a slot of `name` is free and assigns it to `requester`.
    ///
    /// `timeout` bounds the blocking call; `None` waits as long as the store
    /// allows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the routine fails, times out, or the
    /// connection is lost.
    fn wait(
        &mut self,
        name: &SemaphoreName,
        requester: AuditId,
        timeout: Option<Duration>,
    ) -> Result<SlotNumber, StoreError>;

    /// Frees a previously assigned slot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the routine fails.
    fn signal(&mut self, name: &SemaphoreName, slot: SlotNumber) -> Result<(), StoreError>;

    /// Removes the wait entry left by `requester`, freeing any slot it had
    /// already been assigned. Returns that slot, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the routine fails.
    fn dequeue(
        &mut self,
        name: &SemaphoreName,
        requester: AuditId,
    ) -> Result<Option<SlotNumber>, StoreError>;

    /// Returns true when the coordination routines commit their own work.
    ///
    /// When false the caller must commit after a successful `wait`.
    fn coordination_commits(&self) -> bool;

    /// Closes the connection, discarding uncommitted work.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the close handshake fails.
    fn close(self) -> Result<(), StoreError>
    where
        Self: Sized;
}
