// crates/dbsem-core/src/runtime/audit.rs
// ============================================================================
// Module: dbsem Audit Recorder
// Description: Audit trail writes for requested, granted, and released slots.
// Purpose: Make every acquisition observable from the store.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! Each helper performs one audit transition and commits it. On failure the
//! pending transaction is rolled back (best effort) and the original error
//! returned.
//!
//! Connection discipline matters here: the grant must be recorded on a
//! different connection from the one that issued the blocking wait, since
//! committing the wait connection may release the lock the coordination
//! routine holds over the slot table.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::num::NonZeroU32;

use crate::core::AuditId;
use crate::core::GrantUpdate;
use crate::core::NewAuditRecord;
use crate::core::SemaphoreName;
use crate::core::SlotNumber;
use crate::core::TaskId;
use crate::interfaces::StoreConnection;
use crate::interfaces::StoreError;

// ============================================================================
// SECTION: Recorder
// ============================================================================

/// Creates and commits the audit record for a new request.
///
/// # Errors
///
/// Returns [`StoreError`] when the id, clock, insert, or commit fails.
pub fn open_audit<C: StoreConnection>(
    connection: &mut C,
    name: &SemaphoreName,
    task_id: TaskId,
    capacity: NonZeroU32,
) -> Result<AuditId, StoreError> {
    let id = connection.next_audit_id()?;
    let request_time = connection.current_timestamp()?;
    let record = NewAuditRecord {
        id,
        name: name.clone(),
        task_id,
        num_slots: capacity.get(),
        request_time,
    };
    commit_or_rollback(connection, |conn| conn.insert_audit(&record))?;
    Ok(id)
}

/// Records a grant and commits it.
///
/// `connection` must not be the connection that performed the wait.
///
/// # Errors
///
/// Returns [`StoreError`] when the clock, update, or commit fails.
pub fn record_grant<C: StoreConnection>(
    connection: &mut C,
    id: AuditId,
    slot: SlotNumber,
    attempts: u32,
) -> Result<(), StoreError> {
    let grant_time = connection.current_timestamp()?;
    let update = GrantUpdate {
        id,
        slot,
        num_requests: attempts,
        grant_time,
    };
    commit_or_rollback(connection, |conn| conn.record_grant(&update))
}

/// Records the attempt count of an acquisition that was never granted.
///
/// # Errors
///
/// Returns [`StoreError`] when the update or commit fails.
pub fn record_attempts<C: StoreConnection>(
    connection: &mut C,
    id: AuditId,
    attempts: u32,
) -> Result<(), StoreError> {
    commit_or_rollback(connection, |conn| conn.record_attempts(id, attempts))
}

/// Records a release and commits it on the holder connection.
///
/// # Errors
///
/// Returns [`StoreError`] when the clock, update, or commit fails.
pub fn record_release<C: StoreConnection>(
    connection: &mut C,
    id: AuditId,
) -> Result<(), StoreError> {
    let release_time = connection.current_timestamp()?;
    commit_or_rollback(connection, |conn| conn.record_release(id, release_time))
}

/// Runs a write and commits, rolling back when either step fails.
fn commit_or_rollback<C: StoreConnection>(
    connection: &mut C,
    write: impl FnOnce(&mut C) -> Result<(), StoreError>,
) -> Result<(), StoreError> {
    let result = write(connection).and_then(|()| connection.commit());
    if result.is_err() {
        let _ = connection.rollback();
    }
    result
}
