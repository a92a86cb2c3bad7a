// crates/dbsem-core/src/core/record.rs
// ============================================================================
// Module: dbsem Audit Records
// Description: Audit trail rows and slot usage snapshots.
// Purpose: Describe the lifecycle of one acquisition as stored in `seminfo`.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! One [`AuditRecord`] exists per acquisition attempt. It moves from
//! requested to granted to released; each transition stamps a store
//! timestamp exactly once. The audit trail is for observability, not for
//! the correctness of exclusion itself.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::AuditId;
use crate::core::identifiers::SemaphoreName;
use crate::core::identifiers::SlotNumber;
use crate::core::identifiers::TaskId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Audit Record
// ============================================================================

/// Lifecycle stage derived from the audit columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    /// Requested, no grant recorded (waiting, exhausted, or crashed).
    Requested,
    /// Granted and currently held.
    Granted,
    /// Granted and released.
    Released,
}

/// Stored audit row for one acquisition attempt.
///
/// # Invariants
/// - `grant_time` is set at most once.
/// - `release_time` is set at most once and only after `grant_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique record identifier.
    pub id: AuditId,
    /// Semaphore name.
    pub name: SemaphoreName,
    /// Requesting task.
    pub task_id: TaskId,
    /// Capacity snapshot at request time.
    pub num_slots: u32,
    /// Time the request was recorded.
    pub request_time: Timestamp,
    /// Time the slot was granted.
    pub grant_time: Option<Timestamp>,
    /// Wait attempts consumed before grant or exhaustion.
    pub num_requests: Option<u32>,
    /// Assigned slot.
    pub slot: Option<SlotNumber>,
    /// Time the slot was released.
    pub release_time: Option<Timestamp>,
}

impl AuditRecord {
    /// Returns the lifecycle stage of the record.
    #[must_use]
    pub const fn stage(&self) -> AuditStage {
        match (self.grant_time, self.release_time) {
            (Some(_), Some(_)) => AuditStage::Released,
            (Some(_), None) => AuditStage::Granted,
            (None, _) => AuditStage::Requested,
        }
    }
}

/// Insert payload for a new audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditRecord {
    /// Identifier issued by the store sequence.
    pub id: AuditId,
    /// Semaphore name.
    pub name: SemaphoreName,
    /// Requesting task.
    pub task_id: TaskId,
    /// Capacity snapshot.
    pub num_slots: u32,
    /// Store timestamp at request time.
    pub request_time: Timestamp,
}

/// Update payload stamping a grant onto an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantUpdate {
    /// Record to update.
    pub id: AuditId,
    /// Slot assigned by the coordination routine.
    pub slot: SlotNumber,
    /// Attempt index at which the grant happened.
    pub num_requests: u32,
    /// Store timestamp at grant time.
    pub grant_time: Timestamp,
}

// ============================================================================
// SECTION: Slot Usage
// ============================================================================

/// Point-in-time slot usage for one semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotUsage {
    /// Registered slots.
    pub total: u32,
    /// Slots currently marked in use.
    pub in_use: u32,
}

impl SlotUsage {
    /// Returns the number of free slots.
    #[must_use]
    pub const fn free(&self) -> u32 {
        self.total.saturating_sub(self.in_use)
    }
}
