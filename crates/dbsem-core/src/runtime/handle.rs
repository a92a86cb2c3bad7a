// crates/dbsem-core/src/runtime/handle.rs
// ============================================================================
// Module: dbsem Semaphore Handle
// Description: Owned slot grant with a deterministic release guard.
// Purpose: Tie the lifetime of a held slot to one in-process value.
// Dependencies: crate::core, crate::interfaces, crate::runtime
// ============================================================================

//! ## Overview
//! A [`SemaphoreHandle`] owns the connection that acquired a slot and the
//! audit record describing it. Releasing the handle signals the slot free,
//! stamps the release time, and closes the connection. Release runs at most
//! once: explicitly through [`SemaphoreHandle::release`], or implicitly on
//! drop. It never panics and never returns an error; failures are reported
//! to the event sink and in the returned [`ReleaseOutcome`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::core::AuditId;
use crate::core::SemaphoreName;
use crate::core::SlotNumber;
use crate::core::TaskId;
use crate::interfaces::StoreConnection;
use crate::interfaces::StoreError;
use crate::runtime::audit::record_release;
use crate::runtime::events::SemaphoreEvent;
use crate::runtime::events::SemaphoreEventKind;
use crate::runtime::events::SemaphoreEventSink;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Result of a release call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Slot signalled free and release recorded.
    Released(SlotNumber),
    /// Handle held no slot; nothing was signalled.
    NotHeld,
    /// Signal or bookkeeping failed; the slot is no longer tracked by the
    /// handle.
    Failed {
        /// Slot the handle held.
        slot: SlotNumber,
        /// Failure reported by the store.
        error: StoreError,
    },
}

/// Exclusive holder of one semaphore slot.
///
/// # Invariants
/// - At most one handle exists per audit record.
/// - `slot` is `Some` only while the slot is held.
/// - The connection is closed exactly once.
pub struct SemaphoreHandle<C: StoreConnection> {
    /// Semaphore name.
    name: SemaphoreName,
    /// Requesting task.
    task_id: TaskId,
    /// Audit record of this acquisition.
    audit_id: AuditId,
    /// Capacity snapshot.
    capacity: NonZeroU32,
    /// Attempts consumed.
    attempts: u32,
    /// Held slot.
    slot: Option<SlotNumber>,
    /// Holder connection, taken on release.
    connection: Option<C>,
    /// Event sink.
    events: Arc<dyn SemaphoreEventSink>,
}

/// Identity and grant details used to build a handle.
pub(crate) struct HandleParts<C: StoreConnection> {
    /// Semaphore name.
    pub(crate) name: SemaphoreName,
    /// Requesting task.
    pub(crate) task_id: TaskId,
    /// Audit record of this acquisition.
    pub(crate) audit_id: AuditId,
    /// Capacity snapshot.
    pub(crate) capacity: NonZeroU32,
    /// Attempts consumed.
    pub(crate) attempts: u32,
    /// Granted slot, `None` for a slotless handle.
    pub(crate) slot: Option<SlotNumber>,
    /// Holder connection.
    pub(crate) connection: Option<C>,
    /// Event sink.
    pub(crate) events: Arc<dyn SemaphoreEventSink>,
}

// ============================================================================
// SECTION: Handle
// ============================================================================

impl<C: StoreConnection> SemaphoreHandle<C> {
    /// Builds a handle from its parts.
    pub(crate) fn from_parts(parts: HandleParts<C>) -> Self {
        Self {
            name: parts.name,
            task_id: parts.task_id,
            audit_id: parts.audit_id,
            capacity: parts.capacity,
            attempts: parts.attempts,
            slot: parts.slot,
            connection: parts.connection,
            events: parts.events,
        }
    }

    /// Returns the semaphore name.
    #[must_use]
    pub const fn name(&self) -> &SemaphoreName {
        &self.name
    }

    /// Returns the requesting task.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Returns the audit record id.
    #[must_use]
    pub const fn audit_id(&self) -> AuditId {
        self.audit_id
    }

    /// Returns the capacity observed at request time.
    #[must_use]
    pub const fn capacity(&self) -> NonZeroU32 {
        self.capacity
    }

    /// Returns the number of wait attempts consumed.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the held slot.
    #[must_use]
    pub const fn slot(&self) -> Option<SlotNumber> {
        self.slot
    }

    /// Returns true while the handle holds a slot.
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.slot.is_some()
    }

    /// Releases the slot and closes the holder connection.
    ///
    /// Calling this again is a no-op returning [`ReleaseOutcome::NotHeld`].
    pub fn release(&mut self) -> ReleaseOutcome {
        let outcome = match (self.slot.take(), self.connection.as_mut()) {
            (Some(slot), Some(connection)) => {
                match signal_and_record(connection, &self.name, slot, self.audit_id) {
                    Ok(()) => {
                        self.emit(SemaphoreEvent::new(
                            SemaphoreEventKind::Released,
                            &self.name,
                            self.task_id,
                        )
                        .with_slot(slot));
                        ReleaseOutcome::Released(slot)
                    }
                    Err(error) => {
                        let _ = connection.rollback();
                        self.emit(
                            SemaphoreEvent::new(
                                SemaphoreEventKind::ReleaseFailed,
                                &self.name,
                                self.task_id,
                            )
                            .with_slot(slot)
                            .with_error(&error),
                        );
                        ReleaseOutcome::Failed {
                            slot,
                            error,
                        }
                    }
                }
            }
            (Some(slot), None) => {
                let error = StoreError::Io("holder connection missing".to_string());
                self.emit(
                    SemaphoreEvent::new(SemaphoreEventKind::ReleaseFailed, &self.name, self.task_id)
                        .with_slot(slot)
                        .with_error(&error),
                );
                ReleaseOutcome::Failed {
                    slot,
                    error,
                }
            }
            (None, _) => ReleaseOutcome::NotHeld,
        };
        self.close_connection();
        outcome
    }

    /// Closes the holder connection if it is still open.
    fn close_connection(&mut self) {
        if let Some(connection) = self.connection.take()
            && let Err(error) = connection.close()
        {
            self.emit(
                SemaphoreEvent::new(SemaphoreEventKind::ReleaseFailed, &self.name, self.task_id)
                    .with_error(error),
            );
        }
    }

    /// Emits an event tagged with this handle's audit id.
    fn emit(&self, event: SemaphoreEvent) {
        self.events.record(&event.with_audit_id(self.audit_id));
    }
}

impl<C: StoreConnection> Drop for SemaphoreHandle<C> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

impl<C: StoreConnection> fmt::Display for SemaphoreHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot {
            Some(slot) => write!(f, "{{name: {}, slot: {slot}}}", self.name),
            None => write!(f, "{{name: {}, slot: none}}", self.name),
        }
    }
}

impl<C: StoreConnection> fmt::Debug for SemaphoreHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreHandle")
            .field("name", &self.name)
            .field("task_id", &self.task_id)
            .field("audit_id", &self.audit_id)
            .field("capacity", &self.capacity)
            .field("attempts", &self.attempts)
            .field("slot", &self.slot)
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Signals the slot free and records the release on the holder connection.
fn signal_and_record<C: StoreConnection>(
    connection: &mut C,
    name: &SemaphoreName,
    slot: SlotNumber,
    audit_id: AuditId,
) -> Result<(), StoreError> {
    connection.signal(name, slot)?;
    record_release(connection, audit_id)
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
    use crate::runtime::events::InMemoryEventSink;
    use crate::runtime::memory::InMemoryConnection;

    #[test]
    fn release_without_holder_connection_reports_failure_event() {
        let sink = Arc::new(InMemoryEventSink::new());
        let mut handle = SemaphoreHandle::<InMemoryConnection>::from_parts(HandleParts {
            name: SemaphoreName::new("db"),
            task_id: TaskId::new(3),
            audit_id: AuditId::new(8),
            capacity: NonZeroU32::MIN,
            attempts: 1,
            slot: Some(SlotNumber::new(1)),
            connection: None,
            events: Arc::clone(&sink) as Arc<dyn SemaphoreEventSink>,
        });

        let outcome = handle.release();

        assert!(matches!(outcome, ReleaseOutcome::Failed { slot, .. } if slot == SlotNumber::new(1)));
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, SemaphoreEventKind::ReleaseFailed);
        assert_eq!(events[0].slot, Some(SlotNumber::new(1)));
        assert_eq!(handle.release(), ReleaseOutcome::NotHeld);
        assert_eq!(sink.events().len(), 1);
    }
}
