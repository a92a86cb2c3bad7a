// crates/dbsem-core/src/runtime/capacity.rs
// ============================================================================
// Module: dbsem Capacity Resolver
// Description: Slot registry lookup for a semaphore name.
// Purpose: Reject unregistered names before any side effect.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! Capacity is the number of slot rows registered under a name. A name with
//! zero rows is unknown; callers must abort the acquisition before writing
//! an audit record or calling any coordination routine.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::num::NonZeroU32;

use thiserror::Error;

use crate::core::SemaphoreName;
use crate::interfaces::StoreConnection;
use crate::interfaces::StoreError;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Capacity resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
    /// Name has no registered slots.
    #[error("no slots registered for semaphore {0}")]
    UnknownSemaphore(SemaphoreName),
    /// Slot count query failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// SECTION: Resolver
// ============================================================================

/// Resolves the configured capacity of a semaphore.
///
/// # Errors
///
/// Returns [`CapacityError::UnknownSemaphore`] when no slots are registered
/// and [`CapacityError::Store`] when the count query fails.
pub fn resolve_capacity<C: StoreConnection>(
    connection: &mut C,
    name: &SemaphoreName,
) -> Result<NonZeroU32, CapacityError> {
    let count = connection.count_slots(name)?;
    NonZeroU32::new(count).ok_or_else(|| CapacityError::UnknownSemaphore(name.clone()))
}
