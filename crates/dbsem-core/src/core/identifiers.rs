// crates/dbsem-core/src/core/identifiers.rs
// ============================================================================
// Module: dbsem Identifiers
// Description: Strongly typed identifiers for semaphores, tasks, and slots.
// Purpose: Keep names, audit ids, and slot numbers from being mixed up.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! Identifiers used by the semaphore protocol. Names are opaque strings that
//! serialize transparently; numeric identifiers wrap the integer column types
//! used by the backing stores. [`SemaphoreName::parse`] is the validating
//! constructor for untrusted input (config files, CLI arguments).

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum length of a semaphore name in bytes.
pub const MAX_SEMAPHORE_NAME_LENGTH: usize = 128;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Identifier validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    /// Name is empty or whitespace only.
    #[error("semaphore name must be non-empty")]
    Empty,
    /// Name exceeds [`MAX_SEMAPHORE_NAME_LENGTH`].
    #[error("semaphore name exceeds {MAX_SEMAPHORE_NAME_LENGTH} bytes")]
    TooLong,
    /// Name contains control characters.
    #[error("semaphore name contains control characters")]
    ControlCharacter,
}

// ============================================================================
// SECTION: Semaphore Name
// ============================================================================

/// Name of a semaphore registered in the slot registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SemaphoreName(String);

impl SemaphoreName {
    /// Creates a new semaphore name without validation.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Parses a semaphore name from untrusted input.
    ///
    /// # Errors
    ///
    /// Returns [`IdentifierError`] when the name is empty, too long, or
    /// contains control characters.
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IdentifierError::Empty);
        }
        if trimmed.len() > MAX_SEMAPHORE_NAME_LENGTH {
            return Err(IdentifierError::TooLong);
        }
        if trimmed.chars().any(char::is_control) {
            return Err(IdentifierError::ControlCharacter);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SemaphoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for SemaphoreName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SemaphoreName {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

// ============================================================================
// SECTION: Numeric Identifiers
// ============================================================================

/// Identifier of the unit of work requesting a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(i64);

impl TaskId {
    /// Creates a new task identifier.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one audit record, unique per acquisition attempt.
///
/// The audit id doubles as the requester identity in the wait queue, so a
/// fresh connection can dequeue the stale entry of a lost one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditId(i64);

impl AuditId {
    /// Creates a new audit identifier.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for AuditId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Slot number assigned by the coordination routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotNumber(i64);

impl SlotNumber {
    /// Creates a new slot number.
    #[must_use]
    pub const fn new(slot: i64) -> Self {
        Self(slot)
    }

    /// Returns the raw slot number.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for SlotNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
