// crates/dbsem-core/src/core/mod.rs
// ============================================================================
// Module: dbsem Core Types
// Description: Identifiers, timestamps, and audit record models.
// Purpose: Shared data model for the semaphore protocol and its stores.
// Dependencies: serde, time
// ============================================================================

//! ## Overview
//! Plain data types shared by the runtime and every store connector.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod identifiers;
pub mod record;
pub mod time;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use identifiers::AuditId;
pub use identifiers::IdentifierError;
pub use identifiers::MAX_SEMAPHORE_NAME_LENGTH;
pub use identifiers::SemaphoreName;
pub use identifiers::SlotNumber;
pub use identifiers::TaskId;
pub use record::AuditRecord;
pub use record::AuditStage;
pub use record::GrantUpdate;
pub use record::NewAuditRecord;
pub use record::SlotUsage;
pub use self::time::Timestamp;
