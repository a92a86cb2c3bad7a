// crates/dbsem-core/src/runtime/mod.rs
// ============================================================================
// Module: dbsem Runtime
// Description: Acquisition engine, release guard, audit recorder, and stores.
// Purpose: Execute the semaphore protocol against a store connector.
// Dependencies: crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! Runtime modules implement slot acquisition with bounded retry, the
//! owned release guard, audit bookkeeping, structured events, and an
//! in-memory store for tests. Every acquisition path goes through the same
//! engine so the audit trail and retry semantics stay uniform.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod audit;
pub mod capacity;
pub mod engine;
pub mod events;
pub mod handle;
pub mod memory;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use capacity::CapacityError;
pub use capacity::resolve_capacity;
pub use engine::AcquireError;
pub use engine::AcquireRequest;
pub use engine::AcquisitionConfig;
pub use engine::AcquisitionEngine;
pub use engine::DEFAULT_MAX_TRIES;
pub use engine::DEFAULT_TRY_INTERVAL;
pub use engine::ExhaustionPolicy;
pub use engine::RetryPolicy;
pub use engine::RetryPolicyError;
pub use events::EventLevel;
pub use events::FileEventSink;
pub use events::InMemoryEventSink;
pub use events::NoopEventSink;
pub use events::SemaphoreEvent;
pub use events::SemaphoreEventKind;
pub use events::SemaphoreEventSink;
pub use events::StderrEventSink;
pub use handle::ReleaseOutcome;
pub use handle::SemaphoreHandle;
pub use memory::CallCounters;
pub use memory::InMemoryConnection;
pub use memory::InMemorySemaphoreStore;
