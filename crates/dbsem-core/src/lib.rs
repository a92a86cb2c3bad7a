// crates/dbsem-core/src/lib.rs
// ============================================================================
// Module: dbsem Core Library
// Description: Public API surface for the database-mediated semaphore.
// Purpose: Expose core types, store interfaces, and the acquisition runtime.
// Dependencies: crate::{core, interfaces, runtime}
// ============================================================================

//! ## Overview
//! dbsem lets independent processes share a fixed pool of slots through a
//! relational database. The database owns the slot table, the FIFO wait
//! queue, and the audit trail; this crate drives the protocol against it:
//! resolve capacity, record the request, block on the coordination routine
//! with bounded retry, record the grant, and release through an owned
//! handle on every exit path.
//!
//! Backends implement [`StoreConnector`] and [`StoreConnection`]. An
//! in-memory implementation ships with the runtime for tests.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use self::core::*;

pub use interfaces::ConnectOptions;
pub use interfaces::StoreConnection;
pub use interfaces::StoreConnector;
pub use interfaces::StoreError;
pub use runtime::AcquireError;
pub use runtime::AcquireRequest;
pub use runtime::AcquisitionConfig;
pub use runtime::AcquisitionEngine;
pub use runtime::CallCounters;
pub use runtime::CapacityError;
pub use runtime::DEFAULT_MAX_TRIES;
pub use runtime::DEFAULT_TRY_INTERVAL;
pub use runtime::EventLevel;
pub use runtime::ExhaustionPolicy;
pub use runtime::FileEventSink;
pub use runtime::InMemoryConnection;
pub use runtime::InMemoryEventSink;
pub use runtime::InMemorySemaphoreStore;
pub use runtime::NoopEventSink;
pub use runtime::ReleaseOutcome;
pub use runtime::RetryPolicy;
pub use runtime::RetryPolicyError;
pub use runtime::SemaphoreEvent;
pub use runtime::SemaphoreEventKind;
pub use runtime::SemaphoreEventSink;
pub use runtime::SemaphoreHandle;
pub use runtime::StderrEventSink;
pub use runtime::resolve_capacity;
