// crates/dbsem-store-postgres/src/lib.rs
// ============================================================================
// Module: dbsem Postgres Store
// Description: Semaphore store backend for a shared Postgres server.
// Purpose: Coordinate slots between hosts through server-side routines.
// Dependencies: dbsem-core, postgres
// ============================================================================

//! ## Overview
//! This crate provides a Postgres [`StoreConnector`]. Slot mutation is
//! delegated to three server-side routines (wait, signal, dequeue) that the
//! database administrator installs; the connector calls them by configured,
//! validated name and keeps the audit trail in ordinary tables.
//!
//! [`StoreConnector`]: dbsem_core::StoreConnector

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod connection;
pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use connection::PostgresConnection;
pub use store::PostgresSemaphoreConfig;
pub use store::PostgresSemaphoreError;
pub use store::PostgresSemaphoreStore;
pub use store::validate_identifier;
