// crates/dbsem-store-sqlite/src/lib.rs
// ============================================================================
// Module: dbsem SQLite Store
// Description: Semaphore store backend using a shared SQLite database file.
// Purpose: Coordinate slots between processes on one host without a server.
// Dependencies: dbsem-core, rusqlite
// ============================================================================

//! ## Overview
//! This crate provides a SQLite-backed [`StoreConnector`]. The slot table,
//! FIFO wait queue, and audit trail live in one database file; the
//! coordination routines run as short `BEGIN IMMEDIATE` transactions so every
//! claim and release is serialized by the database write lock. Blocking waits
//! poll between transactions.
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

pub use connection::SqliteConnection;
pub use store::SqliteSemaphoreConfig;
pub use store::SqliteSemaphoreError;
pub use store::SqliteSemaphoreStore;
pub use store::SqliteStoreMode;
pub use store::SqliteSyncMode;
