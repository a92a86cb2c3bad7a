// crates/dbsem-config/src/lib.rs
// ============================================================================
// Module: dbsem Config Library
// Description: Services file model, validation, and configured backends.
// Purpose: Single source of truth for dbsem.toml semantics.
// Dependencies: dbsem-core, dbsem-store-sqlite, dbsem-store-postgres, toml
// ============================================================================

//! ## Overview
//! `dbsem-config` loads the services file that names the database sections a
//! process may coordinate through, validates it fail-closed, and turns the
//! selected section into a ready [`AcquisitionEngine`] over either backend.
//!
//! [`AcquisitionEngine`]: dbsem_core::AcquisitionEngine

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;
pub mod connector;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
pub use connector::ConfiguredConnection;
pub use connector::ConfiguredStore;
