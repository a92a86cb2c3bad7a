// crates/dbsem-core/tests/memory_store.rs
// ============================================================================
// Module: In-Memory Store Tests
// Description: Coordination routine semantics of the in-memory store.
// Purpose: Ensure the test store behaves like the database routines.
// ============================================================================
//! ## Overview
//! Exercises `wait`, `signal`, `dequeue`, and audit transactions directly on
//! [`InMemoryConnection`].

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::time::Duration;

use dbsem_core::AuditId;
use dbsem_core::ConnectOptions;
use dbsem_core::GrantUpdate;
use dbsem_core::InMemoryConnection;
use dbsem_core::InMemorySemaphoreStore;
use dbsem_core::NewAuditRecord;
use dbsem_core::SemaphoreName;
use dbsem_core::SlotNumber;
use dbsem_core::StoreConnection;
use dbsem_core::StoreConnector;
use dbsem_core::StoreError;
use dbsem_core::TaskId;
use dbsem_core::Timestamp;

/// Registers `slots` slots under `db` and opens a connection.
fn connected(slots: u32) -> (InMemorySemaphoreStore, InMemoryConnection) {
    let store = InMemorySemaphoreStore::new();
    store.register(&SemaphoreName::new("db"), slots).unwrap();
    let connection = store.connect(ConnectOptions::default()).unwrap();
    (store, connection)
}

#[test]
fn wait_and_signal_round_trip_usage() {
    let (store, mut connection) = connected(2);
    let name = SemaphoreName::new("db");

    let first = connection.wait(&name, AuditId::new(1), None).unwrap();
    let second = connection.wait(&name, AuditId::new(2), None).unwrap();
    assert_ne!(first, second);
    assert_eq!(connection.slot_usage(&name).unwrap().in_use, 2);
    assert_eq!(connection.slot_usage(&name).unwrap().free(), 0);

    connection.signal(&name, first).unwrap();
    connection.signal(&name, second).unwrap();
    assert_eq!(store.usage(&name).unwrap().in_use, 0);
}

#[test]
fn signal_of_free_slot_is_rejected() {
    let (_store, mut connection) = connected(1);
    let result = connection.signal(&SemaphoreName::new("db"), SlotNumber::new(1));
    assert!(matches!(result, Err(StoreError::Coordination(_))));
}

#[test]
fn wait_times_out_and_leaves_no_queue_entry() {
    let (store, mut connection) = connected(1);
    let name = SemaphoreName::new("db");
    connection.wait(&name, AuditId::new(1), None).unwrap();

    let result = connection.wait(&name, AuditId::new(2), Some(Duration::from_millis(20)));

    assert_eq!(result, Err(StoreError::Timeout(Duration::from_millis(20))));
    assert_eq!(store.queue_len(&name).unwrap(), 0);
}

#[test]
fn dequeue_frees_claim_made_for_lost_requester() {
    let (store, mut connection) = connected(1);
    let name = SemaphoreName::new("db");
    let slot = connection.wait(&name, AuditId::new(5), None).unwrap();

    assert_eq!(connection.dequeue(&name, AuditId::new(5)).unwrap(), Some(slot));
    assert_eq!(connection.dequeue(&name, AuditId::new(5)).unwrap(), None);
    assert_eq!(store.usage(&name).unwrap().in_use, 0);
}

#[test]
fn failed_wait_leaves_stale_entry_for_dequeue() {
    let (store, mut connection) = connected(1);
    let name = SemaphoreName::new("db");
    store.fail_next_waits(1).unwrap();

    assert!(matches!(connection.wait(&name, AuditId::new(9), None), Err(StoreError::Io(_))));
    assert_eq!(store.queue_len(&name).unwrap(), 1);

    connection.dequeue(&name, AuditId::new(9)).unwrap();
    assert_eq!(store.queue_len(&name).unwrap(), 0);
}

#[test]
fn uncommitted_audit_writes_are_discarded_on_rollback() {
    let (_store, mut connection) = connected(1);
    let id = connection.next_audit_id().unwrap();
    let record = NewAuditRecord {
        id,
        name: SemaphoreName::new("db"),
        task_id: TaskId::new(1),
        num_slots: 1,
        request_time: Timestamp::from_unix_millis(1_000),
    };

    connection.insert_audit(&record).unwrap();
    connection.rollback().unwrap();
    assert_eq!(connection.load_audit(id).unwrap(), None);

    connection.insert_audit(&record).unwrap();
    connection.commit().unwrap();
    assert!(connection.load_audit(id).unwrap().is_some());
}

#[test]
fn second_grant_for_same_record_is_rejected() {
    let (_store, mut connection) = connected(1);
    let id = connection.next_audit_id().unwrap();
    connection
        .insert_audit(&NewAuditRecord {
            id,
            name: SemaphoreName::new("db"),
            task_id: TaskId::new(1),
            num_slots: 1,
            request_time: Timestamp::from_unix_millis(1_000),
        })
        .unwrap();
    connection.commit().unwrap();
    let update = GrantUpdate {
        id,
        slot: SlotNumber::new(1),
        num_requests: 1,
        grant_time: Timestamp::from_unix_millis(2_000),
    };

    connection.record_grant(&update).unwrap();
    connection.commit().unwrap();
    connection.record_grant(&update).unwrap();
    assert!(matches!(connection.commit(), Err(StoreError::Invalid(_))));
}

#[test]
fn provisional_claim_is_freed_when_connection_drops() {
    let (store, _connection) = connected(1);
    let name = SemaphoreName::new("db");
    store.set_auto_commit(false).unwrap();
    let mut connection = store.connect(ConnectOptions::default()).unwrap();
    assert!(!connection.coordination_commits());

    connection.wait(&name, AuditId::new(1), None).unwrap();
    assert_eq!(store.usage(&name).unwrap().in_use, 1);
    drop(connection);

    assert_eq!(store.usage(&name).unwrap().in_use, 0);
}

#[test]
fn injected_connect_failure_is_reported() {
    let store = InMemorySemaphoreStore::new();
    store.fail_next_connects(1).unwrap();
    assert!(matches!(store.connect(ConnectOptions::default()), Err(StoreError::Connect(_))));
    assert!(store.connect(ConnectOptions::default()).is_ok());
}
