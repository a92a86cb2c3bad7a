// crates/dbsem-core/tests/acquisition.rs
// ============================================================================
// Module: Acquisition Tests
// Description: Capacity, audit lifecycle, and release guard behavior.
// Purpose: Validate the acquisition protocol against the in-memory store.
// ============================================================================
//! ## Overview
//! Drives [`AcquisitionEngine`] against [`InMemorySemaphoreStore`] and checks
//! the slot table, the audit trail, and the release guard.

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

use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use dbsem_core::AcquireError;
use dbsem_core::AcquireRequest;
use dbsem_core::AcquisitionConfig;
use dbsem_core::AcquisitionEngine;
use dbsem_core::AuditId;
use dbsem_core::AuditStage;
use dbsem_core::ConnectOptions;
use dbsem_core::InMemoryEventSink;
use dbsem_core::InMemorySemaphoreStore;
use dbsem_core::ReleaseOutcome;
use dbsem_core::RetryPolicy;
use dbsem_core::SemaphoreEventKind;
use dbsem_core::SemaphoreName;
use dbsem_core::SlotNumber;
use dbsem_core::StoreConnection;
use dbsem_core::StoreConnector;
use dbsem_core::TaskId;

/// Builds an engine with a short retry interval over a store with `slots`
/// slots registered under `name`.
fn engine_with(name: &str, slots: u32) -> (InMemorySemaphoreStore, AcquisitionEngine<InMemorySemaphoreStore>) {
    let store = InMemorySemaphoreStore::new();
    store.register(&SemaphoreName::new(name), slots).unwrap();
    let config = AcquisitionConfig {
        retry: RetryPolicy::new(5, Duration::from_millis(20)).unwrap(),
        ..AcquisitionConfig::default()
    };
    (store.clone(), AcquisitionEngine::new(store, config))
}

#[test]
fn acquire_grants_slot_within_capacity() {
    let (store, engine) = engine_with("db", 3);
    let mut handle = engine.acquire(&AcquireRequest::new("db", TaskId::new(7))).unwrap();

    assert!(handle.is_held());
    assert_eq!(handle.capacity().get(), 3);
    assert_eq!(handle.attempts(), 1);
    assert_eq!(handle.task_id(), TaskId::new(7));
    let slot = handle.slot().unwrap();
    assert!((1 ..= 3).contains(&slot.get()));
    assert_eq!(store.usage(&SemaphoreName::new("db")).unwrap().in_use, 1);

    assert_eq!(handle.release(), ReleaseOutcome::Released(slot));
    assert_eq!(store.usage(&SemaphoreName::new("db")).unwrap().in_use, 0);
}

#[test]
fn unknown_semaphore_fails_without_side_effects() {
    let (store, engine) = engine_with("db", 1);
    let sink = Arc::new(InMemoryEventSink::new());
    let engine = engine.with_events(sink.clone());

    let error = engine.acquire(&AcquireRequest::new("missing", TaskId::new(1))).unwrap_err();

    assert_eq!(
        error,
        AcquireError::UnknownSemaphore {
            name: SemaphoreName::new("missing"),
        }
    );
    let counters = store.counters().unwrap();
    assert_eq!(counters.waits, 0);
    assert_eq!(counters.audit_inserts, 0);
    assert!(store.audit_records(&SemaphoreName::new("missing")).unwrap().is_empty());
    assert_eq!(sink.kinds(), vec![SemaphoreEventKind::UnknownSemaphore]);
}

#[test]
fn audit_record_tracks_request_grant_and_release() {
    let (store, engine) = engine_with("db", 2);
    let name = SemaphoreName::new("db");
    let mut handle = engine.acquire(&AcquireRequest::new("db", TaskId::new(42))).unwrap();

    let records = store.audit_records(&name).unwrap();
    assert_eq!(records.len(), 1);
    let granted = &records[0];
    assert_eq!(granted.id, handle.audit_id());
    assert_eq!(granted.task_id, TaskId::new(42));
    assert_eq!(granted.num_slots, 2);
    assert_eq!(granted.stage(), AuditStage::Granted);
    assert_eq!(granted.num_requests, Some(1));
    assert_eq!(granted.slot, handle.slot());
    assert!(granted.grant_time.unwrap() >= granted.request_time);
    assert!(granted.release_time.is_none());

    handle.release();

    let released = &store.audit_records(&name).unwrap()[0];
    assert_eq!(released.stage(), AuditStage::Released);
    assert!(released.release_time.unwrap() >= released.grant_time.unwrap());
}

#[test]
fn release_is_idempotent_and_drop_is_silent_after_release() {
    let (store, engine) = engine_with("db", 1);
    let mut handle = engine.acquire(&AcquireRequest::new("db", TaskId::new(1))).unwrap();

    assert!(matches!(handle.release(), ReleaseOutcome::Released(_)));
    let after_first = store.counters().unwrap();

    assert_eq!(handle.release(), ReleaseOutcome::NotHeld);
    drop(handle);

    let after_drop = store.counters().unwrap();
    assert_eq!(after_first, after_drop);
    assert_eq!(after_drop.signals, 1);
}

#[test]
fn dropping_handle_releases_slot() {
    let (store, engine) = engine_with("db", 1);
    let name = SemaphoreName::new("db");
    {
        let handle = engine.acquire(&AcquireRequest::new("db", TaskId::new(1))).unwrap();
        assert!(handle.is_held());
        assert_eq!(store.usage(&name).unwrap().in_use, 1);
    }
    assert_eq!(store.usage(&name).unwrap().in_use, 0);
    assert_eq!(store.audit_records(&name).unwrap()[0].stage(), AuditStage::Released);
}

#[test]
fn concurrent_holders_never_exceed_capacity() {
    let (store, engine) = engine_with("pool", 2);
    let name = SemaphoreName::new("pool");

    let workers: Vec<_> = (0 .. 8)
        .map(|task| {
            let engine = engine.clone();
            thread::spawn(move || {
                let handle = engine.acquire(&AcquireRequest::new("pool", TaskId::new(task))).unwrap();
                thread::sleep(Duration::from_millis(15));
                drop(handle);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(store.high_water(&name).unwrap() <= 2);
    assert_eq!(store.usage(&name).unwrap().in_use, 0);
    assert_eq!(store.queue_len(&name).unwrap(), 0);
    let records = store.audit_records(&name).unwrap();
    assert_eq!(records.len(), 8);
    assert!(records.iter().all(|record| record.stage() == AuditStage::Released));
}

#[test]
fn waiters_are_granted_in_arrival_order() {
    let (store, engine) = engine_with("fifo", 1);
    let name = SemaphoreName::new("fifo");
    let order = Arc::new(Mutex::new(Vec::new()));
    let holder = engine.acquire(&AcquireRequest::new("fifo", TaskId::new(0))).unwrap();

    let mut workers = Vec::new();
    for task in 1 ..= 2 {
        let engine = engine.clone();
        let order = Arc::clone(&order);
        workers.push(thread::spawn(move || {
            let handle = engine.acquire(&AcquireRequest::new("fifo", TaskId::new(task))).unwrap();
            order.lock().unwrap().push(task);
            thread::sleep(Duration::from_millis(10));
            drop(handle);
        }));
        let queued = usize::try_from(task).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.queue_len(&name).unwrap() < queued {
            assert!(Instant::now() < deadline, "waiter {task} never queued");
            thread::sleep(Duration::from_millis(1));
        }
    }
    drop(holder);
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
}

#[test]
fn released_slot_is_reused() {
    let (store, engine) = engine_with("db", 1);
    let name = SemaphoreName::new("db");
    let first = engine.acquire(&AcquireRequest::new("db", TaskId::new(1))).unwrap();
    let slot = first.slot();
    drop(first);
    let second = engine.acquire(&AcquireRequest::new("db", TaskId::new(2))).unwrap();
    assert_eq!(second.slot(), slot);
    assert_eq!(store.usage(&name).unwrap().in_use, 1);
}

#[test]
fn grant_is_recorded_on_caller_connection() {
    let (store, engine) = engine_with("db", 1);
    let mut bookkeeping = store.connect(ConnectOptions::default()).unwrap();

    let handle = engine
        .acquire_using(&AcquireRequest::new("db", TaskId::new(3)), &mut bookkeeping)
        .unwrap();

    let record = bookkeeping.load_audit(handle.audit_id()).unwrap().unwrap();
    assert_eq!(record.stage(), AuditStage::Granted);
    assert_eq!(store.counters().unwrap().connects, 2);
}

#[test]
fn store_without_auto_commit_is_committed_after_wait() {
    let (store, engine) = engine_with("db", 1);
    store.set_auto_commit(false).unwrap();
    let name = SemaphoreName::new("db");

    let handle = engine.acquire(&AcquireRequest::new("db", TaskId::new(1))).unwrap();
    assert_eq!(store.usage(&name).unwrap().in_use, 1);
    drop(handle);
    assert_eq!(store.usage(&name).unwrap().in_use, 0);

    let mut connection = store.connect(ConnectOptions::default()).unwrap();
    let slot = connection.wait(&name, AuditId::new(999), None).unwrap();
    assert_eq!(slot, SlotNumber::new(1));
    connection.close().unwrap();
    assert_eq!(store.usage(&name).unwrap().in_use, 0);
}

#[test]
fn with_semaphore_releases_after_work_and_after_panic() {
    let (store, engine) = engine_with("db", 1);
    let name = SemaphoreName::new("db");

    let in_use = engine
        .with_semaphore(&AcquireRequest::new("db", TaskId::new(1)), |handle| {
            assert!(handle.is_held());
            store.usage(&name).unwrap().in_use
        })
        .unwrap();
    assert_eq!(in_use, 1);
    assert_eq!(store.usage(&name).unwrap().in_use, 0);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        engine.with_semaphore(&AcquireRequest::new("db", TaskId::new(2)), |_| -> u32 {
            panic!("work failed")
        })
    }));
    assert!(result.is_err());
    assert_eq!(store.usage(&name).unwrap().in_use, 0);
}

#[test]
fn failed_signal_is_reported_not_raised() {
    let (store, engine) = engine_with("db", 1);
    let sink = Arc::new(InMemoryEventSink::new());
    let engine = engine.with_events(sink.clone());
    let mut handle = engine.acquire(&AcquireRequest::new("db", TaskId::new(1))).unwrap();
    let slot = handle.slot().unwrap();
    store.fail_next_signals(1).unwrap();

    match handle.release() {
        ReleaseOutcome::Failed {
            slot: failed,
            ..
        } => assert_eq!(failed, slot),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!handle.is_held());
    assert_eq!(handle.release(), ReleaseOutcome::NotHeld);
    assert!(sink.kinds().contains(&SemaphoreEventKind::ReleaseFailed));
}

#[test]
fn successful_acquisition_emits_lifecycle_events() {
    let (_store, engine) = engine_with("db", 1);
    let sink = Arc::new(InMemoryEventSink::new());
    let engine = engine.with_events(sink.clone());

    let handle = engine.acquire(&AcquireRequest::new("db", TaskId::new(1))).unwrap();
    let audit_id = handle.audit_id();
    assert_eq!(handle.to_string(), format!("{{name: db, slot: {}}}", handle.slot().unwrap()));
    drop(handle);

    assert_eq!(
        sink.kinds(),
        vec![
            SemaphoreEventKind::Requested,
            SemaphoreEventKind::WaitStarted,
            SemaphoreEventKind::Granted,
            SemaphoreEventKind::Released,
        ]
    );
    assert!(sink.events().iter().all(|event| event.audit_id == Some(audit_id)));
}
