// crates/dbsem-core/tests/retry.rs
// ============================================================================
// Module: Retry Tests
// Description: Bounded retry, reconnect, dequeue, exhaustion, and timeout.
// Purpose: Validate recovery from failed waits with injected faults.
// ============================================================================
//! ## Overview
//! Injects connection failures into [`InMemorySemaphoreStore`] and checks
//! attempt accounting, retry timing, stale wait cleanup, and the exhaustion
//! policies.

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

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use dbsem_core::AcquireError;
use dbsem_core::AcquireRequest;
use dbsem_core::AcquisitionConfig;
use dbsem_core::AcquisitionEngine;
use dbsem_core::AuditStage;
use dbsem_core::ExhaustionPolicy;
use dbsem_core::InMemoryEventSink;
use dbsem_core::InMemorySemaphoreStore;
use dbsem_core::ReleaseOutcome;
use dbsem_core::RetryPolicy;
use dbsem_core::RetryPolicyError;
use dbsem_core::SemaphoreEvent;
use dbsem_core::SemaphoreEventKind;
use dbsem_core::SemaphoreEventSink;
use dbsem_core::SemaphoreName;
use dbsem_core::TaskId;

/// Retry interval, wide enough that scheduling jitter stays inside one step.
const INTERVAL: Duration = Duration::from_millis(200);

/// Creates a store with one semaphore of `slots` slots.
fn store_with(name: &str, slots: u32) -> InMemorySemaphoreStore {
    let store = InMemorySemaphoreStore::new();
    store.register(&SemaphoreName::new(name), slots).unwrap();
    store
}

/// Builds a config with the test retry interval.
fn config(max_tries: u32, on_exhausted: ExhaustionPolicy) -> AcquisitionConfig {
    AcquisitionConfig {
        retry: RetryPolicy::new(max_tries, INTERVAL).unwrap(),
        on_exhausted,
        threaded: false,
    }
}

#[test]
fn retry_policy_rejects_zero_tries() {
    assert_eq!(RetryPolicy::new(0, INTERVAL), Err(RetryPolicyError::ZeroTries));
    let defaults = RetryPolicy::default();
    assert_eq!(defaults.max_tries(), 5);
    assert_eq!(defaults.try_interval(), Duration::from_secs(10));
}

#[test]
fn single_failure_is_retried_after_dequeue() {
    let store = store_with("db", 1);
    let name = SemaphoreName::new("db");
    store.fail_next_waits(1).unwrap();
    let engine = AcquisitionEngine::new(store.clone(), config(5, ExhaustionPolicy::Error));

    let started = Instant::now();
    let handle = engine.acquire(&AcquireRequest::new("db", TaskId::new(1))).unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= INTERVAL, "elapsed {elapsed:?}");
    assert!(elapsed < INTERVAL * 2, "elapsed {elapsed:?}");
    assert_eq!(handle.attempts(), 2);
    let record = &store.audit_records(&name).unwrap()[0];
    assert_eq!(record.num_requests, Some(2));
    assert_eq!(record.stage(), AuditStage::Granted);
    let counters = store.counters().unwrap();
    assert_eq!(counters.waits, 2);
    assert_eq!(counters.dequeues, 1);
    assert_eq!(store.queue_len(&name).unwrap(), 0);
}

#[test]
fn exhaustion_returns_error_after_all_attempts() {
    let store = store_with("db", 1);
    let name = SemaphoreName::new("db");
    store.fail_all_waits(true).unwrap();
    let sink = Arc::new(InMemoryEventSink::new());
    let engine = AcquisitionEngine::new(store.clone(), config(3, ExhaustionPolicy::Error))
        .with_events(sink.clone());

    let started = Instant::now();
    let error = engine.acquire(&AcquireRequest::new("db", TaskId::new(1))).unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(
        error,
        AcquireError::Exhausted {
            name: name.clone(),
            attempts: 3,
        }
    );
    assert!(elapsed >= INTERVAL * 3, "elapsed {elapsed:?}");
    assert!(elapsed < INTERVAL * 4, "elapsed {elapsed:?}");
    let counters = store.counters().unwrap();
    assert_eq!(counters.waits, 3);
    assert_eq!(counters.dequeues, 3);
    assert_eq!(counters.signals, 0);
    assert_eq!(store.queue_len(&name).unwrap(), 0);
    let record = &store.audit_records(&name).unwrap()[0];
    assert_eq!(record.stage(), AuditStage::Requested);
    assert_eq!(record.num_requests, Some(3));
    assert_eq!(sink.kinds().last(), Some(&SemaphoreEventKind::Exhausted));
}

#[test]
fn exhaustion_can_return_dead_handle() {
    let store = store_with("db", 1);
    store.fail_all_waits(true).unwrap();
    let engine = AcquisitionEngine::new(store.clone(), config(2, ExhaustionPolicy::DeadHandle));

    let mut handle = engine.acquire(&AcquireRequest::new("db", TaskId::new(1))).unwrap();

    assert!(!handle.is_held());
    assert_eq!(handle.slot(), None);
    assert_eq!(handle.attempts(), 2);
    assert_eq!(handle.to_string(), "{name: db, slot: none}");
    assert_eq!(handle.release(), ReleaseOutcome::NotHeld);
    assert_eq!(store.counters().unwrap().signals, 0);
}

#[test]
fn recovered_wait_after_exhausted_faults_clear() {
    let store = store_with("db", 1);
    store.fail_next_waits(2).unwrap();
    let engine = AcquisitionEngine::new(store.clone(), config(3, ExhaustionPolicy::Error));

    let handle = engine.acquire(&AcquireRequest::new("db", TaskId::new(1))).unwrap();
    assert_eq!(handle.attempts(), 3);
}

/// Sink that fails the next connect once the first wait has failed.
struct FailReconnectOnce {
    /// Store to inject into.
    store: InMemorySemaphoreStore,
    /// Set after injection.
    fired: AtomicBool,
    /// Recorded events.
    inner: InMemoryEventSink,
}

impl SemaphoreEventSink for FailReconnectOnce {
    fn record(&self, event: &SemaphoreEvent) {
        if event.event == SemaphoreEventKind::WaitFailed && !self.fired.swap(true, Ordering::SeqCst) {
            self.store.fail_next_connects(1).unwrap();
        }
        self.inner.record(event);
    }
}

#[test]
fn failed_reconnect_counts_as_attempt() {
    let store = store_with("db", 1);
    store.fail_next_waits(1).unwrap();
    let sink = Arc::new(FailReconnectOnce {
        store: store.clone(),
        fired: AtomicBool::new(false),
        inner: InMemoryEventSink::new(),
    });
    let engine = AcquisitionEngine::new(store.clone(), config(5, ExhaustionPolicy::Error))
        .with_events(sink.clone());

    let handle = engine.acquire(&AcquireRequest::new("db", TaskId::new(1))).unwrap();

    assert_eq!(handle.attempts(), 3);
    let kinds = sink.inner.kinds();
    assert!(kinds.contains(&SemaphoreEventKind::ReconnectFailed));
    assert!(kinds.contains(&SemaphoreEventKind::Dequeued));
    assert_eq!(store.queue_len(&SemaphoreName::new("db")).unwrap(), 0);
}

#[test]
fn caller_timeout_bounds_blocked_wait() {
    let store = store_with("db", 1);
    let name = SemaphoreName::new("db");
    let engine = AcquisitionEngine::new(
        store.clone(),
        AcquisitionConfig {
            retry: RetryPolicy::new(5, Duration::from_secs(10)).unwrap(),
            ..AcquisitionConfig::default()
        },
    );
    let holder = engine.acquire(&AcquireRequest::new("db", TaskId::new(1))).unwrap();

    let started = Instant::now();
    let error = engine
        .acquire(&AcquireRequest::new("db", TaskId::new(2)).with_timeout(Duration::from_millis(100)))
        .unwrap_err();
    let elapsed = started.elapsed();

    match error {
        AcquireError::TimedOut {
            attempts,
            ..
        } => assert_eq!(attempts, 1),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(5));
    assert!(holder.is_held());
    assert_eq!(store.queue_len(&name).unwrap(), 0);
    let records = store.audit_records(&name).unwrap();
    let timed_out = records.iter().find(|record| record.task_id == TaskId::new(2)).unwrap();
    assert_eq!(timed_out.stage(), AuditStage::Requested);
    assert_eq!(timed_out.num_requests, Some(1));
}
