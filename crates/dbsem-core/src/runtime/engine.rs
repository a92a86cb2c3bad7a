// crates/dbsem-core/src/runtime/engine.rs
// ============================================================================
// Module: dbsem Acquisition Engine
// Description: Blocking slot acquisition with bounded retry and reconnect.
// Purpose: Drive a request from capacity lookup to a held slot handle.
// Dependencies: crate::core, crate::interfaces, crate::runtime, serde, thiserror
// ============================================================================

//! ## Overview
//! [`AcquisitionEngine::acquire`] runs the acquisition protocol on the
//! calling thread:
//!
//! 1. resolve capacity (unknown names fail before any write);
//! 2. create and commit the audit record;
//! 3. call the blocking `wait` routine on the holder connection;
//! 4. on failure, sleep `try_interval`, reconnect from scratch, dequeue the
//!    stale wait entry, and retry until `max_tries` attempts are spent;
//! 5. on success, commit the wait when the store does not, then record the
//!    grant on a separate connection.
//!
//! Exhaustion is an error by default. [`ExhaustionPolicy::DeadHandle`]
//! instead returns a handle that holds no slot, matching older callers that
//! probe [`SemaphoreHandle::is_held`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::AuditId;
use crate::core::SemaphoreName;
use crate::core::SlotNumber;
use crate::core::TaskId;
use crate::interfaces::ConnectOptions;
use crate::interfaces::StoreConnection;
use crate::interfaces::StoreConnector;
use crate::interfaces::StoreError;
use crate::runtime::audit::open_audit;
use crate::runtime::audit::record_attempts;
use crate::runtime::audit::record_grant;
use crate::runtime::capacity::CapacityError;
use crate::runtime::capacity::resolve_capacity;
use crate::runtime::events::NoopEventSink;
use crate::runtime::events::SemaphoreEvent;
use crate::runtime::events::SemaphoreEventKind;
use crate::runtime::events::SemaphoreEventSink;
use crate::runtime::handle::HandleParts;
use crate::runtime::handle::SemaphoreHandle;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default number of wait attempts.
pub const DEFAULT_MAX_TRIES: u32 = 5;
/// Default delay between wait attempts.
pub const DEFAULT_TRY_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// SECTION: Config
// ============================================================================

/// Retry policy validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryPolicyError {
    /// `max_tries` was zero.
    #[error("max_tries must be greater than zero")]
    ZeroTries,
}

/// Bounded retry policy for wait attempts.
///
/// # Invariants
/// - `max_tries` is at least one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum wait attempts, counting the first.
    max_tries: u32,
    /// Fixed delay after each failed attempt.
    try_interval: Duration,
}

impl RetryPolicy {
    /// Creates a retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`RetryPolicyError::ZeroTries`] when `max_tries` is zero.
    pub const fn new(max_tries: u32, try_interval: Duration) -> Result<Self, RetryPolicyError> {
        if max_tries == 0 {
            return Err(RetryPolicyError::ZeroTries);
        }
        Ok(Self {
            max_tries,
            try_interval,
        })
    }

    /// Returns the maximum number of wait attempts.
    #[must_use]
    pub const fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// Returns the delay between attempts.
    #[must_use]
    pub const fn try_interval(&self) -> Duration {
        self.try_interval
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_MAX_TRIES,
            try_interval: DEFAULT_TRY_INTERVAL,
        }
    }
}

/// Outcome when every wait attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Return [`AcquireError::Exhausted`].
    #[default]
    Error,
    /// Return a handle holding no slot.
    DeadHandle,
}

/// Acquisition engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcquisitionConfig {
    /// Retry policy for wait attempts.
    pub retry: RetryPolicy,
    /// Behavior when attempts are exhausted.
    pub on_exhausted: ExhaustionPolicy,
    /// Open connections in thread-safe mode.
    pub threaded: bool,
}

// ============================================================================
// SECTION: Requests and Errors
// ============================================================================

/// Request for one slot of a semaphore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireRequest {
    /// Semaphore name.
    pub name: SemaphoreName,
    /// Requesting task.
    pub task_id: TaskId,
    /// Optional bound on the whole acquisition.
    pub timeout: Option<Duration>,
}

impl AcquireRequest {
    /// Creates a request without a timeout.
    #[must_use]
    pub fn new(name: impl Into<SemaphoreName>, task_id: TaskId) -> Self {
        Self {
            name: name.into(),
            task_id,
            timeout: None,
        }
    }

    /// Bounds the acquisition by `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Acquisition errors surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    /// Name has no registered slots; nothing was written.
    #[error("unknown semaphore {name}: no slots registered")]
    UnknownSemaphore {
        /// Semaphore name.
        name: SemaphoreName,
    },
    /// Every wait attempt failed.
    #[error("acquisition of semaphore {name} exhausted after {attempts} attempts")]
    Exhausted {
        /// Semaphore name.
        name: SemaphoreName,
        /// Attempts consumed.
        attempts: u32,
    },
    /// Caller timeout elapsed before a grant.
    #[error("acquisition of semaphore {name} timed out after {attempts} attempts ({elapsed:?})")]
    TimedOut {
        /// Semaphore name.
        name: SemaphoreName,
        /// Attempts consumed.
        attempts: u32,
        /// Time spent.
        elapsed: Duration,
    },
    /// Store failure outside the retried wait loop.
    #[error("store failure acquiring semaphore {name}: {source}")]
    Store {
        /// Semaphore name.
        name: SemaphoreName,
        /// Underlying store error.
        source: StoreError,
    },
}

/// Terminal result of the wait loop.
enum WaitOutcome {
    /// Slot granted at the given attempt.
    Granted {
        /// Granted slot.
        slot: SlotNumber,
        /// Attempt index at grant.
        attempt: u32,
    },
    /// All attempts failed.
    Exhausted,
    /// Caller deadline reached after the given number of attempts.
    TimedOut {
        /// Attempts consumed.
        attempts: u32,
    },
}

// ============================================================================
// SECTION: Engine
// ============================================================================

/// Runs the acquisition protocol against a store connector.
#[derive(Clone)]
pub struct AcquisitionEngine<C: StoreConnector> {
    /// Store connector used for every connection.
    connector: C,
    /// Engine configuration.
    config: AcquisitionConfig,
    /// Event sink.
    events: Arc<dyn SemaphoreEventSink>,
}

impl<C: StoreConnector> AcquisitionEngine<C> {
    /// Creates an engine that discards events.
    #[must_use]
    pub fn new(connector: C, config: AcquisitionConfig) -> Self {
        Self {
            connector,
            config,
            events: Arc::new(NoopEventSink),
        }
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn SemaphoreEventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the engine configuration.
    #[must_use]
    pub const fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Returns the store connector.
    #[must_use]
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// Acquires a slot, recording the grant on a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError`] when the name is unknown, attempts are
    /// exhausted (under [`ExhaustionPolicy::Error`]), the timeout elapses, or
    /// the store fails outside the retried wait.
    pub fn acquire(
        &self,
        request: &AcquireRequest,
    ) -> Result<SemaphoreHandle<C::Connection>, AcquireError> {
        self.acquire_inner(request, None)
    }

    /// Acquires a slot, recording the grant on a caller-owned connection.
    ///
    /// `bookkeeping` must not be shared with another handle's wait.
    ///
    /// # Errors
    ///
    /// Same as [`AcquisitionEngine::acquire`].
    pub fn acquire_using(
        &self,
        request: &AcquireRequest,
        bookkeeping: &mut C::Connection,
    ) -> Result<SemaphoreHandle<C::Connection>, AcquireError> {
        self.acquire_inner(request, Some(bookkeeping))
    }

    /// Acquires a slot, runs `work`, and releases the slot on every exit
    /// path, including unwinding out of `work`.
    ///
    /// # Errors
    ///
    /// Same as [`AcquisitionEngine::acquire`].
    pub fn with_semaphore<T>(
        &self,
        request: &AcquireRequest,
        work: impl FnOnce(&SemaphoreHandle<C::Connection>) -> T,
    ) -> Result<T, AcquireError> {
        let mut handle = self.acquire(request)?;
        let value = work(&handle);
        handle.release();
        Ok(value)
    }

    /// Shared acquisition path.
    fn acquire_inner(
        &self,
        request: &AcquireRequest,
        mut bookkeeping: Option<&mut C::Connection>,
    ) -> Result<SemaphoreHandle<C::Connection>, AcquireError> {
        let started = Instant::now();
        let deadline = request.timeout.map(|timeout| started + timeout);
        let name = &request.name;
        let task_id = request.task_id;
        let store_error = |source: StoreError| AcquireError::Store {
            name: name.clone(),
            source,
        };

        let mut connection = self.connector.connect(self.connect_options()).map_err(store_error)?;
        let capacity = match resolve_capacity(&mut connection, name) {
            Ok(capacity) => capacity,
            Err(error) => {
                let _ = connection.close();
                return Err(match error {
                    CapacityError::UnknownSemaphore(_) => {
                        self.events.record(&SemaphoreEvent::new(
                            SemaphoreEventKind::UnknownSemaphore,
                            name,
                            task_id,
                        ));
                        AcquireError::UnknownSemaphore {
                            name: name.clone(),
                        }
                    }
                    CapacityError::Store(source) => store_error(source),
                });
            }
        };
        let audit_id = match open_audit(&mut connection, name, task_id, capacity) {
            Ok(audit_id) => audit_id,
            Err(source) => {
                let _ = connection.close();
                return Err(store_error(source));
            }
        };
        let tracker = EventTracker {
            events: self.events.as_ref(),
            name,
            task_id,
            audit_id,
        };
        tracker.emit(SemaphoreEvent::new(SemaphoreEventKind::Requested, name, task_id));

        let mut current = Some(connection);
        let outcome = self.wait_loop(&tracker, &mut current, deadline);

        match outcome {
            WaitOutcome::Granted {
                slot,
                attempt,
            } => {
                let mut handle = SemaphoreHandle::from_parts(HandleParts {
                    name: name.clone(),
                    task_id,
                    audit_id,
                    capacity,
                    attempts: attempt,
                    slot: Some(slot),
                    connection: current,
                    events: Arc::clone(&self.events),
                });
                tracker.emit(
                    SemaphoreEvent::new(SemaphoreEventKind::Granted, name, task_id)
                        .with_attempt(attempt)
                        .with_slot(slot),
                );
                let recorded = self.with_bookkeeping(bookkeeping.as_deref_mut(), |conn| {
                    record_grant(conn, audit_id, slot, attempt)
                });
                if let Err(source) = recorded {
                    tracker.emit(
                        SemaphoreEvent::new(SemaphoreEventKind::BookkeepingFailed, name, task_id)
                            .with_slot(slot)
                            .with_error(&source),
                    );
                    handle.release();
                    return Err(store_error(source));
                }
                Ok(handle)
            }
            WaitOutcome::Exhausted => {
                let attempts = self.config.retry.max_tries();
                self.record_failed_attempts(&tracker, bookkeeping, attempts);
                tracker.emit(
                    SemaphoreEvent::new(SemaphoreEventKind::Exhausted, name, task_id)
                        .with_attempt(attempts),
                );
                match self.config.on_exhausted {
                    ExhaustionPolicy::Error => {
                        close_quietly(current);
                        Err(AcquireError::Exhausted {
                            name: name.clone(),
                            attempts,
                        })
                    }
                    ExhaustionPolicy::DeadHandle => {
                        Ok(SemaphoreHandle::from_parts(HandleParts {
                            name: name.clone(),
                            task_id,
                            audit_id,
                            capacity,
                            attempts,
                            slot: None,
                            connection: current,
                            events: Arc::clone(&self.events),
                        }))
                    }
                }
            }
            WaitOutcome::TimedOut {
                attempts,
            } => {
                self.record_failed_attempts(&tracker, bookkeeping, attempts);
                tracker.emit(
                    SemaphoreEvent::new(SemaphoreEventKind::TimedOut, name, task_id)
                        .with_attempt(attempts),
                );
                close_quietly(current);
                Err(AcquireError::TimedOut {
                    name: name.clone(),
                    attempts,
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    /// Runs wait attempts until a grant, exhaustion, or the deadline.
    fn wait_loop(
        &self,
        tracker: &EventTracker<'_>,
        current: &mut Option<C::Connection>,
        deadline: Option<Instant>,
    ) -> WaitOutcome {
        let interval = self.config.retry.try_interval();
        let mut attempt: u32 = 1;
        loop {
            let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            let result = match current.as_mut() {
                Some(connection) => {
                    tracker.emit(
                        SemaphoreEvent::new(SemaphoreEventKind::WaitStarted, tracker.name, tracker.task_id)
                            .with_attempt(attempt),
                    );
                    wait_once(connection, tracker.name, tracker.audit_id, remaining)
                }
                None => Err(StoreError::Connect("no live connection".to_string())),
            };
            let error = match result {
                Ok(slot) => {
                    return WaitOutcome::Granted {
                        slot,
                        attempt,
                    };
                }
                Err(error) => error,
            };
            tracker.emit(
                SemaphoreEvent::new(SemaphoreEventKind::WaitFailed, tracker.name, tracker.task_id)
                    .with_attempt(attempt)
                    .with_error(&error),
            );
            if let Some(deadline) = deadline
                && Instant::now() + interval >= deadline
            {
                self.reconnect_and_dequeue(tracker, current, attempt);
                return WaitOutcome::TimedOut {
                    attempts: attempt,
                };
            }
            thread::sleep(interval);
            self.reconnect_and_dequeue(tracker, current, attempt);
            attempt += 1;
            if attempt > self.config.retry.max_tries() {
                return WaitOutcome::Exhausted;
            }
        }
    }

    /// Replaces the connection and removes the stale wait entry.
    fn reconnect_and_dequeue(
        &self,
        tracker: &EventTracker<'_>,
        current: &mut Option<C::Connection>,
        attempt: u32,
    ) {
        close_quietly(current.take());
        let mut connection = match self.connector.connect(self.connect_options()) {
            Ok(connection) => connection,
            Err(error) => {
                tracker.emit(
                    SemaphoreEvent::new(
                        SemaphoreEventKind::ReconnectFailed,
                        tracker.name,
                        tracker.task_id,
                    )
                    .with_attempt(attempt)
                    .with_error(&error),
                );
                return;
            }
        };
        tracker.emit(
            SemaphoreEvent::new(SemaphoreEventKind::Reconnected, tracker.name, tracker.task_id)
                .with_attempt(attempt),
        );
        match connection.dequeue(tracker.name, tracker.audit_id) {
            Ok(freed) => {
                let mut event =
                    SemaphoreEvent::new(SemaphoreEventKind::Dequeued, tracker.name, tracker.task_id)
                        .with_attempt(attempt);
                if let Some(slot) = freed {
                    event = event.with_slot(slot);
                }
                tracker.emit(event);
            }
            Err(error) => {
                tracker.emit(
                    SemaphoreEvent::new(SemaphoreEventKind::WaitFailed, tracker.name, tracker.task_id)
                        .with_attempt(attempt)
                        .with_error(&error),
                );
            }
        }
        *current = Some(connection);
    }

    /// Stores the attempt count of a failed acquisition, best effort.
    fn record_failed_attempts(
        &self,
        tracker: &EventTracker<'_>,
        bookkeeping: Option<&mut C::Connection>,
        attempts: u32,
    ) {
        let audit_id = tracker.audit_id;
        if let Err(error) =
            self.with_bookkeeping(bookkeeping, |conn| record_attempts(conn, audit_id, attempts))
        {
            tracker.emit(
                SemaphoreEvent::new(
                    SemaphoreEventKind::BookkeepingFailed,
                    tracker.name,
                    tracker.task_id,
                )
                .with_error(&error),
            );
        }
    }

    /// Runs `write` on the caller's bookkeeping connection or a fresh one.
    fn with_bookkeeping(
        &self,
        bookkeeping: Option<&mut C::Connection>,
        write: impl FnOnce(&mut C::Connection) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        if let Some(connection) = bookkeeping {
            return write(connection);
        }
        let mut connection = self.connector.connect(self.connect_options())?;
        let result = write(&mut connection);
        close_quietly(Some(connection));
        result
    }

    /// Returns the connect options derived from the configuration.
    const fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            threaded: self.config.threaded,
        }
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Identity of one acquisition, used to tag events.
struct EventTracker<'a> {
    /// Event sink.
    events: &'a dyn SemaphoreEventSink,
    /// Semaphore name.
    name: &'a SemaphoreName,
    /// Requesting task.
    task_id: TaskId,
    /// Audit record.
    audit_id: AuditId,
}

impl EventTracker<'_> {
    /// Emits an event tagged with the audit id.
    fn emit(&self, event: SemaphoreEvent) {
        self.events.record(&event.with_audit_id(self.audit_id));
    }
}

/// Performs one wait attempt, committing when the store does not.
fn wait_once<Conn: StoreConnection>(
    connection: &mut Conn,
    name: &SemaphoreName,
    requester: AuditId,
    timeout: Option<Duration>,
) -> Result<SlotNumber, StoreError> {
    let slot = connection.wait(name, requester, timeout)?;
    if !connection.coordination_commits() {
        connection.commit()?;
    }
    Ok(slot)
}

/// Closes a connection, ignoring close errors.
fn close_quietly<Conn: StoreConnection>(connection: Option<Conn>) {
    if let Some(connection) = connection {
        let _ = connection.close();
    }
}
