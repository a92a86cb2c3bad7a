// crates/dbsem-core/src/runtime/events.rs
// ============================================================================
// Module: dbsem Semaphore Events
// Description: Structured events for acquisition and release.
// Purpose: Emit JSON-line logs of the protocol without a logging framework.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! Every state transition of the acquisition engine and release guard is
//! reported as a [`SemaphoreEvent`] to a [`SemaphoreEventSink`]. Sinks write
//! one JSON object per line, so deployments can route them into whatever log
//! pipeline they run. Write failures inside sinks are ignored.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;

use crate::core::AuditId;
use crate::core::SemaphoreName;
use crate::core::SlotNumber;
use crate::core::TaskId;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    /// Routine protocol progress.
    #[default]
    Debug,
    /// Failures, including ones handled internally.
    Error,
}

/// Event classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemaphoreEventKind {
    /// Name has no registered slots.
    UnknownSemaphore,
    /// Audit record created.
    Requested,
    /// Blocking wait issued.
    WaitStarted,
    /// Slot granted.
    Granted,
    /// Wait attempt failed.
    WaitFailed,
    /// Fresh connection established after a failure.
    Reconnected,
    /// Fresh connection could not be established.
    ReconnectFailed,
    /// Stale wait entry removed.
    Dequeued,
    /// All attempts consumed.
    Exhausted,
    /// Caller timeout reached.
    TimedOut,
    /// Audit bookkeeping write failed.
    BookkeepingFailed,
    /// Slot released.
    Released,
    /// Release or connection close failed.
    ReleaseFailed,
}

impl SemaphoreEventKind {
    /// Returns the level this kind is logged at.
    #[must_use]
    pub const fn level(self) -> EventLevel {
        match self {
            Self::UnknownSemaphore
            | Self::WaitFailed
            | Self::ReconnectFailed
            | Self::Exhausted
            | Self::TimedOut
            | Self::BookkeepingFailed
            | Self::ReleaseFailed => EventLevel::Error,
            Self::Requested
            | Self::WaitStarted
            | Self::Granted
            | Self::Reconnected
            | Self::Dequeued
            | Self::Released => EventLevel::Debug,
        }
    }
}

/// Semaphore event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SemaphoreEvent {
    /// Event classification.
    pub event: SemaphoreEventKind,
    /// Event severity.
    pub level: EventLevel,
    /// Event timestamp (milliseconds since epoch).
    pub timestamp_ms: u128,
    /// Semaphore name.
    pub semaphore: SemaphoreName,
    /// Requesting task.
    pub task_id: TaskId,
    /// Audit record, once created.
    pub audit_id: Option<AuditId>,
    /// Attempt index, when relevant.
    pub attempt: Option<u32>,
    /// Slot, when relevant.
    pub slot: Option<SlotNumber>,
    /// Error text, when relevant.
    pub error: Option<String>,
}

impl SemaphoreEvent {
    /// Builds an event stamped with the current time.
    #[must_use]
    pub fn new(event: SemaphoreEventKind, semaphore: &SemaphoreName, task_id: TaskId) -> Self {
        let timestamp_ms =
            SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0);
        Self {
            event,
            level: event.level(),
            timestamp_ms,
            semaphore: semaphore.clone(),
            task_id,
            audit_id: None,
            attempt: None,
            slot: None,
            error: None,
        }
    }

    /// Attaches the audit record id.
    #[must_use]
    pub const fn with_audit_id(mut self, audit_id: AuditId) -> Self {
        self.audit_id = Some(audit_id);
        self
    }

    /// Attaches the attempt index.
    #[must_use]
    pub const fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Attaches the slot.
    #[must_use]
    pub const fn with_slot(mut self, slot: SlotNumber) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Attaches error text.
    #[must_use]
    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

// ============================================================================
// SECTION: Sinks
// ============================================================================

/// Sink for semaphore events.
pub trait SemaphoreEventSink: Send + Sync {
    /// Records an event.
    fn record(&self, event: &SemaphoreEvent);
}

/// Sink writing JSON lines to stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrEventSink {
    /// Events below this level are dropped.
    min_level: EventLevel,
}

impl StderrEventSink {
    /// Creates a stderr sink with a minimum level.
    #[must_use]
    pub const fn new(min_level: EventLevel) -> Self {
        Self {
            min_level,
        }
    }
}

impl SemaphoreEventSink for StderrEventSink {
    fn record(&self, event: &SemaphoreEvent) {
        if event.level < self.min_level {
            return;
        }
        if let Ok(payload) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr(), "{payload}");
        }
    }
}

/// Sink appending JSON lines to a file.
pub struct FileEventSink {
    /// Open log file.
    file: Mutex<File>,
    /// Events below this level are dropped.
    min_level: EventLevel,
}

impl FileEventSink {
    /// Opens (or creates) the log file in append mode.
    ///
    /// # Errors
    ///
    /// Returns [`io::Error`] when the file cannot be opened.
    pub fn new(path: &Path, min_level: EventLevel) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            min_level,
        })
    }
}

impl SemaphoreEventSink for FileEventSink {
    fn record(&self, event: &SemaphoreEvent) {
        if event.level < self.min_level {
            return;
        }
        if let Ok(payload) = serde_json::to_string(event)
            && let Ok(mut file) = self.file.lock()
        {
            let _ = writeln!(file, "{payload}");
        }
    }
}

/// Sink discarding every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl SemaphoreEventSink for NoopEventSink {
    fn record(&self, _event: &SemaphoreEvent) {}
}

/// Sink buffering events in memory, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct InMemoryEventSink {
    /// Recorded events in arrival order.
    events: Mutex<Vec<SemaphoreEvent>>,
}

impl InMemoryEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<SemaphoreEvent> {
        self.events.lock().map(|guard| guard.clone()).unwrap_or_default()
    }

    /// Returns the kinds of the recorded events.
    #[must_use]
    pub fn kinds(&self) -> Vec<SemaphoreEventKind> {
        self.events().into_iter().map(|event| event.event).collect()
    }
}

impl SemaphoreEventSink for InMemoryEventSink {
    fn record(&self, event: &SemaphoreEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event.clone());
        }
    }
}
