// crates/dbsem-core/src/runtime/memory.rs
// ============================================================================
// Module: dbsem In-Memory Store
// Description: Thread-safe in-memory store with a capacity-enforcing queue.
// Purpose: Exercise the protocol without a database, with fault injection.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! [`InMemorySemaphoreStore`] models the backing store closely enough to test
//! the protocol: a FIFO wait queue per semaphore, atomic slot claims guarded
//! by one mutex, blocking waits on a condition variable, and per-connection
//! transactions for audit writes. It is not intended for production use.
//!
//! When `auto_commit` is off, a claim made by `wait` stays provisional until
//! the waiting connection commits; closing or rolling back the connection
//! frees the slot again. Fault injection simulates lost connections: a
//! failed wait leaves its queue entry behind, exactly like a client that
//! dropped mid-call.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use crate::core::AuditId;
use crate::core::AuditRecord;
use crate::core::GrantUpdate;
use crate::core::NewAuditRecord;
use crate::core::SemaphoreName;
use crate::core::SlotNumber;
use crate::core::SlotUsage;
use crate::core::Timestamp;
use crate::interfaces::ConnectOptions;
use crate::interfaces::StoreConnection;
use crate::interfaces::StoreConnector;
use crate::interfaces::StoreError;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Call counters for assertions in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallCounters {
    /// Successful connects.
    pub connects: u32,
    /// Wait calls, including injected failures.
    pub waits: u32,
    /// Signal calls.
    pub signals: u32,
    /// Dequeue calls.
    pub dequeues: u32,
    /// Audit inserts.
    pub audit_inserts: u32,
    /// Audit updates (grant, attempts, release).
    pub audit_updates: u32,
    /// Commits.
    pub commits: u32,
}

/// Injected faults.
#[derive(Debug, Clone, Copy, Default)]
struct FaultPlan {
    /// Fail this many upcoming waits.
    fail_next_waits: u32,
    /// Fail every wait.
    fail_all_waits: bool,
    /// Fail this many upcoming connects.
    fail_next_connects: u32,
    /// Fail this many upcoming signals.
    fail_next_signals: u32,
}

/// State of one slot.
#[derive(Debug, Clone, Copy, Default)]
struct SlotEntry {
    /// Slot is assigned.
    in_use: bool,
    /// Requester the slot is assigned to.
    holder: Option<AuditId>,
    /// Connection whose uncommitted wait made the claim.
    provisional_for: Option<u64>,
}

/// Audit write waiting for commit.
#[derive(Debug, Clone)]
enum PendingWrite {
    /// New audit record.
    Insert(AuditRecord),
    /// Grant stamp.
    Grant(GrantUpdate),
    /// Attempt count of a failed acquisition.
    Attempts(AuditId, u32),
    /// Release stamp.
    Release(AuditId, Timestamp),
}

/// Mutable store state.
#[derive(Debug)]
struct StoreState {
    /// Slot registry.
    semaphores: BTreeMap<SemaphoreName, Vec<SlotEntry>>,
    /// Wait queues in arrival order.
    queues: BTreeMap<SemaphoreName, VecDeque<AuditId>>,
    /// Committed audit records.
    audits: BTreeMap<AuditId, AuditRecord>,
    /// Last issued audit id.
    last_audit_id: i64,
    /// Last issued connection id.
    last_connection_id: u64,
    /// Coordination routines commit their own claims.
    auto_commit: bool,
    /// Injected faults.
    faults: FaultPlan,
    /// Call counters.
    counters: CallCounters,
    /// Highest simultaneous in-use count per semaphore.
    high_water: BTreeMap<SemaphoreName, u32>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            semaphores: BTreeMap::new(),
            queues: BTreeMap::new(),
            audits: BTreeMap::new(),
            last_audit_id: 0,
            last_connection_id: 0,
            auto_commit: true,
            faults: FaultPlan::default(),
            counters: CallCounters::default(),
            high_water: BTreeMap::new(),
        }
    }
}

/// State shared between the store and its connections.
#[derive(Debug, Default)]
struct Shared {
    /// Store state.
    state: Mutex<StoreState>,
    /// Signalled whenever slots or queues change.
    changed: Condvar,
}

impl Shared {
    /// Locks the store state.
    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state.lock().map_err(|_| poisoned())
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// In-memory store for tests and examples.
#[derive(Debug, Clone, Default)]
pub struct InMemorySemaphoreStore {
    /// Shared state.
    shared: Arc<Shared>,
}

impl InMemorySemaphoreStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `slots` slots under `name`, replacing any previous set.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the state lock is poisoned.
    pub fn register(&self, name: &SemaphoreName, slots: u32) -> Result<(), StoreError> {
        let mut state = self.shared.lock()?;
        let entries = (0..slots).map(|_| SlotEntry::default()).collect();
        state.semaphores.insert(name.clone(), entries);
        drop(state);
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Sets whether coordination routines commit their own claims.
    ///
    /// Applies to connections opened afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the state lock is poisoned.
    pub fn set_auto_commit(&self, auto_commit: bool) -> Result<(), StoreError> {
        self.shared.lock()?.auto_commit = auto_commit;
        Ok(())
    }

    /// Makes the next `count` waits fail after enqueueing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the state lock is poisoned.
    pub fn fail_next_waits(&self, count: u32) -> Result<(), StoreError> {
        self.shared.lock()?.faults.fail_next_waits = count;
        Ok(())
    }

    /// Makes every wait fail until turned off.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the state lock is poisoned.
    pub fn fail_all_waits(&self, enabled: bool) -> Result<(), StoreError> {
        self.shared.lock()?.faults.fail_all_waits = enabled;
        Ok(())
    }

    /// Makes the next `count` connects fail.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the state lock is poisoned.
    pub fn fail_next_connects(&self, count: u32) -> Result<(), StoreError> {
        self.shared.lock()?.faults.fail_next_connects = count;
        Ok(())
    }

    /// Makes the next `count` signals fail.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the state lock is poisoned.
    pub fn fail_next_signals(&self, count: u32) -> Result<(), StoreError> {
        self.shared.lock()?.faults.fail_next_signals = count;
        Ok(())
    }

    /// Returns the call counters.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the state lock is poisoned.
    pub fn counters(&self) -> Result<CallCounters, StoreError> {
        Ok(self.shared.lock()?.counters)
    }

    /// Returns all committed audit records for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the state lock is poisoned.
    pub fn audit_records(&self, name: &SemaphoreName) -> Result<Vec<AuditRecord>, StoreError> {
        let state = self.shared.lock()?;
        Ok(state.audits.values().filter(|record| record.name == *name).cloned().collect())
    }

    /// Returns the slot usage of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the state lock is poisoned.
    pub fn usage(&self, name: &SemaphoreName) -> Result<SlotUsage, StoreError> {
        Ok(usage_of(&*self.shared.lock()?, name))
    }

    /// Returns the number of queued waiters for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the state lock is poisoned.
    pub fn queue_len(&self, name: &SemaphoreName) -> Result<usize, StoreError> {
        Ok(self.shared.lock()?.queues.get(name).map_or(0, VecDeque::len))
    }

    /// Returns the highest simultaneous in-use count observed for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the state lock is poisoned.
    pub fn high_water(&self, name: &SemaphoreName) -> Result<u32, StoreError> {
        Ok(self.shared.lock()?.high_water.get(name).copied().unwrap_or(0))
    }
}

impl StoreConnector for InMemorySemaphoreStore {
    type Connection = InMemoryConnection;

    fn connect(&self, _options: ConnectOptions) -> Result<Self::Connection, StoreError> {
        let mut state = self.shared.lock()?;
        if state.faults.fail_next_connects > 0 {
            state.faults.fail_next_connects -= 1;
            return Err(StoreError::Connect("simulated connect failure".to_string()));
        }
        state.counters.connects += 1;
        state.last_connection_id += 1;
        let id = state.last_connection_id;
        let auto_commit = state.auto_commit;
        drop(state);
        Ok(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            id,
            auto_commit,
            pending: Vec::new(),
        })
    }
}

// ============================================================================
// SECTION: Connection
// ============================================================================

/// Connection to an [`InMemorySemaphoreStore`].
///
/// Dropping the connection discards uncommitted work.
#[derive(Debug)]
pub struct InMemoryConnection {
    /// Shared state.
    shared: Arc<Shared>,
    /// Connection identity for provisional claims.
    id: u64,
    /// Snapshot of the store's auto-commit mode.
    auto_commit: bool,
    /// Uncommitted audit writes.
    pending: Vec<PendingWrite>,
}

impl InMemoryConnection {
    /// Discards pending writes and frees provisional claims.
    fn discard(&mut self) -> Result<(), StoreError> {
        self.pending.clear();
        let mut state = self.shared.lock()?;
        let mut freed = false;
        for entries in state.semaphores.values_mut() {
            for entry in entries.iter_mut().filter(|entry| entry.provisional_for == Some(self.id)) {
                *entry = SlotEntry::default();
                freed = true;
            }
        }
        drop(state);
        if freed {
            self.shared.changed.notify_all();
        }
        Ok(())
    }
}

impl StoreConnection for InMemoryConnection {
    fn count_slots(&mut self, name: &SemaphoreName) -> Result<u32, StoreError> {
        Ok(usage_of(&*self.shared.lock()?, name).total)
    }

    fn slot_usage(&mut self, name: &SemaphoreName) -> Result<SlotUsage, StoreError> {
        Ok(usage_of(&*self.shared.lock()?, name))
    }

    fn next_audit_id(&mut self) -> Result<AuditId, StoreError> {
        let mut state = self.shared.lock()?;
        state.last_audit_id += 1;
        Ok(AuditId::new(state.last_audit_id))
    }

    fn current_timestamp(&mut self) -> Result<Timestamp, StoreError> {
        Ok(Timestamp::now())
    }

    fn insert_audit(&mut self, record: &NewAuditRecord) -> Result<(), StoreError> {
        self.shared.lock()?.counters.audit_inserts += 1;
        self.pending.push(PendingWrite::Insert(AuditRecord {
            id: record.id,
            name: record.name.clone(),
            task_id: record.task_id,
            num_slots: record.num_slots,
            request_time: record.request_time,
            grant_time: None,
            num_requests: None,
            slot: None,
            release_time: None,
        }));
        Ok(())
    }

    fn record_grant(&mut self, update: &GrantUpdate) -> Result<(), StoreError> {
        self.shared.lock()?.counters.audit_updates += 1;
        self.pending.push(PendingWrite::Grant(*update));
        Ok(())
    }

    fn record_attempts(&mut self, id: AuditId, num_requests: u32) -> Result<(), StoreError> {
        self.shared.lock()?.counters.audit_updates += 1;
        self.pending.push(PendingWrite::Attempts(id, num_requests));
        Ok(())
    }

    fn record_release(&mut self, id: AuditId, release_time: Timestamp) -> Result<(), StoreError> {
        self.shared.lock()?.counters.audit_updates += 1;
        self.pending.push(PendingWrite::Release(id, release_time));
        Ok(())
    }

    fn load_audit(&mut self, id: AuditId) -> Result<Option<AuditRecord>, StoreError> {
        Ok(self.shared.lock()?.audits.get(&id).cloned())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let pending = std::mem::take(&mut self.pending);
        let mut state = self.shared.lock()?;
        state.counters.commits += 1;
        for entries in state.semaphores.values_mut() {
            for entry in entries.iter_mut().filter(|entry| entry.provisional_for == Some(self.id)) {
                entry.provisional_for = None;
            }
        }
        let mut staged = state.audits.clone();
        for write in pending {
            apply_write(&mut staged, write)?;
        }
        state.audits = staged;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.discard()
    }

    fn wait(
        &mut self,
        name: &SemaphoreName,
        requester: AuditId,
        timeout: Option<Duration>,
    ) -> Result<SlotNumber, StoreError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.shared.lock()?;
        state.counters.waits += 1;
        let queue = state.queues.entry(name.clone()).or_default();
        if !queue.contains(&requester) {
            queue.push_back(requester);
        }
        if state.faults.fail_all_waits || state.faults.fail_next_waits > 0 {
            state.faults.fail_next_waits = state.faults.fail_next_waits.saturating_sub(1);
            return Err(StoreError::Io("simulated connection loss during wait".to_string()));
        }
        loop {
            let position = state
                .queues
                .get(name)
                .and_then(|queue| queue.iter().position(|entry| *entry == requester))
                .ok_or_else(|| StoreError::Coordination("wait entry was removed".to_string()))?;
            let free = usage_of(&state, name).free();
            if u32::try_from(position).is_ok_and(|position| position < free) {
                let slot = claim(&mut state, name, requester, (!self.auto_commit).then_some(self.id))?;
                drop(state);
                self.shared.changed.notify_all();
                return Ok(slot);
            }
            state = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        remove_waiter(&mut state, name, requester);
                        drop(state);
                        self.shared.changed.notify_all();
                        return Err(StoreError::Timeout(timeout.unwrap_or_default()));
                    }
                    self.shared.changed.wait_timeout(state, remaining).map_err(|_| poisoned())?.0
                }
                None => self.shared.changed.wait(state).map_err(|_| poisoned())?,
            };
        }
    }

    fn signal(&mut self, name: &SemaphoreName, slot: SlotNumber) -> Result<(), StoreError> {
        let mut state = self.shared.lock()?;
        state.counters.signals += 1;
        if state.faults.fail_next_signals > 0 {
            state.faults.fail_next_signals -= 1;
            return Err(StoreError::Io("simulated connection loss during signal".to_string()));
        }
        let entry = slot_entry(&mut state, name, slot)?;
        if !entry.in_use {
            return Err(StoreError::Coordination(format!("slot {slot} of {name} is not in use")));
        }
        *entry = SlotEntry::default();
        drop(state);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn dequeue(
        &mut self,
        name: &SemaphoreName,
        requester: AuditId,
    ) -> Result<Option<SlotNumber>, StoreError> {
        let mut state = self.shared.lock()?;
        state.counters.dequeues += 1;
        remove_waiter(&mut state, name, requester);
        let mut freed = None;
        if let Some(entries) = state.semaphores.get_mut(name) {
            for (index, entry) in entries.iter_mut().enumerate() {
                if entry.holder == Some(requester) {
                    *entry = SlotEntry::default();
                    freed = Some(slot_number(index)?);
                }
            }
        }
        drop(state);
        self.shared.changed.notify_all();
        Ok(freed)
    }

    fn coordination_commits(&self) -> bool {
        self.auto_commit
    }

    fn close(mut self) -> Result<(), StoreError> {
        self.discard()
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        let _ = self.discard();
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Error returned when the state mutex is poisoned.
fn poisoned() -> StoreError {
    StoreError::Store("in-memory store mutex poisoned".to_string())
}

/// Computes slot usage for a semaphore.
fn usage_of(state: &StoreState, name: &SemaphoreName) -> SlotUsage {
    let entries = state.semaphores.get(name).map_or(&[][..], Vec::as_slice);
    let in_use = entries.iter().filter(|entry| entry.in_use).count();
    SlotUsage {
        total: u32::try_from(entries.len()).unwrap_or(u32::MAX),
        in_use: u32::try_from(in_use).unwrap_or(u32::MAX),
    }
}

/// Converts a slot index into a one-based slot number.
fn slot_number(index: usize) -> Result<SlotNumber, StoreError> {
    i64::try_from(index + 1)
        .map(SlotNumber::new)
        .map_err(|_| StoreError::Invalid("slot index overflow".to_string()))
}

/// Looks up the entry for a slot number.
fn slot_entry<'a>(
    state: &'a mut StoreState,
    name: &SemaphoreName,
    slot: SlotNumber,
) -> Result<&'a mut SlotEntry, StoreError> {
    let index = usize::try_from(slot.get() - 1)
        .map_err(|_| StoreError::Invalid(format!("invalid slot {slot}")))?;
    state
        .semaphores
        .get_mut(name)
        .and_then(|entries| entries.get_mut(index))
        .ok_or_else(|| StoreError::Invalid(format!("unknown slot {slot} of {name}")))
}

/// Assigns the lowest free slot to `requester` and removes its queue entry.
fn claim(
    state: &mut StoreState,
    name: &SemaphoreName,
    requester: AuditId,
    provisional_for: Option<u64>,
) -> Result<SlotNumber, StoreError> {
    let entries = state
        .semaphores
        .get_mut(name)
        .ok_or_else(|| StoreError::Coordination(format!("semaphore {name} not registered")))?;
    let index = entries
        .iter()
        .position(|entry| !entry.in_use)
        .ok_or_else(|| StoreError::Coordination(format!("no free slot for {name}")))?;
    entries[index] = SlotEntry {
        in_use: true,
        holder: Some(requester),
        provisional_for,
    };
    remove_waiter(state, name, requester);
    let in_use = usage_of(state, name).in_use;
    let high_water = state.high_water.entry(name.clone()).or_insert(0);
    *high_water = (*high_water).max(in_use);
    slot_number(index)
}

/// Removes `requester` from the wait queue of `name`.
fn remove_waiter(state: &mut StoreState, name: &SemaphoreName, requester: AuditId) {
    if let Some(queue) = state.queues.get_mut(name) {
        queue.retain(|entry| *entry != requester);
    }
}

/// Applies one committed write, enforcing audit lifecycle invariants.
fn apply_write(
    audits: &mut BTreeMap<AuditId, AuditRecord>,
    write: PendingWrite,
) -> Result<(), StoreError> {
    match write {
        PendingWrite::Insert(record) => {
            if audits.contains_key(&record.id) {
                return Err(StoreError::Invalid(format!("duplicate audit id {}", record.id)));
            }
            audits.insert(record.id, record);
        }
        PendingWrite::Grant(update) => {
            let record = audit_mut(audits, update.id)?;
            if record.grant_time.is_some() {
                return Err(StoreError::Invalid(format!("audit {} already granted", update.id)));
            }
            record.grant_time = Some(update.grant_time);
            record.num_requests = Some(update.num_requests);
            record.slot = Some(update.slot);
        }
        PendingWrite::Attempts(id, num_requests) => {
            audit_mut(audits, id)?.num_requests = Some(num_requests);
        }
        PendingWrite::Release(id, release_time) => {
            let record = audit_mut(audits, id)?;
            if record.grant_time.is_none() || record.release_time.is_some() {
                return Err(StoreError::Invalid(format!("audit {id} is not held")));
            }
            record.release_time = Some(release_time);
        }
    }
    Ok(())
}

/// Looks up a committed audit record for update.
fn audit_mut(
    audits: &mut BTreeMap<AuditId, AuditRecord>,
    id: AuditId,
) -> Result<&mut AuditRecord, StoreError> {
    audits.get_mut(&id).ok_or_else(|| StoreError::Invalid(format!("unknown audit id {id}")))
}
