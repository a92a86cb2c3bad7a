// crates/dbsem-store-sqlite/src/connection.rs
// ============================================================================
// Module: SQLite Semaphore Connection
// Description: Audit writes and coordination routines over one SQLite handle.
// Purpose: Implement the store connection contract on SQLite.
// Dependencies: dbsem-core, rusqlite
// ============================================================================

//! ## Overview
//! Audit writes open a deferred transaction on first use and stay pending
//! until [`StoreConnection::commit`]. The coordination routines (`wait`,
//! `signal`, `dequeue`) each run in their own `BEGIN IMMEDIATE` transaction
//! and commit before returning; calling one while an audit transaction is
//! open is rejected.
//!
//! A blocking wait enqueues the requester once, then polls: a requester may
//! claim the lowest free slot only when fewer waiters are ahead of it than
//! there are free slots, which keeps grants in arrival order. Every poll
//! refreshes the requester's heartbeat; entries not refreshed within the
//! stale lease belong to waiters that died while queued and are pruned
//! before the queue is counted.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::thread;
use std::time::Duration;
use std::time::Instant;

use dbsem_core::AuditId;
use dbsem_core::AuditRecord;
use dbsem_core::GrantUpdate;
use dbsem_core::NewAuditRecord;
use dbsem_core::SemaphoreName;
use dbsem_core::SlotNumber;
use dbsem_core::SlotUsage;
use dbsem_core::StoreConnection;
use dbsem_core::StoreError;
use dbsem_core::TaskId;
use dbsem_core::Timestamp;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::Transaction;
use rusqlite::TransactionBehavior;
use rusqlite::params;

/// Store clock in unix milliseconds.
const NOW_MILLIS_SQL: &str =
    "SELECT CAST(ROUND((julianday('now') - 2440587.5) * 86400000.0) AS INTEGER)";

// ============================================================================
// SECTION: Connection
// ============================================================================

/// One connection to the `SQLite` semaphore store.
#[derive(Debug)]
pub struct SqliteConnection {
    /// Underlying `SQLite` handle.
    connection: Connection,
    /// Delay between claim attempts of a blocking wait.
    poll_interval: Duration,
    /// Wait bound applied when the caller passes none.
    wait_timeout: Option<Duration>,
    /// Heartbeat age after which a queue entry is treated as abandoned.
    stale_after: Duration,
}

impl SqliteConnection {
    /// Wraps an open `SQLite` handle.
    pub(crate) const fn new(
        connection: Connection,
        poll_interval: Duration,
        wait_timeout: Option<Duration>,
        stale_after: Duration,
    ) -> Self {
        Self {
            connection,
            poll_interval,
            wait_timeout,
            stale_after,
        }
    }

    /// Opens a deferred transaction unless one is already pending.
    fn begin_if_needed(&self) -> Result<(), StoreError> {
        if self.connection.is_autocommit() {
            self.connection.execute_batch("BEGIN").map_err(io_error)?;
        }
        Ok(())
    }

    /// Runs a coordination step in its own immediate transaction.
    fn coordinate<T>(
        &mut self,
        step: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if !self.connection.is_autocommit() {
            return Err(StoreError::Coordination(
                "coordination routine called inside an open transaction".to_string(),
            ));
        }
        let tx = self
            .connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(io_error)?;
        let value = step(&tx)?;
        tx.commit().map_err(io_error)?;
        Ok(value)
    }

    /// Runs an audit update inside the pending transaction and requires one
    /// affected row.
    fn update_audit(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        failure: impl FnOnce() -> String,
    ) -> Result<(), StoreError> {
        self.begin_if_needed()?;
        let changed = self.connection.execute(sql, params).map_err(io_error)?;
        if changed == 0 {
            return Err(StoreError::Invalid(failure()));
        }
        Ok(())
    }
}

impl StoreConnection for SqliteConnection {
    fn count_slots(&mut self, name: &SemaphoreName) -> Result<u32, StoreError> {
        let count: i64 = self
            .connection
            .query_row("SELECT COUNT(*) FROM semlock WHERE name = ?1", params![name.as_str()], |row| {
                row.get(0)
            })
            .map_err(io_error)?;
        count_to_u32(count)
    }

    fn slot_usage(&mut self, name: &SemaphoreName) -> Result<SlotUsage, StoreError> {
        let (total, in_use): (i64, i64) = self
            .connection
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(in_use), 0) FROM semlock WHERE name = ?1",
                params![name.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(io_error)?;
        Ok(SlotUsage {
            total: count_to_u32(total)?,
            in_use: count_to_u32(in_use)?,
        })
    }

    fn next_audit_id(&mut self) -> Result<AuditId, StoreError> {
        self.connection.execute("INSERT INTO seminfo_seq DEFAULT VALUES", params![]).map_err(io_error)?;
        let id = self.connection.last_insert_rowid();
        // sqlite_sequence keeps the high-water mark once the row is gone.
        self.connection
            .execute("DELETE FROM seminfo_seq WHERE id = ?1", params![id])
            .map_err(io_error)?;
        Ok(AuditId::new(id))
    }

    fn current_timestamp(&mut self) -> Result<Timestamp, StoreError> {
        let millis: i64 =
            self.connection.query_row(NOW_MILLIS_SQL, params![], |row| row.get(0)).map_err(io_error)?;
        Ok(Timestamp::from_unix_millis(millis))
    }

    fn insert_audit(&mut self, record: &NewAuditRecord) -> Result<(), StoreError> {
        self.begin_if_needed()?;
        self.connection
            .execute(
                "INSERT INTO seminfo (id, name, task_id, num_slots, request_time) VALUES (?1, ?2, \
                 ?3, ?4, ?5)",
                params![
                    record.id.get(),
                    record.name.as_str(),
                    record.task_id.get(),
                    record.num_slots,
                    record.request_time.as_unix_millis()
                ],
            )
            .map_err(io_error)?;
        Ok(())
    }

    fn record_grant(&mut self, update: &GrantUpdate) -> Result<(), StoreError> {
        self.update_audit(
            "UPDATE seminfo SET grant_time = ?1, num_requests = ?2, slot = ?3 WHERE id = ?4 AND \
             grant_time IS NULL",
            params![
                update.grant_time.as_unix_millis(),
                update.num_requests,
                update.slot.get(),
                update.id.get()
            ],
            || format!("audit record {} missing or already granted", update.id),
        )
    }

    fn record_attempts(&mut self, id: AuditId, num_requests: u32) -> Result<(), StoreError> {
        self.update_audit(
            "UPDATE seminfo SET num_requests = ?1 WHERE id = ?2",
            params![num_requests, id.get()],
            || format!("audit record {id} missing"),
        )
    }

    fn record_release(&mut self, id: AuditId, release_time: Timestamp) -> Result<(), StoreError> {
        self.update_audit(
            "UPDATE seminfo SET release_time = ?1 WHERE id = ?2 AND grant_time IS NOT NULL AND \
             release_time IS NULL",
            params![release_time.as_unix_millis(), id.get()],
            || format!("audit record {id} is not held"),
        )
    }

    fn load_audit(&mut self, id: AuditId) -> Result<Option<AuditRecord>, StoreError> {
        let raw = self
            .connection
            .query_row(
                "SELECT id, name, task_id, num_slots, request_time, grant_time, num_requests, \
                 slot, release_time FROM seminfo WHERE id = ?1",
                params![id.get()],
                audit_from_row,
            )
            .optional()
            .map_err(io_error)?;
        raw.map(RawAudit::into_record).transpose()
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if !self.connection.is_autocommit() {
            self.connection.execute_batch("COMMIT").map_err(io_error)?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        if !self.connection.is_autocommit() {
            self.connection.execute_batch("ROLLBACK").map_err(io_error)?;
        }
        Ok(())
    }

    fn wait(
        &mut self,
        name: &SemaphoreName,
        requester: AuditId,
        timeout: Option<Duration>,
    ) -> Result<SlotNumber, StoreError> {
        let timeout = timeout.or(self.wait_timeout);
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let lease = duration_millis(self.stale_after);
        self.coordinate(|tx| enqueue(tx, name, requester, lease))?;
        loop {
            if let Some(slot) = self.coordinate(|tx| try_claim(tx, name, requester, lease))? {
                return Ok(slot);
            }
            let pause = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.coordinate(|tx| remove_waiter(tx, name, requester))?;
                        return Err(StoreError::Timeout(timeout.unwrap_or_default()));
                    }
                    remaining.min(self.poll_interval)
                }
                None => self.poll_interval,
            };
            thread::sleep(pause);
        }
    }

    fn signal(&mut self, name: &SemaphoreName, slot: SlotNumber) -> Result<(), StoreError> {
        self.coordinate(|tx| {
            let changed = tx
                .execute(
                    "UPDATE semlock SET in_use = 0, holder = NULL WHERE name = ?1 AND slot = ?2 \
                     AND in_use = 1",
                    params![name.as_str(), slot.get()],
                )
                .map_err(io_error)?;
            if changed == 0 {
                return Err(StoreError::Coordination(format!("slot {slot} of {name} is not in use")));
            }
            Ok(())
        })
    }

    fn dequeue(
        &mut self,
        name: &SemaphoreName,
        requester: AuditId,
    ) -> Result<Option<SlotNumber>, StoreError> {
        self.coordinate(|tx| {
            remove_waiter(tx, name, requester)?;
            let held: Option<i64> = tx
                .query_row(
                    "SELECT slot FROM semlock WHERE name = ?1 AND holder = ?2",
                    params![name.as_str(), requester.get()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(io_error)?;
            tx.execute(
                "UPDATE semlock SET in_use = 0, holder = NULL WHERE name = ?1 AND holder = ?2",
                params![name.as_str(), requester.get()],
            )
            .map_err(io_error)?;
            Ok(held.map(SlotNumber::new))
        })
    }

    fn coordination_commits(&self) -> bool {
        true
    }

    fn close(mut self) -> Result<(), StoreError> {
        self.rollback()?;
        self.connection.close().map_err(|(_, err)| io_error(err))
    }
}

// ============================================================================
// SECTION: Coordination Steps
// ============================================================================

/// Appends `requester` to the wait queue unless it is already queued.
fn enqueue(
    tx: &Transaction<'_>,
    name: &SemaphoreName,
    requester: AuditId,
    lease: i64,
) -> Result<(), StoreError> {
    let now = store_now(tx)?;
    prune_stale(tx, name, requester, now.saturating_sub(lease))?;
    tx.execute(
        "INSERT OR IGNORE INTO semqueue (name, requester, enqueued_at, heartbeat) VALUES (?1, \
         ?2, ?3, ?3)",
        params![name.as_str(), requester.get(), now],
    )
    .map_err(io_error)?;
    Ok(())
}

/// Claims the lowest free slot when `requester` is within the free window.
fn try_claim(
    tx: &Transaction<'_>,
    name: &SemaphoreName,
    requester: AuditId,
    lease: i64,
) -> Result<Option<SlotNumber>, StoreError> {
    let now = store_now(tx)?;
    tx.execute(
        "UPDATE semqueue SET heartbeat = ?3 WHERE name = ?1 AND requester = ?2",
        params![name.as_str(), requester.get(), now],
    )
    .map_err(io_error)?;
    prune_stale(tx, name, requester, now.saturating_sub(lease))?;
    let seq: Option<i64> = tx
        .query_row(
            "SELECT seq FROM semqueue WHERE name = ?1 AND requester = ?2",
            params![name.as_str(), requester.get()],
            |row| row.get(0),
        )
        .optional()
        .map_err(io_error)?;
    let Some(seq) = seq else {
        return Err(StoreError::Coordination(format!(
            "wait entry of requester {requester} on {name} was removed"
        )));
    };
    let (ahead, free): (i64, i64) = tx
        .query_row(
            "SELECT (SELECT COUNT(*) FROM semqueue WHERE name = ?1 AND seq < ?2), (SELECT \
             COUNT(*) FROM semlock WHERE name = ?1 AND in_use = 0)",
            params![name.as_str(), seq],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(io_error)?;
    if ahead >= free {
        return Ok(None);
    }
    let slot: i64 = tx
        .query_row(
            "SELECT slot FROM semlock WHERE name = ?1 AND in_use = 0 ORDER BY slot LIMIT 1",
            params![name.as_str()],
            |row| row.get(0),
        )
        .map_err(io_error)?;
    tx.execute(
        "UPDATE semlock SET in_use = 1, holder = ?3 WHERE name = ?1 AND slot = ?2",
        params![name.as_str(), slot, requester.get()],
    )
    .map_err(io_error)?;
    remove_waiter(tx, name, requester)?;
    Ok(Some(SlotNumber::new(slot)))
}

/// Deletes queue entries of other requesters last seen before `cutoff`.
fn prune_stale(
    tx: &Transaction<'_>,
    name: &SemaphoreName,
    requester: AuditId,
    cutoff: i64,
) -> Result<(), StoreError> {
    tx.execute(
        "DELETE FROM semqueue WHERE name = ?1 AND requester <> ?2 AND heartbeat < ?3",
        params![name.as_str(), requester.get(), cutoff],
    )
    .map_err(io_error)?;
    Ok(())
}

/// Reads the store clock.
fn store_now(tx: &Transaction<'_>) -> Result<i64, StoreError> {
    tx.query_row(NOW_MILLIS_SQL, params![], |row| row.get(0)).map_err(io_error)
}

/// Converts a lease to whole milliseconds, saturating at `i64::MAX`.
fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Deletes the queue entry of `requester`.
fn remove_waiter(
    tx: &Transaction<'_>,
    name: &SemaphoreName,
    requester: AuditId,
) -> Result<(), StoreError> {
    tx.execute(
        "DELETE FROM semqueue WHERE name = ?1 AND requester = ?2",
        params![name.as_str(), requester.get()],
    )
    .map_err(io_error)?;
    Ok(())
}

// ============================================================================
// SECTION: Rows
// ============================================================================

/// Audit row as stored.
pub(crate) struct RawAudit {
    /// Audit id.
    id: i64,
    /// Semaphore name.
    name: String,
    /// Task id.
    task_id: i64,
    /// Capacity snapshot.
    num_slots: i64,
    /// Request time (unix ms).
    request_time: i64,
    /// Grant time (unix ms).
    grant_time: Option<i64>,
    /// Attempts consumed.
    num_requests: Option<i64>,
    /// Granted slot.
    slot: Option<i64>,
    /// Release time (unix ms).
    release_time: Option<i64>,
}

impl RawAudit {
    /// Converts the stored row into an audit record.
    pub(crate) fn into_record(self) -> Result<AuditRecord, StoreError> {
        Ok(AuditRecord {
            id: AuditId::new(self.id),
            name: SemaphoreName::new(self.name),
            task_id: TaskId::new(self.task_id),
            num_slots: count_to_u32(self.num_slots)?,
            request_time: Timestamp::from_unix_millis(self.request_time),
            grant_time: self.grant_time.map(Timestamp::from_unix_millis),
            num_requests: self.num_requests.map(count_to_u32).transpose()?,
            slot: self.slot.map(SlotNumber::new),
            release_time: self.release_time.map(Timestamp::from_unix_millis),
        })
    }
}

/// Reads an audit row selected in `seminfo` column order.
pub(crate) fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<RawAudit> {
    Ok(RawAudit {
        id: row.get(0)?,
        name: row.get(1)?,
        task_id: row.get(2)?,
        num_slots: row.get(3)?,
        request_time: row.get(4)?,
        grant_time: row.get(5)?,
        num_requests: row.get(6)?,
        slot: row.get(7)?,
        release_time: row.get(8)?,
    })
}

/// Converts a stored count into `u32`.
pub(crate) fn count_to_u32(value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Invalid(format!("count out of range: {value}")))
}

/// Maps a `SQLite` error into a store error.
fn io_error(error: rusqlite::Error) -> StoreError {
    StoreError::Io(error.to_string())
}
