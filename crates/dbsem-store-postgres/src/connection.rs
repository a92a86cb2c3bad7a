// crates/dbsem-store-postgres/src/connection.rs
// ============================================================================
// Module: Postgres Semaphore Connection
// Description: Audit writes and routine calls over one Postgres client.
// Purpose: Implement the store connection contract on Postgres.
// Dependencies: dbsem-core, postgres
// ============================================================================

//! ## Overview
//! Audit writes run inside an explicit `BEGIN` opened on first use and kept
//! until [`StoreConnection::commit`]. Routine calls run in autocommit so the
//! routines own their transactions; a routine call while audit writes are
//! pending is rejected. A wait bound is applied as a session
//! `statement_timeout` around the wait call only.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

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
use postgres::Client;
use postgres::Row;
use postgres::error::SqlState;
use postgres::types::ToSql;

use crate::store::PostgresSemaphoreConfig;

// ============================================================================
// SECTION: Statements
// ============================================================================

/// SQL text built once from validated identifiers.
#[derive(Debug)]
pub(crate) struct Statements {
    /// DDL for tables and sequence.
    pub(crate) install: String,
    /// Slot usage per semaphore.
    pub(crate) list: String,
    /// Locks and counts in-use slots of one semaphore.
    pub(crate) lock_in_use: String,
    /// Deletes the slots of one semaphore.
    pub(crate) delete_slots: String,
    /// Inserts one free slot.
    pub(crate) insert_slot: String,
    /// Slot count and in-use count.
    usage: String,
    /// Next audit id.
    next_id: String,
    /// Audit insert.
    insert_audit: String,
    /// Grant stamp.
    grant: String,
    /// Attempt count.
    attempts: String,
    /// Release stamp.
    release: String,
    /// Audit lookup.
    load: String,
    /// Wait routine call.
    wait: String,
    /// Signal routine call.
    signal: String,
    /// Dequeue routine call.
    dequeue: String,
}

impl Statements {
    /// Builds statements from a validated configuration.
    pub(crate) fn new(config: &PostgresSemaphoreConfig) -> Self {
        let slots = &config.slot_table;
        let audit = &config.audit_table;
        Self {
            install: format!(
                "CREATE TABLE IF NOT EXISTS {slots} (name TEXT NOT NULL, slot BIGINT NOT NULL, \
                 in_use BOOLEAN NOT NULL DEFAULT FALSE, PRIMARY KEY (name, slot)); CREATE \
                 SEQUENCE IF NOT EXISTS {seq}; CREATE TABLE IF NOT EXISTS {audit} (id BIGINT \
                 PRIMARY KEY, name TEXT NOT NULL, task_id BIGINT NOT NULL, num_slots BIGINT NOT \
                 NULL, request_time BIGINT NOT NULL, grant_time BIGINT, num_requests BIGINT, \
                 slot BIGINT, release_time BIGINT);",
                seq = config.sequence
            ),
            list: format!(
                "SELECT name, COUNT(*), COUNT(*) FILTER (WHERE in_use) FROM {slots} GROUP BY name \
                 ORDER BY name"
            ),
            lock_in_use: format!(
                "SELECT COUNT(*) FROM (SELECT 1 FROM {slots} WHERE name = $1 AND in_use FOR \
                 UPDATE) AS held"
            ),
            delete_slots: format!("DELETE FROM {slots} WHERE name = $1"),
            insert_slot: format!(
                "INSERT INTO {slots} (name, slot, in_use) VALUES ($1, $2, FALSE)"
            ),
            usage: format!(
                "SELECT COUNT(*), COUNT(*) FILTER (WHERE in_use) FROM {slots} WHERE name = $1"
            ),
            next_id: format!("SELECT nextval('{}')", config.sequence),
            insert_audit: format!(
                "INSERT INTO {audit} (id, name, task_id, num_slots, request_time) VALUES ($1, \
                 $2, $3, $4, $5)"
            ),
            grant: format!(
                "UPDATE {audit} SET grant_time = $1, num_requests = $2, slot = $3 WHERE id = $4 \
                 AND grant_time IS NULL"
            ),
            attempts: format!("UPDATE {audit} SET num_requests = $1 WHERE id = $2"),
            release: format!(
                "UPDATE {audit} SET release_time = $1 WHERE id = $2 AND grant_time IS NOT NULL \
                 AND release_time IS NULL"
            ),
            load: format!(
                "SELECT id, name, task_id, num_slots, request_time, grant_time, num_requests, \
                 slot, release_time FROM {audit} WHERE id = $1"
            ),
            wait: format!("SELECT {}($1, $2)", config.wait_routine),
            signal: format!("SELECT {}($1, $2)", config.signal_routine),
            dequeue: format!("SELECT {}($1, $2)", config.dequeue_routine),
        }
    }
}

// ============================================================================
// SECTION: Connection
// ============================================================================

/// One client connection to the Postgres semaphore store.
pub struct PostgresConnection {
    /// Underlying client.
    client: Client,
    /// Shared SQL text.
    statements: Arc<Statements>,
    /// Wait bound applied when the caller passes none.
    wait_timeout: Option<Duration>,
    /// An explicit transaction is open.
    in_tx: bool,
}

impl PostgresConnection {
    /// Wraps an open client.
    pub(crate) const fn new(
        client: Client,
        statements: Arc<Statements>,
        wait_timeout: Option<Duration>,
    ) -> Self {
        Self {
            client,
            statements,
            wait_timeout,
            in_tx: false,
        }
    }

    /// Opens an explicit transaction unless one is already open.
    fn begin_if_needed(&mut self) -> Result<(), StoreError> {
        if !self.in_tx {
            self.client.batch_execute("BEGIN").map_err(io_error)?;
            self.in_tx = true;
        }
        Ok(())
    }

    /// Rejects routine calls while audit writes are pending.
    fn ensure_autocommit(&self) -> Result<(), StoreError> {
        if self.in_tx {
            return Err(StoreError::Coordination(
                "coordination routine called inside an open transaction".to_string(),
            ));
        }
        Ok(())
    }

    /// Runs an audit update and requires one affected row.
    fn update_audit(
        &mut self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
        failure: impl FnOnce() -> String,
    ) -> Result<(), StoreError> {
        self.begin_if_needed()?;
        let changed = self.client.execute(sql, params).map_err(io_error)?;
        if changed == 0 {
            return Err(StoreError::Invalid(failure()));
        }
        Ok(())
    }

    /// Calls the wait routine, bounded by `timeout` when given.
    fn call_wait(
        &mut self,
        name: &SemaphoreName,
        requester: AuditId,
        timeout: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let statements = Arc::clone(&self.statements);
        let sql = statements.wait.as_str();
        let Some(timeout) = timeout else {
            let row = self
                .client
                .query_one(sql, &[&name.as_str(), &requester.get()])
                .map_err(routine_error)?;
            return wait_result(&row);
        };
        let millis = timeout.as_millis().max(1);
        self.client
            .batch_execute(&format!("SET statement_timeout = {millis}"))
            .map_err(io_error)?;
        let result = self.client.query_one(sql, &[&name.as_str(), &requester.get()]);
        self.client.batch_execute("RESET statement_timeout").map_err(io_error)?;
        match result {
            Ok(row) => wait_result(&row),
            Err(err) if err.code() == Some(&SqlState::QUERY_CANCELED) => {
                Err(StoreError::Timeout(timeout))
            }
            Err(err) => Err(routine_error(err)),
        }
    }
}

impl StoreConnection for PostgresConnection {
    fn count_slots(&mut self, name: &SemaphoreName) -> Result<u32, StoreError> {
        Ok(self.slot_usage(name)?.total)
    }

    fn slot_usage(&mut self, name: &SemaphoreName) -> Result<SlotUsage, StoreError> {
        let row =
            self.client.query_one(&self.statements.usage, &[&name.as_str()]).map_err(io_error)?;
        Ok(SlotUsage {
            total: count_to_u32(row.get(0))?,
            in_use: count_to_u32(row.get(1))?,
        })
    }

    fn next_audit_id(&mut self) -> Result<AuditId, StoreError> {
        let row = self.client.query_one(&self.statements.next_id, &[]).map_err(io_error)?;
        Ok(AuditId::new(row.get(0)))
    }

    fn current_timestamp(&mut self) -> Result<Timestamp, StoreError> {
        let row = self
            .client
            .query_one("SELECT (EXTRACT(EPOCH FROM clock_timestamp()) * 1000)::BIGINT", &[])
            .map_err(io_error)?;
        Ok(Timestamp::from_unix_millis(row.get(0)))
    }

    fn insert_audit(&mut self, record: &NewAuditRecord) -> Result<(), StoreError> {
        self.begin_if_needed()?;
        self.client
            .execute(
                &self.statements.insert_audit,
                &[
                    &record.id.get(),
                    &record.name.as_str(),
                    &record.task_id.get(),
                    &i64::from(record.num_slots),
                    &record.request_time.as_unix_millis(),
                ],
            )
            .map_err(io_error)?;
        Ok(())
    }

    fn record_grant(&mut self, update: &GrantUpdate) -> Result<(), StoreError> {
        let statements = Arc::clone(&self.statements);
        self.update_audit(
            &statements.grant,
            &[
                &update.grant_time.as_unix_millis(),
                &i64::from(update.num_requests),
                &update.slot.get(),
                &update.id.get(),
            ],
            || format!("audit record {} missing or already granted", update.id),
        )
    }

    fn record_attempts(&mut self, id: AuditId, num_requests: u32) -> Result<(), StoreError> {
        let statements = Arc::clone(&self.statements);
        self.update_audit(&statements.attempts, &[&i64::from(num_requests), &id.get()], || {
            format!("audit record {id} missing")
        })
    }

    fn record_release(&mut self, id: AuditId, release_time: Timestamp) -> Result<(), StoreError> {
        let statements = Arc::clone(&self.statements);
        self.update_audit(&statements.release, &[&release_time.as_unix_millis(), &id.get()], || {
            format!("audit record {id} is not held")
        })
    }

    fn load_audit(&mut self, id: AuditId) -> Result<Option<AuditRecord>, StoreError> {
        let row = self.client.query_opt(&self.statements.load, &[&id.get()]).map_err(io_error)?;
        row.as_ref().map(audit_from_row).transpose()
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if self.in_tx {
            self.in_tx = false;
            self.client.batch_execute("COMMIT").map_err(io_error)?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        if self.in_tx {
            self.in_tx = false;
            self.client.batch_execute("ROLLBACK").map_err(io_error)?;
        }
        Ok(())
    }

    fn wait(
        &mut self,
        name: &SemaphoreName,
        requester: AuditId,
        timeout: Option<Duration>,
    ) -> Result<SlotNumber, StoreError> {
        self.ensure_autocommit()?;
        let timeout = timeout.or(self.wait_timeout);
        self.call_wait(name, requester, timeout).map(SlotNumber::new)
    }

    fn signal(&mut self, name: &SemaphoreName, slot: SlotNumber) -> Result<(), StoreError> {
        self.ensure_autocommit()?;
        self.client
            .execute(&self.statements.signal, &[&name.as_str(), &slot.get()])
            .map_err(routine_error)?;
        Ok(())
    }

    fn dequeue(
        &mut self,
        name: &SemaphoreName,
        requester: AuditId,
    ) -> Result<Option<SlotNumber>, StoreError> {
        self.ensure_autocommit()?;
        let row = self
            .client
            .query_one(&self.statements.dequeue, &[&name.as_str(), &requester.get()])
            .map_err(routine_error)?;
        let freed = row
            .try_get::<_, Option<i64>>(0)
            .map_err(|err| StoreError::Invalid(format!("dequeue routine result: {err}")))?;
        freed_slot(freed)
    }

    fn coordination_commits(&self) -> bool {
        true
    }

    fn close(mut self) -> Result<(), StoreError> {
        self.rollback()?;
        self.client.close().map_err(io_error)
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Converts an audit row into a record.
fn audit_from_row(row: &Row) -> Result<AuditRecord, StoreError> {
    let num_requests: Option<i64> = row.get(6);
    Ok(AuditRecord {
        id: AuditId::new(row.get(0)),
        name: SemaphoreName::new(row.get::<_, String>(1)),
        task_id: TaskId::new(row.get(2)),
        num_slots: count_to_u32(row.get(3))?,
        request_time: Timestamp::from_unix_millis(row.get(4)),
        grant_time: row.get::<_, Option<i64>>(5).map(Timestamp::from_unix_millis),
        num_requests: num_requests.map(count_to_u32).transpose()?,
        slot: row.get::<_, Option<i64>>(7).map(SlotNumber::new),
        release_time: row.get::<_, Option<i64>>(8).map(Timestamp::from_unix_millis),
    })
}

/// Decodes the slot granted by the wait routine.
fn wait_result(row: &Row) -> Result<i64, StoreError> {
    let granted = row
        .try_get::<_, Option<i64>>(0)
        .map_err(|err| StoreError::Invalid(format!("wait routine result: {err}")))?;
    granted_slot(granted)
}

/// Requires a positive slot from the wait routine.
fn granted_slot(value: Option<i64>) -> Result<i64, StoreError> {
    match value {
        Some(slot) if slot >= 1 => Ok(slot),
        Some(slot) => Err(StoreError::Invalid(format!("wait routine returned slot {slot}"))),
        None => Err(StoreError::Invalid("wait routine returned no slot".to_string())),
    }
}

/// Accepts an absent or positive slot from the dequeue routine.
fn freed_slot(value: Option<i64>) -> Result<Option<SlotNumber>, StoreError> {
    match value {
        Some(slot) if slot < 1 => {
            Err(StoreError::Invalid(format!("dequeue routine returned slot {slot}")))
        }
        other => Ok(other.map(SlotNumber::new)),
    }
}

/// Converts a stored count into `u32`.
fn count_to_u32(value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Invalid(format!("count out of range: {value}")))
}

/// Maps a statement or transport error.
fn io_error(error: postgres::Error) -> StoreError {
    StoreError::Io(error.to_string())
}

/// Maps a routine call error; server-raised errors are coordination errors.
fn routine_error(error: postgres::Error) -> StoreError {
    if error.is_closed() || error.as_db_error().is_none() {
        return StoreError::Io(error.to_string());
    }
    StoreError::Coordination(error.to_string())
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::panic,
        clippy::unwrap_used,
        clippy::expect_used,
        reason = "Test-only assertions are permitted."
    )]

    use super::*;

    #[test]
    fn wait_routine_result_must_be_a_positive_slot() {
        assert_eq!(granted_slot(Some(3)).unwrap(), 3);
        assert!(matches!(granted_slot(None), Err(StoreError::Invalid(_))));
        assert!(matches!(granted_slot(Some(0)), Err(StoreError::Invalid(_))));
        assert!(matches!(granted_slot(Some(-2)), Err(StoreError::Invalid(_))));
    }

    #[test]
    fn dequeue_routine_result_may_be_absent() {
        assert_eq!(freed_slot(None).unwrap(), None);
        assert_eq!(freed_slot(Some(2)).unwrap(), Some(SlotNumber::new(2)));
        assert!(matches!(freed_slot(Some(0)), Err(StoreError::Invalid(_))));
    }
}
