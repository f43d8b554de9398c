//! Repository for the per-variant capture tables.
//!
//! The three tables share one column set, so operations are written once
//! against a fixed table mapping instead of three copies of the diesel DSL.
//! Every status transition is a guarded UPDATE: the WHERE clause carries the
//! expected current status, and the affected-row count tells the caller
//! whether the transition actually happened.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Nullable, Text};
use log::debug;

use sigerd_core::records::{FieldRecord, RecordType, SyncStatus};
use sigerd_core::Result;

use crate::db::{get_connection, DbPool};
use crate::errors::StorageError;

use super::model::{enum_to_db, format_timestamp, FieldRecordDB};

const COLUMNS: &str = "client_id, remote_id, payload, synced_payload, status, created_at, \
     updated_at, synced_at, remote_updated_at, retry_count, next_retry_at, last_error, \
     last_error_code, conflict_payload";

fn table_for(record_type: RecordType) -> &'static str {
    match record_type {
        RecordType::RainfallReading => "rainfall_readings",
        RecordType::Inspection => "inspections",
        RecordType::IncidentDeclaration => "incident_declarations",
    }
}

#[derive(diesel::QueryableByName)]
struct StatusCountRow {
    #[diesel(sql_type = Text)]
    status: String,
    #[diesel(sql_type = BigInt)]
    n: i64,
}

/// Filter for [`CaptureStoreRepository::list`].
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub record_type: Option<RecordType>,
    pub status: Option<SyncStatus>,
    pub limit: Option<i64>,
}

impl RecordFilter {
    fn tables(&self) -> Vec<RecordType> {
        match self.record_type {
            Some(record_type) => vec![record_type],
            None => RecordType::ALL.to_vec(),
        }
    }
}

/// Synchronous local capture store over pooled SQLite.
///
/// All operations complete without network access; callers on the capture
/// path never suspend.
pub struct CaptureStoreRepository {
    pool: Arc<DbPool>,
}

impl CaptureStoreRepository {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// Insert or replace a record by `client_id`.
    pub fn put(&self, record: &FieldRecord) -> Result<()> {
        let row = FieldRecordDB::from_domain(record)?;
        let table = table_for(record.record_type);
        let mut conn = get_connection(&self.pool)?;

        let sql = format!(
            "INSERT INTO {table} ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(client_id) DO UPDATE SET \
             remote_id = excluded.remote_id, payload = excluded.payload, \
             synced_payload = excluded.synced_payload, status = excluded.status, \
             created_at = excluded.created_at, updated_at = excluded.updated_at, \
             synced_at = excluded.synced_at, remote_updated_at = excluded.remote_updated_at, \
             retry_count = excluded.retry_count, next_retry_at = excluded.next_retry_at, \
             last_error = excluded.last_error, last_error_code = excluded.last_error_code, \
             conflict_payload = excluded.conflict_payload"
        );

        diesel::sql_query(sql)
            .bind::<Text, _>(&row.client_id)
            .bind::<Nullable<Text>, _>(&row.remote_id)
            .bind::<Text, _>(&row.payload)
            .bind::<Nullable<Text>, _>(&row.synced_payload)
            .bind::<Text, _>(&row.status)
            .bind::<Text, _>(&row.created_at)
            .bind::<Text, _>(&row.updated_at)
            .bind::<Nullable<Text>, _>(&row.synced_at)
            .bind::<Nullable<Text>, _>(&row.remote_updated_at)
            .bind::<Integer, _>(row.retry_count)
            .bind::<Nullable<Text>, _>(&row.next_retry_at)
            .bind::<Nullable<Text>, _>(&row.last_error)
            .bind::<Nullable<Text>, _>(&row.last_error_code)
            .bind::<Nullable<Text>, _>(&row.conflict_payload)
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(())
    }

    pub fn get(&self, record_type: RecordType, client_id: &str) -> Result<Option<FieldRecord>> {
        let mut conn = get_connection(&self.pool)?;
        self.get_with_conn(&mut conn, record_type, client_id)
    }

    fn get_with_conn(
        &self,
        conn: &mut SqliteConnection,
        record_type: RecordType,
        client_id: &str,
    ) -> Result<Option<FieldRecord>> {
        let table = table_for(record_type);
        let sql = format!("SELECT {COLUMNS} FROM {table} WHERE client_id = ?");
        let rows = diesel::sql_query(sql)
            .bind::<Text, _>(client_id)
            .load::<FieldRecordDB>(conn)
            .map_err(StorageError::from)?;
        rows.into_iter()
            .next()
            .map(|row| row.into_domain(record_type))
            .transpose()
    }

    /// Look a record up by `client_id` without knowing its variant.
    pub fn find(&self, client_id: &str) -> Result<Option<FieldRecord>> {
        let mut conn = get_connection(&self.pool)?;
        for record_type in RecordType::ALL {
            if let Some(record) = self.get_with_conn(&mut conn, record_type, client_id)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Snapshot of records matching `filter`, ordered by `created_at`
    /// ascending so the oldest pending work drains first.
    pub fn list(&self, filter: &RecordFilter) -> Result<Vec<FieldRecord>> {
        let mut conn = get_connection(&self.pool)?;
        let mut records = Vec::new();

        for record_type in filter.tables() {
            let table = table_for(record_type);
            let rows = match &filter.status {
                Some(status) => {
                    let sql = format!(
                        "SELECT {COLUMNS} FROM {table} WHERE status = ? ORDER BY created_at ASC"
                    );
                    diesel::sql_query(sql)
                        .bind::<Text, _>(enum_to_db(status)?)
                        .load::<FieldRecordDB>(&mut conn)
                }
                None => {
                    let sql = format!("SELECT {COLUMNS} FROM {table} ORDER BY created_at ASC");
                    diesel::sql_query(sql).load::<FieldRecordDB>(&mut conn)
                }
            }
            .map_err(StorageError::from)?;

            for row in rows {
                records.push(row.into_domain(record_type)?);
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Some(limit) = filter.limit {
            records.truncate(limit.max(0) as usize);
        }
        Ok(records)
    }

    /// Queued records whose backoff window has elapsed, oldest first.
    /// A record requeued after conflict resolution keeps its original
    /// `created_at`, so it drains at its original position.
    pub fn list_due_queued(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<FieldRecord>> {
        let mut conn = get_connection(&self.pool)?;
        let queued = enum_to_db(&SyncStatus::Queued)?;
        let now_str = format_timestamp(now);
        let mut records = Vec::new();

        for record_type in RecordType::ALL {
            let table = table_for(record_type);
            let sql = format!(
                "SELECT {COLUMNS} FROM {table} WHERE status = ? \
                 AND (next_retry_at IS NULL OR next_retry_at <= ?) \
                 ORDER BY created_at ASC LIMIT ?"
            );
            let rows = diesel::sql_query(sql)
                .bind::<Text, _>(&queued)
                .bind::<Text, _>(&now_str)
                .bind::<BigInt, _>(limit)
                .load::<FieldRecordDB>(&mut conn)
                .map_err(StorageError::from)?;
            for row in rows {
                records.push(row.into_domain(record_type)?);
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }

    /// Delete a record. Callers only invoke this for `synced` or `failed`
    /// records (enforced at the service layer, not here).
    pub fn delete(&self, record_type: RecordType, client_id: &str) -> Result<usize> {
        let table = table_for(record_type);
        let mut conn = get_connection(&self.pool)?;
        let affected = diesel::sql_query(format!("DELETE FROM {table} WHERE client_id = ?"))
            .bind::<Text, _>(client_id)
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(affected)
    }

    fn guarded_transition(
        &self,
        record_type: RecordType,
        client_id: &str,
        expected: SyncStatus,
        set_clause: &str,
        bind_values: Vec<Option<String>>,
    ) -> Result<bool> {
        let table = table_for(record_type);
        let mut conn = get_connection(&self.pool)?;
        let sql = format!("UPDATE {table} SET {set_clause} WHERE client_id = ? AND status = ?");

        let mut query = diesel::sql_query(sql).into_boxed();
        for value in bind_values {
            query = query.bind::<Nullable<Text>, _>(value);
        }
        let affected = query
            .bind::<Nullable<Text>, _>(Some(client_id.to_string()))
            .bind::<Nullable<Text>, _>(Some(enum_to_db(&expected)?))
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(affected > 0)
    }

    /// `draft -> queued` when the operator confirms submission.
    pub fn mark_queued(&self, record_type: RecordType, client_id: &str) -> Result<bool> {
        let now = format_timestamp(Utc::now());
        self.guarded_transition(
            record_type,
            client_id,
            SyncStatus::Draft,
            "status = ?, updated_at = ?",
            vec![
                Some(enum_to_db(&SyncStatus::Queued)?),
                Some(now),
            ],
        )
    }

    /// Claim a queued record for a sync attempt (`queued -> syncing`).
    /// Returns false when the record was concurrently claimed or moved.
    pub fn claim_for_sync(&self, record_type: RecordType, client_id: &str) -> Result<bool> {
        let now = format_timestamp(Utc::now());
        self.guarded_transition(
            record_type,
            client_id,
            SyncStatus::Queued,
            "status = ?, updated_at = ?",
            vec![
                Some(enum_to_db(&SyncStatus::Syncing)?),
                Some(now),
            ],
        )
    }

    /// Terminal success: `syncing -> synced` with the remote acknowledgment.
    pub fn mark_synced(
        &self,
        record_type: RecordType,
        client_id: &str,
        remote_id: &str,
        remote_updated_at: DateTime<Utc>,
        synced_payload: &serde_json::Value,
    ) -> Result<bool> {
        let now = format_timestamp(Utc::now());
        self.guarded_transition(
            record_type,
            client_id,
            SyncStatus::Syncing,
            "status = ?, remote_id = ?, remote_updated_at = ?, synced_payload = ?, \
             synced_at = ?, updated_at = ?, retry_count = 0, next_retry_at = NULL, \
             last_error = NULL, last_error_code = NULL, conflict_payload = NULL",
            vec![
                Some(enum_to_db(&SyncStatus::Synced)?),
                Some(remote_id.to_string()),
                Some(format_timestamp(remote_updated_at)),
                Some(serde_json::to_string(synced_payload)?),
                Some(now.clone()),
                Some(now),
            ],
        )
    }

    /// Detected divergence: `syncing -> conflict`, retaining the remote
    /// snapshot so the operator can resolve offline. The fetched remote
    /// timestamp is recorded as observed.
    pub fn mark_conflict(
        &self,
        record_type: RecordType,
        client_id: &str,
        remote_id: &str,
        remote_updated_at: DateTime<Utc>,
        remote_payload: &serde_json::Value,
    ) -> Result<bool> {
        let now = format_timestamp(Utc::now());
        self.guarded_transition(
            record_type,
            client_id,
            SyncStatus::Syncing,
            "status = ?, remote_id = ?, remote_updated_at = ?, conflict_payload = ?, \
             updated_at = ?, last_error = ?, last_error_code = 'conflict'",
            vec![
                Some(enum_to_db(&SyncStatus::Conflict)?),
                Some(remote_id.to_string()),
                Some(format_timestamp(remote_updated_at)),
                Some(serde_json::to_string(remote_payload)?),
                Some(now),
                Some("Concurrent remote edit detected".to_string()),
            ],
        )
    }

    /// Terminal non-retryable rejection: `syncing -> failed`. The payload
    /// stays in place for operator correction.
    pub fn mark_failed(
        &self,
        record_type: RecordType,
        client_id: &str,
        last_error: &str,
        last_error_code: &str,
    ) -> Result<bool> {
        let now = format_timestamp(Utc::now());
        self.guarded_transition(
            record_type,
            client_id,
            SyncStatus::Syncing,
            "status = ?, updated_at = ?, retry_count = retry_count + 1, \
             last_error = ?, last_error_code = ?",
            vec![
                Some(enum_to_db(&SyncStatus::Failed)?),
                Some(now),
                Some(last_error.to_string()),
                Some(last_error_code.to_string()),
            ],
        )
    }

    /// Transient failure: `syncing -> queued` with backoff bookkeeping.
    pub fn release_to_queued(
        &self,
        record_type: RecordType,
        client_id: &str,
        next_retry_at: Option<DateTime<Utc>>,
        last_error: &str,
        last_error_code: &str,
    ) -> Result<bool> {
        let now = format_timestamp(Utc::now());
        self.guarded_transition(
            record_type,
            client_id,
            SyncStatus::Syncing,
            "status = ?, updated_at = ?, retry_count = retry_count + 1, \
             next_retry_at = ?, last_error = ?, last_error_code = ?",
            vec![
                Some(enum_to_db(&SyncStatus::Queued)?),
                Some(now),
                next_retry_at.map(format_timestamp),
                Some(last_error.to_string()),
                Some(last_error_code.to_string()),
            ],
        )
    }

    /// Operator chose to keep the local edit: `conflict -> queued`.
    /// `created_at` is untouched so the record drains at its original
    /// position. The retained remote snapshot becomes the new merge base:
    /// together with the remote timestamp observed at conflict time, the
    /// next attempt sees an already-reconciled remote and proceeds instead
    /// of re-flagging the same divergence.
    pub fn requeue_after_conflict(
        &self,
        record_type: RecordType,
        client_id: &str,
    ) -> Result<bool> {
        let now = format_timestamp(Utc::now());
        self.guarded_transition(
            record_type,
            client_id,
            SyncStatus::Conflict,
            "status = ?, updated_at = ?, synced_payload = conflict_payload, \
             conflict_payload = NULL, retry_count = 0, next_retry_at = NULL, \
             last_error = NULL, last_error_code = NULL",
            vec![
                Some(enum_to_db(&SyncStatus::Queued)?),
                Some(now),
            ],
        )
    }

    /// Operator chose the remote version: `conflict -> synced` adopting the
    /// retained remote snapshot as the local payload.
    pub fn accept_remote(&self, record_type: RecordType, client_id: &str) -> Result<bool> {
        let table = table_for(record_type);
        let mut conn = get_connection(&self.pool)?;
        let now = format_timestamp(Utc::now());
        let sql = format!(
            "UPDATE {table} SET status = ?, payload = conflict_payload, \
             synced_payload = conflict_payload, synced_at = ?, updated_at = ?, \
             conflict_payload = NULL, retry_count = 0, next_retry_at = NULL, \
             last_error = NULL, last_error_code = NULL \
             WHERE client_id = ? AND status = ? AND conflict_payload IS NOT NULL"
        );
        let affected = diesel::sql_query(sql)
            .bind::<Text, _>(enum_to_db(&SyncStatus::Synced)?)
            .bind::<Text, _>(&now)
            .bind::<Text, _>(&now)
            .bind::<Text, _>(client_id)
            .bind::<Text, _>(enum_to_db(&SyncStatus::Conflict)?)
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(affected > 0)
    }

    /// Edit a record's payload while it is still editable (`draft` or
    /// `conflict`). Returns false when the record is past editing.
    pub fn update_payload(
        &self,
        record_type: RecordType,
        client_id: &str,
        payload: &serde_json::Value,
    ) -> Result<bool> {
        let table = table_for(record_type);
        let mut conn = get_connection(&self.pool)?;
        let now = format_timestamp(Utc::now());
        let sql = format!(
            "UPDATE {table} SET payload = ?, updated_at = ? \
             WHERE client_id = ? AND status IN (?, ?)"
        );
        let affected = diesel::sql_query(sql)
            .bind::<Text, _>(serde_json::to_string(payload)?)
            .bind::<Text, _>(&now)
            .bind::<Text, _>(client_id)
            .bind::<Text, _>(enum_to_db(&SyncStatus::Draft)?)
            .bind::<Text, _>(enum_to_db(&SyncStatus::Conflict)?)
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(affected > 0)
    }

    /// Give a failed record a fresh attempt after operator correction:
    /// `failed -> queued` with the retry bookkeeping reset.
    pub fn resubmit_failed(&self, record_type: RecordType, client_id: &str) -> Result<bool> {
        let now = format_timestamp(Utc::now());
        self.guarded_transition(
            record_type,
            client_id,
            SyncStatus::Failed,
            "status = ?, updated_at = ?, retry_count = 0, next_retry_at = NULL, \
             last_error = NULL, last_error_code = NULL",
            vec![
                Some(enum_to_db(&SyncStatus::Queued)?),
                Some(now),
            ],
        )
    }

    /// Requeue records stranded in `syncing` by a crash or forced restart.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let mut conn = get_connection(&self.pool)?;
        let now = format_timestamp(Utc::now());
        let mut total = 0;
        for record_type in RecordType::ALL {
            let table = table_for(record_type);
            let sql = format!("UPDATE {table} SET status = ?, updated_at = ? WHERE status = ?");
            total += diesel::sql_query(sql)
                .bind::<Text, _>(enum_to_db(&SyncStatus::Queued)?)
                .bind::<Text, _>(&now)
                .bind::<Text, _>(enum_to_db(&SyncStatus::Syncing)?)
                .execute(&mut conn)
                .map_err(StorageError::from)?;
        }
        if total > 0 {
            debug!("[CaptureStore] Recovered {} interrupted record(s)", total);
        }
        Ok(total)
    }

    /// Delete confirmed records older than the retention cutoff.
    pub fn purge_synced_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut conn = get_connection(&self.pool)?;
        let cutoff_str = format_timestamp(cutoff);
        let mut total = 0;
        for record_type in RecordType::ALL {
            let table = table_for(record_type);
            let sql = format!(
                "DELETE FROM {table} WHERE status = ? AND synced_at IS NOT NULL AND synced_at < ?"
            );
            total += diesel::sql_query(sql)
                .bind::<Text, _>(enum_to_db(&SyncStatus::Synced)?)
                .bind::<Text, _>(&cutoff_str)
                .execute(&mut conn)
                .map_err(StorageError::from)?;
        }
        Ok(total)
    }

    /// Record counts per status, summed across variants.
    pub fn pending_counts(&self) -> Result<HashMap<SyncStatus, i64>> {
        let mut conn = get_connection(&self.pool)?;
        let mut counts: HashMap<SyncStatus, i64> = HashMap::new();
        for record_type in RecordType::ALL {
            let table = table_for(record_type);
            let rows = diesel::sql_query(format!(
                "SELECT status, COUNT(*) AS n FROM {table} GROUP BY status"
            ))
            .load::<StatusCountRow>(&mut conn)
            .map_err(StorageError::from)?;
            for row in rows {
                let status: SyncStatus = super::model::enum_from_db(&row.status)?;
                *counts.entry(status).or_insert(0) += row.n;
            }
        }
        Ok(counts)
    }
}
