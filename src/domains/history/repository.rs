use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, query_scalar, SqlitePool};
use uuid::Uuid;

use crate::errors::{DbError, DomainError, DomainResult};
use crate::utils::{parse_db_timestamp, parse_db_uuid, to_db_timestamp, truncate_chars};

use super::types::{
    AuditEntry, FileOutcome, FileRecord, NewAuditEntry, NewFileRecord, NewRun, RunCompletion,
    RunOutcome, RunRecord,
};

/// Append-only store of run outcomes
#[async_trait]
pub trait RunHistoryStore: Send + Sync {
    /// Insert an unfinalized run. Always precedes any FileRecord of the run.
    async fn start_run(&self, new_run: &NewRun) -> DomainResult<RunRecord>;
    /// Finalize a run exactly once; a second call is a conflict.
    async fn finalize_run(&self, id: Uuid, completion: &RunCompletion) -> DomainResult<RunRecord>;
    async fn find_by_id(&self, id: Uuid) -> DomainResult<RunRecord>;
    /// Finalized runs, newest first
    async fn list_all(&self) -> DomainResult<Vec<RunRecord>>;
    async fn list_for_job(&self, job_id: Uuid) -> DomainResult<Vec<RunRecord>>;
    /// Fail runs left unfinalized that started before `started_before`,
    /// except those of `live_jobs`. Returns how many were failed.
    async fn mark_stale_runs_failed(
        &self,
        reason: &str,
        started_before: DateTime<Utc>,
        live_jobs: &[String],
    ) -> DomainResult<u64>;
}

#[async_trait]
pub trait FileHistoryStore: Send + Sync {
    async fn record_file(&self, new_file: &NewFileRecord) -> DomainResult<FileRecord>;
    async fn list_for_run(&self, run_id: Uuid) -> DomainResult<Vec<FileRecord>>;
    async fn list_for_job(&self, job_id: Uuid) -> DomainResult<Vec<FileRecord>>;
}

#[async_trait]
pub trait AuditLogStore: Send + Sync {
    async fn record(&self, entry: &NewAuditEntry) -> DomainResult<AuditEntry>;
    async fn list_for_table(&self, table_name: &str) -> DomainResult<Vec<AuditEntry>>;
}

fn str_to_run_outcome(s: &str) -> Option<RunOutcome> {
    match s {
        "success" => Some(RunOutcome::Success),
        "failure" => Some(RunOutcome::Failure),
        _ => None,
    }
}

fn str_to_file_outcome(s: &str) -> Option<FileOutcome> {
    match s {
        "succeeded" => Some(FileOutcome::Succeeded),
        "failed" => Some(FileOutcome::Failed),
        _ => None,
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    job_id: String,
    job_name: String,
    started_at: String,
    ended_at: Option<String>,
    tables_attempted: i64,
    files_succeeded: i64,
    files_failed: i64,
    outcome: Option<String>,
    error_text: Option<String>,
    duration_seconds: Option<i64>,
}

impl RunRow {
    fn into_entity(self) -> DomainResult<RunRecord> {
        let outcome = match self.outcome.as_deref() {
            Some(s) => Some(str_to_run_outcome(s).ok_or_else(|| {
                DomainError::Internal(format!("Invalid outcome {} in export_runs", s))
            })?),
            None => None,
        };

        Ok(RunRecord {
            id: parse_db_uuid(&self.id)?,
            job_id: parse_db_uuid(&self.job_id)?,
            job_name: self.job_name,
            started_at: parse_db_timestamp(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_db_timestamp).transpose()?,
            tables_attempted: self.tables_attempted,
            files_succeeded: self.files_succeeded,
            files_failed: self.files_failed,
            outcome,
            error_text: self.error_text,
            duration_seconds: self.duration_seconds,
        })
    }
}

const RUN_COLUMNS: &str = "id, job_id, job_name, started_at, ended_at, tables_attempted, files_succeeded, files_failed, outcome, error_text, duration_seconds";

pub struct SqliteRunHistoryStore {
    pool: SqlitePool,
}

impl SqliteRunHistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn find_any(&self, id: Uuid) -> DomainResult<Option<RunRecord>> {
        let row: Option<RunRow> = query_as(&format!("SELECT {} FROM export_runs WHERE id = ?", RUN_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(RunRow::into_entity).transpose()
    }
}

#[async_trait]
impl RunHistoryStore for SqliteRunHistoryStore {
    async fn start_run(&self, new_run: &NewRun) -> DomainResult<RunRecord> {
        let record = RunRecord {
            id: Uuid::new_v4(),
            job_id: new_run.job_id,
            job_name: new_run.job_name.clone(),
            started_at: new_run.started_at,
            ended_at: None,
            tables_attempted: 0,
            files_succeeded: 0,
            files_failed: 0,
            outcome: None,
            error_text: None,
            duration_seconds: None,
        };

        query("INSERT INTO export_runs (id, job_id, job_name, started_at) VALUES (?, ?, ?, ?)")
            .bind(record.id.to_string())
            .bind(record.job_id.to_string())
            .bind(&record.job_name)
            .bind(to_db_timestamp(&record.started_at))
            .execute(&self.pool)
            .await?;

        Ok(record)
    }

    async fn finalize_run(&self, id: Uuid, completion: &RunCompletion) -> DomainResult<RunRecord> {
        let result = query(
            "UPDATE export_runs SET ended_at = ?, tables_attempted = ?, files_succeeded = ?, files_failed = ?, outcome = ?, error_text = ?, duration_seconds = ? WHERE id = ? AND ended_at IS NULL"
        )
        .bind(to_db_timestamp(&completion.ended_at))
        .bind(completion.tables_attempted)
        .bind(completion.files_succeeded)
        .bind(completion.files_failed)
        .bind(completion.outcome.as_str())
        .bind(&completion.error_text)
        .bind(completion.duration_seconds)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.find_any(id).await? {
                Some(_) => Err(DomainError::Database(DbError::Conflict(format!(
                    "Run {} is already finalized", id
                )))),
                None => Err(DomainError::EntityNotFound("RunRecord".to_string(), id)),
            };
        }

        self.find_by_id(id).await
    }

    async fn find_by_id(&self, id: Uuid) -> DomainResult<RunRecord> {
        match self.find_any(id).await? {
            Some(record) if record.is_finalized() => Ok(record),
            _ => Err(DomainError::EntityNotFound("RunRecord".to_string(), id)),
        }
    }

    async fn list_all(&self) -> DomainResult<Vec<RunRecord>> {
        let rows: Vec<RunRow> = query_as(&format!(
            "SELECT {} FROM export_runs WHERE ended_at IS NOT NULL ORDER BY started_at DESC, rowid DESC",
            RUN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunRow::into_entity).collect()
    }

    async fn list_for_job(&self, job_id: Uuid) -> DomainResult<Vec<RunRecord>> {
        let rows: Vec<RunRow> = query_as(&format!(
            "SELECT {} FROM export_runs WHERE job_id = ? AND ended_at IS NOT NULL ORDER BY started_at DESC, rowid DESC",
            RUN_COLUMNS
        ))
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunRow::into_entity).collect()
    }

    async fn mark_stale_runs_failed(
        &self,
        reason: &str,
        started_before: DateTime<Utc>,
        live_jobs: &[String],
    ) -> DomainResult<u64> {
        let rows: Vec<RunRow> = query_as(&format!(
            "SELECT {} FROM export_runs WHERE ended_at IS NULL AND started_at < ?",
            RUN_COLUMNS
        ))
        .bind(to_db_timestamp(&started_before))
        .fetch_all(&self.pool)
        .await?;

        let mut marked = 0;
        for row in rows {
            let stale = row.into_entity()?;
            if live_jobs.contains(&stale.job_name) {
                log::debug!("Run {} of {} is still live elsewhere, left open", stale.id, stale.job_name);
                continue;
            }
            let ended_at = Utc::now().max(stale.started_at);
            let completion = RunCompletion {
                ended_at,
                tables_attempted: stale.tables_attempted,
                files_succeeded: stale.files_succeeded,
                files_failed: stale.files_failed,
                outcome: RunOutcome::Failure,
                error_text: Some(reason.to_string()),
                duration_seconds: (ended_at - stale.started_at).num_seconds(),
            };
            match self.finalize_run(stale.id, &completion).await {
                Ok(_) => {
                    log::warn!("Marked interrupted run {} of job {} as failed", stale.id, stale.job_name);
                    marked += 1;
                }
                // Finalized concurrently, nothing left to do
                Err(DomainError::Database(DbError::Conflict(_))) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(marked)
    }
}

#[derive(sqlx::FromRow)]
struct FileRow {
    id: String,
    run_id: String,
    table_name: String,
    file_name: String,
    outcome: String,
    error_text: Option<String>,
    recorded_at: String,
}

impl FileRow {
    fn into_entity(self) -> DomainResult<FileRecord> {
        let outcome = str_to_file_outcome(&self.outcome).ok_or_else(|| {
            DomainError::Internal(format!("Invalid outcome {} in export_run_files", self.outcome))
        })?;

        Ok(FileRecord {
            id: parse_db_uuid(&self.id)?,
            run_id: parse_db_uuid(&self.run_id)?,
            table_name: self.table_name,
            file_name: self.file_name,
            outcome,
            error_text: self.error_text,
            recorded_at: parse_db_timestamp(&self.recorded_at)?,
        })
    }
}

pub struct SqliteFileHistoryStore {
    pool: SqlitePool,
    error_text_max: usize,
}

impl SqliteFileHistoryStore {
    pub fn new(pool: SqlitePool, error_text_max: usize) -> Self {
        Self { pool, error_text_max }
    }
}

#[async_trait]
impl FileHistoryStore for SqliteFileHistoryStore {
    async fn record_file(&self, new_file: &NewFileRecord) -> DomainResult<FileRecord> {
        let record = FileRecord {
            id: Uuid::new_v4(),
            run_id: new_file.run_id,
            table_name: new_file.table_name.clone(),
            file_name: new_file.file_name.clone(),
            outcome: new_file.outcome,
            error_text: new_file
                .error_text
                .as_deref()
                .map(|text| truncate_chars(text, self.error_text_max)),
            recorded_at: Utc::now(),
        };

        query("INSERT INTO export_run_files (id, run_id, table_name, file_name, outcome, error_text, recorded_at) VALUES (?, ?, ?, ?, ?, ?, ?)")
            .bind(record.id.to_string())
            .bind(record.run_id.to_string())
            .bind(&record.table_name)
            .bind(&record.file_name)
            .bind(record.outcome.as_str())
            .bind(&record.error_text)
            .bind(to_db_timestamp(&record.recorded_at))
            .execute(&self.pool)
            .await?;

        Ok(record)
    }

    async fn list_for_run(&self, run_id: Uuid) -> DomainResult<Vec<FileRecord>> {
        let rows: Vec<FileRow> = query_as(
            "SELECT id, run_id, table_name, file_name, outcome, error_text, recorded_at FROM export_run_files WHERE run_id = ? ORDER BY recorded_at ASC, rowid ASC"
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FileRow::into_entity).collect()
    }

    async fn list_for_job(&self, job_id: Uuid) -> DomainResult<Vec<FileRecord>> {
        let rows: Vec<FileRow> = query_as(
            "SELECT f.id, f.run_id, f.table_name, f.file_name, f.outcome, f.error_text, f.recorded_at
             FROM export_run_files f
             JOIN export_runs r ON r.id = f.run_id
             WHERE r.job_id = ?
             ORDER BY r.started_at DESC, f.recorded_at ASC, f.rowid ASC"
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FileRow::into_entity).collect()
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: String,
    table_name: String,
    user_id: String,
    event: String,
    event_at: String,
    session_id: String,
    insert_count: i64,
    update_count: i64,
    delete_count: i64,
    reference_values: Option<String>,
}

impl AuditRow {
    fn into_entity(self) -> DomainResult<AuditEntry> {
        Ok(AuditEntry {
            id: parse_db_uuid(&self.id)?,
            table_name: self.table_name,
            user_id: self.user_id,
            event: self.event,
            event_at: parse_db_timestamp(&self.event_at)?,
            session_id: self.session_id,
            insert_count: self.insert_count,
            update_count: self.update_count,
            delete_count: self.delete_count,
            reference_values: self.reference_values,
        })
    }
}

pub struct SqliteAuditLogStore {
    pool: SqlitePool,
}

impl SqliteAuditLogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLogStore for SqliteAuditLogStore {
    async fn record(&self, entry: &NewAuditEntry) -> DomainResult<AuditEntry> {
        let audit = AuditEntry {
            id: Uuid::new_v4(),
            table_name: entry.table_name.clone(),
            user_id: entry.user_id.clone(),
            event: entry.event.clone(),
            event_at: Utc::now(),
            session_id: entry.session_id.clone(),
            insert_count: entry.insert_count,
            update_count: entry.update_count,
            delete_count: entry.delete_count,
            reference_values: entry.reference_values.clone(),
        };

        query("INSERT INTO audit_log (id, table_name, user_id, event, event_at, session_id, insert_count, update_count, delete_count, reference_values) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)")
            .bind(audit.id.to_string())
            .bind(&audit.table_name)
            .bind(&audit.user_id)
            .bind(&audit.event)
            .bind(to_db_timestamp(&audit.event_at))
            .bind(&audit.session_id)
            .bind(audit.insert_count)
            .bind(audit.update_count)
            .bind(audit.delete_count)
            .bind(&audit.reference_values)
            .execute(&self.pool)
            .await?;

        Ok(audit)
    }

    async fn list_for_table(&self, table_name: &str) -> DomainResult<Vec<AuditEntry>> {
        let rows: Vec<AuditRow> = query_as(
            "SELECT id, table_name, user_id, event, event_at, session_id, insert_count, update_count, delete_count, reference_values FROM audit_log WHERE table_name = ? ORDER BY event_at DESC, rowid DESC"
        )
        .bind(table_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditRow::into_entity).collect()
    }
}

/// Number of runs still open, used by start-up diagnostics
pub async fn count_unfinalized_runs(pool: &SqlitePool) -> DomainResult<i64> {
    let count: i64 = query_scalar("SELECT COUNT(*) FROM export_runs WHERE ended_at IS NULL")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
