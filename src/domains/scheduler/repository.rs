use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::{query, query_as, SqlitePool};
use uuid::Uuid;

use crate::domains::history::types::RunOutcome;
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};
use crate::utils::{parse_db_timestamp, parse_db_uuid, to_db_timestamp};
use crate::validation::Validate;

use super::types::{JobDefinition, JobStatus, NewJobDefinition, UpdateJobDefinition};

/// Persistence of job definitions
#[async_trait]
pub trait JobDefinitionRepository: Send + Sync {
    async fn create(&self, new_job: &NewJobDefinition) -> DomainResult<JobDefinition>;
    async fn update(&self, id: Uuid, update: &UpdateJobDefinition) -> DomainResult<JobDefinition>;
    async fn delete(&self, id: Uuid) -> DomainResult<()>;
    async fn find_by_id(&self, id: Uuid) -> DomainResult<JobDefinition>;
    async fn find_by_name(&self, name: &str) -> DomainResult<Option<JobDefinition>>;
    /// Newest first
    async fn find_all(&self) -> DomainResult<Vec<JobDefinition>>;
    async fn find_by_status(&self, status: JobStatus) -> DomainResult<Vec<JobDefinition>>;
    /// Returns false when no job has this id.
    async fn set_status(&self, id: Uuid, status: JobStatus) -> DomainResult<bool>;
    /// Stores the last run's outcome; `reassert_active` also sets status Active.
    async fn record_run_outcome(
        &self,
        id: Uuid,
        outcome: RunOutcome,
        finished_at: DateTime<Utc>,
        reassert_active: bool,
    ) -> DomainResult<()>;
}

const JOB_COLUMNS: &str = "id, name, cron_expression, start_at, end_at, target_group, processing_hint, status, last_run_outcome, last_run_at, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    name: String,
    cron_expression: String,
    start_at: String,
    end_at: Option<String>,
    target_group: String,
    processing_hint: Option<String>,
    status: String,
    last_run_outcome: Option<String>,
    last_run_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn into_entity(self) -> DomainResult<JobDefinition> {
        let status = JobStatus::from_str(&self.status)
            .ok_or_else(|| DomainError::Internal(format!("Unknown job status '{}'", self.status)))?;
        let last_run_outcome = match self.last_run_outcome.as_deref() {
            Some("success") => Some(RunOutcome::Success),
            Some("failure") => Some(RunOutcome::Failure),
            Some(other) => {
                return Err(DomainError::Internal(format!("Unknown run outcome '{}'", other)));
            }
            None => None,
        };

        Ok(JobDefinition {
            id: parse_db_uuid(&self.id)?,
            name: self.name,
            cron_expression: self.cron_expression,
            start_at: parse_db_timestamp(&self.start_at)?,
            end_at: self.end_at.as_deref().map(parse_db_timestamp).transpose()?,
            target_group: self.target_group,
            processing_hint: self.processing_hint,
            status,
            last_run_outcome,
            last_run_at: self.last_run_at.as_deref().map(parse_db_timestamp).transpose()?,
            created_at: parse_db_timestamp(&self.created_at)?,
            updated_at: parse_db_timestamp(&self.updated_at)?,
        })
    }
}

fn map_unique_violation(error: sqlx::Error, name: &str) -> DomainError {
    match &error {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            DomainError::Database(DbError::Conflict(format!("Job with name {} already exists", name)))
        }
        _ => DomainError::from(error),
    }
}

pub struct SqliteJobDefinitionRepository {
    pool: SqlitePool,
}

impl SqliteJobDefinitionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobDefinitionRepository for SqliteJobDefinitionRepository {
    async fn create(&self, new_job: &NewJobDefinition) -> DomainResult<JobDefinition> {
        new_job.validate()?;

        // Stored timestamps keep microseconds
        let now = Utc::now().trunc_subsecs(6);
        let job = JobDefinition {
            id: Uuid::new_v4(),
            name: new_job.name.clone(),
            cron_expression: new_job.cron_expression.trim().to_string(),
            start_at: new_job.start_at.map(|t| t.trunc_subsecs(6)).unwrap_or(now),
            end_at: new_job.end_at.map(|t| t.trunc_subsecs(6)),
            target_group: new_job.target_group.trim().to_string(),
            processing_hint: new_job.processing_hint.clone(),
            status: JobStatus::Stopped,
            last_run_outcome: None,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        };

        query(
            "INSERT INTO export_jobs (id, name, cron_expression, start_at, end_at, target_group, processing_hint, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        )
        .bind(job.id.to_string())
        .bind(&job.name)
        .bind(&job.cron_expression)
        .bind(to_db_timestamp(&job.start_at))
        .bind(job.end_at.as_ref().map(to_db_timestamp))
        .bind(&job.target_group)
        .bind(&job.processing_hint)
        .bind(job.status.as_str())
        .bind(to_db_timestamp(&job.created_at))
        .bind(to_db_timestamp(&job.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &job.name))?;

        Ok(job)
    }

    async fn update(&self, id: Uuid, update: &UpdateJobDefinition) -> DomainResult<JobDefinition> {
        update.validate()?;

        let mut job = self.find_by_id(id).await?;
        if let Some(expression) = &update.cron_expression {
            job.cron_expression = expression.trim().to_string();
        }
        if let Some(start_at) = update.start_at {
            job.start_at = start_at.trunc_subsecs(6);
        }
        if let Some(end_at) = update.end_at {
            job.end_at = end_at.map(|t| t.trunc_subsecs(6));
        }
        if let Some(group) = &update.target_group {
            job.target_group = group.trim().to_string();
        }
        if let Some(hint) = &update.processing_hint {
            job.processing_hint = hint.clone();
        }
        if let Some(end) = job.end_at {
            if end <= job.start_at {
                return Err(DomainError::Validation(ValidationError::invalid_value(
                    "end_at",
                    "must be after start_at",
                )));
            }
        }
        job.updated_at = Utc::now().trunc_subsecs(6);

        query(
            "UPDATE export_jobs SET cron_expression = ?, start_at = ?, end_at = ?, target_group = ?, processing_hint = ?, updated_at = ?
             WHERE id = ?"
        )
        .bind(&job.cron_expression)
        .bind(to_db_timestamp(&job.start_at))
        .bind(job.end_at.as_ref().map(to_db_timestamp))
        .bind(&job.target_group)
        .bind(&job.processing_hint)
        .bind(to_db_timestamp(&job.updated_at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(job)
    }

    async fn delete(&self, id: Uuid) -> DomainResult<()> {
        let result = query("DELETE FROM export_jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::EntityNotFound("JobDefinition".to_string(), id));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> DomainResult<JobDefinition> {
        let row: Option<JobRow> = query_as(&format!("SELECT {} FROM export_jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::into_entity)
            .transpose()?
            .ok_or_else(|| DomainError::EntityNotFound("JobDefinition".to_string(), id))
    }

    async fn find_by_name(&self, name: &str) -> DomainResult<Option<JobDefinition>> {
        let row: Option<JobRow> = query_as(&format!("SELECT {} FROM export_jobs WHERE name = ?", JOB_COLUMNS))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::into_entity).transpose()
    }

    async fn find_all(&self) -> DomainResult<Vec<JobDefinition>> {
        let rows: Vec<JobRow> = query_as(&format!(
            "SELECT {} FROM export_jobs ORDER BY created_at DESC, rowid DESC",
            JOB_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_entity).collect()
    }

    async fn find_by_status(&self, status: JobStatus) -> DomainResult<Vec<JobDefinition>> {
        let rows: Vec<JobRow> = query_as(&format!(
            "SELECT {} FROM export_jobs WHERE status = ? ORDER BY created_at ASC, rowid ASC",
            JOB_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_entity).collect()
    }

    async fn set_status(&self, id: Uuid, status: JobStatus) -> DomainResult<bool> {
        let result = query("UPDATE export_jobs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(to_db_timestamp(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_run_outcome(
        &self,
        id: Uuid,
        outcome: RunOutcome,
        finished_at: DateTime<Utc>,
        reassert_active: bool,
    ) -> DomainResult<()> {
        let sql = if reassert_active {
            "UPDATE export_jobs SET last_run_outcome = ?, last_run_at = ?, updated_at = ?, status = 'active' WHERE id = ?"
        } else {
            "UPDATE export_jobs SET last_run_outcome = ?, last_run_at = ?, updated_at = ? WHERE id = ?"
        };
        let result = query(sql)
            .bind(outcome.as_str())
            .bind(to_db_timestamp(&finished_at))
            .bind(to_db_timestamp(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::EntityNotFound("JobDefinition".to_string(), id));
        }
        Ok(())
    }
}
