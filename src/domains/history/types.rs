use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Final outcome of one firing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Success,
    Failure,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failure => "failure",
        }
    }
}

/// Outcome of one table's export attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileOutcome {
    Succeeded,
    Failed,
}

impl FileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOutcome::Succeeded => "succeeded",
            FileOutcome::Failed => "failed",
        }
    }
}

/// Row mapped to the `export_runs` table.
///
/// Created unfinalized when a firing starts; `ended_at`, `outcome` and
/// `duration_seconds` are filled in by the single finalize call. History
/// queries only ever return finalized runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub tables_attempted: i64,
    pub files_succeeded: i64,
    pub files_failed: i64,
    pub outcome: Option<RunOutcome>,
    pub error_text: Option<String>,
    pub duration_seconds: Option<i64>,
}

impl RunRecord {
    pub fn is_finalized(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// NewRun DTO - used when a firing starts
#[derive(Debug, Clone)]
pub struct NewRun {
    pub job_id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
}

/// Aggregates written by the one finalize call of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCompletion {
    pub ended_at: DateTime<Utc>,
    pub tables_attempted: i64,
    pub files_succeeded: i64,
    pub files_failed: i64,
    pub outcome: RunOutcome,
    pub error_text: Option<String>,
    pub duration_seconds: i64,
}

/// Row mapped to the `export_run_files` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub table_name: String,
    pub file_name: String,
    pub outcome: FileOutcome,
    pub error_text: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub run_id: Uuid,
    pub table_name: String,
    pub file_name: String,
    pub outcome: FileOutcome,
    pub error_text: Option<String>,
}

/// Write-once audit trail entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub table_name: String,
    pub user_id: String,
    pub event: String,
    pub event_at: DateTime<Utc>,
    pub session_id: String,
    pub insert_count: i64,
    pub update_count: i64,
    pub delete_count: i64,
    pub reference_values: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub table_name: String,
    pub user_id: String,
    pub event: String,
    pub session_id: String,
    pub insert_count: i64,
    pub update_count: i64,
    pub delete_count: i64,
    pub reference_values: Option<String>,
}

pub const AUDIT_EVENT_DELETE: &str = "DEL";
pub const AUDIT_ACTOR_SCHEDULER: &str = "CSV Scheduler";
pub const AUDIT_SESSION_BACKEND: &str = "Backend Process";

impl NewAuditEntry {
    /// Entry written after the scheduler empties a table it has just exported.
    pub fn scheduler_truncate(table_name: &str, deleted: u64, run_id: Uuid) -> Self {
        Self {
            table_name: table_name.to_string(),
            user_id: AUDIT_ACTOR_SCHEDULER.to_string(),
            event: AUDIT_EVENT_DELETE.to_string(),
            session_id: AUDIT_SESSION_BACKEND.to_string(),
            insert_count: 0,
            update_count: 0,
            delete_count: i64::try_from(deleted).unwrap_or(i64::MAX),
            reference_values: Some(run_id.to_string()),
        }
    }
}
