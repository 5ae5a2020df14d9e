use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, SubsecRound, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::domains::history::repository::RunHistoryStore;
use crate::domains::history::types::{NewRun, RunCompletion, RunOutcome};
use crate::domains::scheduler::types::JobDefinition;
use crate::errors::{DomainResult, ServiceResult};
use crate::utils::truncate_chars;

use super::file_exporter::FileExporter;
use super::repository::TableGroupResolver;
use super::types::{ExportRunSummary, FileExportResult, RunCounters};

/// Receives the outcome of every finalized run.
#[async_trait]
pub trait JobStatusWriter: Send + Sync {
    async fn record_run_completion(
        &self,
        job: &JobDefinition,
        outcome: RunOutcome,
        finished_at: DateTime<Utc>,
    ) -> ServiceResult<()>;
}

/// One firing of a job
#[async_trait]
pub trait ExportRunner: Send + Sync {
    async fn execute(&self, job: &JobDefinition, status: &dyn JobStatusWriter) -> ServiceResult<ExportRunSummary>;
}

#[derive(Debug, Clone)]
pub struct ExportRunSettings {
    /// Directory template; `{date}` expands to the run day as `yyyyMMdd`
    pub export_dir_template: String,
    pub error_text_max: usize,
}

impl ExportRunSettings {
    pub fn export_dir_for(&self, date: NaiveDate) -> PathBuf {
        PathBuf::from(
            self.export_dir_template
                .replace("{date}", &date.format("%Y%m%d").to_string()),
        )
    }
}

impl Default for ExportRunSettings {
    fn default() -> Self {
        Self {
            export_dir_template: "exports/{date}".to_string(),
            error_text_max: 255,
        }
    }
}

/// Implementation of ExportRunner.
///
/// Tables are exported sequentially, so at most one output file is open at
/// a time. Counters live on the stack of `execute`, never on the service,
/// which keeps concurrent runs of different jobs independent.
pub struct ExportRunService {
    run_store: Arc<dyn RunHistoryStore>,
    group_resolver: Arc<dyn TableGroupResolver>,
    file_exporter: Arc<FileExporter>,
    settings: ExportRunSettings,
}

impl ExportRunService {
    pub fn new(
        run_store: Arc<dyn RunHistoryStore>,
        group_resolver: Arc<dyn TableGroupResolver>,
        file_exporter: Arc<FileExporter>,
        settings: ExportRunSettings,
    ) -> Self {
        Self {
            run_store,
            group_resolver,
            file_exporter,
            settings,
        }
    }

    async fn export_group(
        &self,
        job: &JobDefinition,
        run_id: Uuid,
        counters: &mut RunCounters,
        files: &mut Vec<FileExportResult>,
    ) -> DomainResult<()> {
        let tables = self.group_resolver.resolve_tables_for_group(&job.target_group).await?;
        log::info!("Run {} of {}: {} tables in group {}", run_id, job.name, tables.len(), job.target_group);

        let output_dir = self.settings.export_dir_for(Local::now().date_naive());
        tokio::fs::create_dir_all(&output_dir).await?;

        for table in &tables {
            let result = self.file_exporter.export_table(table, &output_dir, run_id).await;
            counters.record(&result);
            files.push(result);
        }
        Ok(())
    }
}

#[async_trait]
impl ExportRunner for ExportRunService {
    async fn execute(&self, job: &JobDefinition, status: &dyn JobStatusWriter) -> ServiceResult<ExportRunSummary> {
        // Stored timestamps keep microseconds; compute duration from the same values.
        let started_at = Utc::now().trunc_subsecs(6);
        let run = self
            .run_store
            .start_run(&NewRun {
                job_id: job.id,
                job_name: job.name.clone(),
                started_at,
            })
            .await?;

        let mut counters = RunCounters::default();
        let mut files = Vec::new();
        let body = self.export_group(job, run.id, &mut counters, &mut files).await;

        let ended_at = Utc::now().trunc_subsecs(6).max(started_at);
        let duration_seconds = (ended_at - started_at).num_seconds();

        let (outcome, error_text) = match body {
            Ok(()) => (RunOutcome::Success, None),
            Err(e) => {
                log::error!("Run {} of {} failed: {}", run.id, job.name, e);
                (RunOutcome::Failure, Some(truncate_chars(&e.to_string(), self.settings.error_text_max)))
            }
        };

        let completion = RunCompletion {
            ended_at,
            tables_attempted: counters.attempted,
            files_succeeded: counters.succeeded,
            files_failed: counters.failed(),
            outcome,
            error_text: error_text.clone(),
            duration_seconds,
        };
        let finalized = self.run_store.finalize_run(run.id, &completion).await;

        if let Err(e) = status.record_run_completion(job, outcome, ended_at).await {
            log::error!("Run {} of {}: status write-back failed: {}", run.id, job.name, e);
        }
        finalized?;

        log::info!(
            "Run {} of {} finished: {:?}, {} attempted, {} succeeded, {} failed in {}s",
            run.id,
            job.name,
            outcome,
            counters.attempted,
            counters.succeeded,
            counters.failed(),
            duration_seconds
        );

        Ok(ExportRunSummary {
            run_id: run.id,
            job_name: job.name.clone(),
            counters,
            outcome,
            error_text,
            duration_seconds,
            files,
        })
    }
}
