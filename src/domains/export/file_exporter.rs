use chrono::{Local, NaiveDate};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::domains::history::repository::{AuditLogStore, FileHistoryStore};
use crate::domains::history::types::{FileOutcome, NewAuditEntry, NewFileRecord};
use crate::errors::DomainResult;

use super::repository::ExportTableRegistry;
use super::types::{FileExportResult, TableDescriptor};
use super::writers::csv_writer::{CsvFileWriter, CsvLineSerializer};

/// `<prefix>_<table_lower>_<yyyyMMdd>.csv`
pub fn export_file_name(prefix: &str, table_name: &str, date: NaiveDate) -> String {
    format!("{}_{}_{}.csv", prefix, table_name.to_lowercase(), date.format("%Y%m%d"))
}

/// Catalog values sometimes carry stray line breaks
pub fn clean_table_name(raw: &str) -> String {
    raw.replace(['\r', '\n'], "").trim().to_string()
}

/// Writes one table's current contents to one file and records the outcome.
///
/// Failures are contained here: they are logged, recorded as a Failed
/// FileRecord, and reported through the returned result, never propagated.
pub struct FileExporter {
    tables: ExportTableRegistry,
    file_history: Arc<dyn FileHistoryStore>,
    audit_log: Arc<dyn AuditLogStore>,
    serializer: CsvLineSerializer,
    file_prefix: String,
}

impl FileExporter {
    pub fn new(
        tables: ExportTableRegistry,
        file_history: Arc<dyn FileHistoryStore>,
        audit_log: Arc<dyn AuditLogStore>,
        file_prefix: &str,
    ) -> Self {
        Self {
            tables,
            file_history,
            audit_log,
            serializer: CsvLineSerializer::default(),
            file_prefix: file_prefix.to_string(),
        }
    }

    pub fn with_serializer(mut self, serializer: CsvLineSerializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub async fn export_table(
        &self,
        table: &TableDescriptor,
        output_dir: &Path,
        run_id: Uuid,
    ) -> FileExportResult {
        let table_name = clean_table_name(&table.table_name);
        if table_name.is_empty() {
            log::warn!("Run {}: skipping table with empty name {:?}", run_id, table.table_name);
            return FileExportResult {
                table_name,
                file_name: None,
                outcome: FileOutcome::Failed,
                rows_written: 0,
                rows_truncated: None,
                error: Some("empty table name".to_string()),
            };
        }

        let file_name = export_file_name(&self.file_prefix, &table_name, Local::now().date_naive());
        let path = output_dir.join(&file_name);

        match self.write_table_file(&table_name, &path).await {
            Ok(rows_written) => {
                log::info!("Run {}: exported {} rows of {} to {}", run_id, rows_written, table_name, path.display());
                self.record(run_id, &table_name, &file_name, FileOutcome::Succeeded, None).await;

                let rows_truncated = if table.truncate_after_export {
                    self.truncate_after_export(&table_name, run_id).await
                } else {
                    None
                };

                FileExportResult {
                    table_name,
                    file_name: Some(file_name),
                    outcome: FileOutcome::Succeeded,
                    rows_written,
                    rows_truncated,
                    error: None,
                }
            }
            Err(e) => {
                log::error!("Run {}: export of {} failed: {}", run_id, table_name, e);
                let error = e.to_string();
                self.record(run_id, &table_name, &file_name, FileOutcome::Failed, Some(error.clone())).await;

                FileExportResult {
                    table_name,
                    file_name: Some(file_name),
                    outcome: FileOutcome::Failed,
                    rows_written: 0,
                    rows_truncated: None,
                    error: Some(error),
                }
            }
        }
    }

    async fn write_table_file(&self, table_name: &str, path: &Path) -> DomainResult<u64> {
        let binding = self.tables.binding_for(table_name)?;
        let columns = binding.columns.resolve_column_order(table_name).await?;
        let mut rows = binding.rows.fetch_rows(table_name).await?;

        let mut writer = CsvFileWriter::create(path, columns, self.serializer.clone()).await?;
        while let Some(row) = rows.next().await {
            writer.write_row(&row?).await?;
        }
        Ok(writer.finish().await?)
    }

    async fn truncate_after_export(&self, table_name: &str, run_id: Uuid) -> Option<u64> {
        let binding = match self.tables.binding_for(table_name) {
            Ok(binding) => binding,
            Err(e) => {
                log::error!("Run {}: cannot truncate {}: {}", run_id, table_name, e);
                return None;
            }
        };

        match binding.rows.truncate(table_name).await {
            Ok(deleted) => {
                log::info!("Run {}: truncated {} rows from {}", run_id, deleted, table_name);
                let entry = NewAuditEntry::scheduler_truncate(table_name, deleted, run_id);
                if let Err(e) = self.audit_log.record(&entry).await {
                    log::error!("Run {}: failed to audit truncate of {}: {}", run_id, table_name, e);
                }
                Some(deleted)
            }
            Err(e) => {
                log::error!("Run {}: truncate of {} failed: {}", run_id, table_name, e);
                None
            }
        }
    }

    async fn record(
        &self,
        run_id: Uuid,
        table_name: &str,
        file_name: &str,
        outcome: FileOutcome,
        error_text: Option<String>,
    ) {
        let record = NewFileRecord {
            run_id,
            table_name: table_name.to_string(),
            file_name: file_name.to_string(),
            outcome,
            error_text,
        };
        if let Err(e) = self.file_history.record_file(&record).await {
            log::error!("Run {}: failed to record file {}: {}", run_id, file_name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_migration::test_pool;
    use crate::domains::export::repository::{
        MockColumnOrderSource, MockTableRowSource, RowStream, TableBinding,
    };
    use crate::domains::export::types::ExportRow;
    use crate::domains::history::repository::{SqliteAuditLogStore, SqliteFileHistoryStore};
    use crate::errors::DomainError;
    use futures::stream;
    use sqlx::SqlitePool;

    fn rows_stream(rows: Vec<DomainResult<ExportRow>>) -> RowStream {
        Box::pin(stream::iter(rows))
    }

    fn exporter(pool: &SqlitePool, rows: MockTableRowSource, columns: MockColumnOrderSource) -> FileExporter {
        let registry = ExportTableRegistry::new()
            .with_default(TableBinding::new(Arc::new(rows), Arc::new(columns)));
        FileExporter::new(
            registry,
            Arc::new(SqliteFileHistoryStore::new(pool.clone(), 255)),
            Arc::new(SqliteAuditLogStore::new(pool.clone())),
            "DM",
        )
    }

    fn columns_returning(names: &'static [&'static str]) -> MockColumnOrderSource {
        let mut columns = MockColumnOrderSource::new();
        columns
            .expect_resolve_column_order()
            .returning(move |_| Ok(names.iter().map(|s| s.to_string()).collect()));
        columns
    }

    async fn start_run(pool: &SqlitePool) -> Uuid {
        use crate::domains::history::repository::{RunHistoryStore, SqliteRunHistoryStore};
        use crate::domains::history::types::NewRun;
        SqliteRunHistoryStore::new(pool.clone())
            .start_run(&NewRun { job_id: Uuid::new_v4(), job_name: "T".into(), started_at: chrono::Utc::now() })
            .await
            .unwrap()
            .id
    }

    #[test]
    fn test_file_naming() {
        let date = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        assert_eq!(export_file_name("DM", "CLAIMS_MAIN", date), "DM_claims_main_20240701.csv");
        assert_eq!(clean_table_name(" CLAIMS\r\n"), "CLAIMS");
        assert_eq!(clean_table_name("\r\n"), "");
    }

    #[tokio::test]
    async fn test_success_writes_file_and_records_it() {
        let pool = test_pool().await;
        let run_id = start_run(&pool).await;
        let dir = tempfile::tempdir().unwrap();

        let mut rows = MockTableRowSource::new();
        rows.expect_fetch_rows().returning(|_| {
            Ok(rows_stream(vec![
                Ok(ExportRow::new().with("ID", 1i64).with("NAME", "a")),
                Ok(ExportRow::new().with("ID", 2i64).with("NAME", "b")),
            ]))
        });
        rows.expect_truncate().never();

        let exporter = exporter(&pool, rows, columns_returning(&["ID", "NAME"]));
        let result = exporter.export_table(&TableDescriptor::new("CLAIMS"), dir.path(), run_id).await;

        assert!(result.succeeded());
        assert_eq!(result.rows_written, 2);
        let file_name = result.file_name.unwrap();
        assert!(file_name.starts_with("DM_claims_") && file_name.ends_with(".csv"));
        let content = std::fs::read_to_string(dir.path().join(&file_name)).unwrap();
        assert_eq!(content, "ID,NAME\n1,\"a\"\n2,\"b\"");

        let files = SqliteFileHistoryStore::new(pool, 255).list_for_run(run_id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].outcome, FileOutcome::Succeeded);
        assert_eq!(files[0].file_name, file_name);
    }

    #[tokio::test]
    async fn test_retrieval_failure_is_contained_and_recorded() {
        let pool = test_pool().await;
        let run_id = start_run(&pool).await;
        let dir = tempfile::tempdir().unwrap();

        let mut rows = MockTableRowSource::new();
        rows.expect_fetch_rows()
            .returning(|_| Err(DomainError::External("connection reset".into())));
        rows.expect_truncate().never();

        let exporter = exporter(&pool, rows, columns_returning(&["ID"]));
        let result = exporter
            .export_table(&TableDescriptor::new("CLAIMS").truncated_after_export(), dir.path(), run_id)
            .await;

        assert!(!result.succeeded());
        assert!(result.error.unwrap().contains("connection reset"));

        let files = SqliteFileHistoryStore::new(pool, 255).list_for_run(run_id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].outcome, FileOutcome::Failed);
        assert_eq!(Some(files[0].file_name.clone()), result.file_name);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_marks_file_failed() {
        let pool = test_pool().await;
        let run_id = start_run(&pool).await;
        let dir = tempfile::tempdir().unwrap();

        let mut rows = MockTableRowSource::new();
        rows.expect_fetch_rows().returning(|_| {
            Ok(rows_stream(vec![
                Ok(ExportRow::new().with("ID", 1i64)),
                Err(DomainError::Internal("decode failed".into())),
            ]))
        });

        let exporter = exporter(&pool, rows, columns_returning(&["ID"]));
        let result = exporter.export_table(&TableDescriptor::new("CLAIMS"), dir.path(), run_id).await;
        assert_eq!(result.outcome, FileOutcome::Failed);
    }

    #[tokio::test]
    async fn test_truncate_only_when_flagged_and_audited() {
        let pool = test_pool().await;
        let run_id = start_run(&pool).await;
        let dir = tempfile::tempdir().unwrap();

        let mut rows = MockTableRowSource::new();
        rows.expect_fetch_rows().returning(|_| Ok(rows_stream(vec![])));
        rows.expect_truncate()
            .withf(|table| table.eq_ignore_ascii_case("STAGING"))
            .times(1)
            .returning(|_| Ok(3));

        let exporter = exporter(&pool, rows, columns_returning(&["ID"]));
        let result = exporter
            .export_table(&TableDescriptor::new("STAGING").truncated_after_export(), dir.path(), run_id)
            .await;

        assert!(result.succeeded());
        assert_eq!(result.rows_truncated, Some(3));
        let content = std::fs::read_to_string(dir.path().join(result.file_name.unwrap())).unwrap();
        assert_eq!(content, "ID");

        let audit = SqliteAuditLogStore::new(pool).list_for_table("STAGING").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].delete_count, 3);
        assert_eq!(audit[0].event, "DEL");
    }

    #[tokio::test]
    async fn test_truncate_failure_does_not_fail_export() {
        let pool = test_pool().await;
        let run_id = start_run(&pool).await;
        let dir = tempfile::tempdir().unwrap();

        let mut rows = MockTableRowSource::new();
        rows.expect_fetch_rows().returning(|_| Ok(rows_stream(vec![])));
        rows.expect_truncate()
            .returning(|_| Err(DomainError::External("table locked".into())));

        let exporter = exporter(&pool, rows, columns_returning(&["ID"]));
        let result = exporter
            .export_table(&TableDescriptor::new("STAGING").truncated_after_export(), dir.path(), run_id)
            .await;

        assert!(result.succeeded());
        assert_eq!(result.rows_truncated, None);
        assert!(SqliteAuditLogStore::new(pool).list_for_table("STAGING").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_table_name_emits_no_file_record() {
        let pool = test_pool().await;
        let run_id = start_run(&pool).await;
        let dir = tempfile::tempdir().unwrap();

        let mut rows = MockTableRowSource::new();
        rows.expect_fetch_rows().never();
        let mut columns = MockColumnOrderSource::new();
        columns.expect_resolve_column_order().never();

        let exporter = exporter(&pool, rows, columns);
        let result = exporter.export_table(&TableDescriptor::new("\r\n"), dir.path(), run_id).await;

        assert!(!result.succeeded());
        assert!(result.file_name.is_none());
        assert!(SqliteFileHistoryStore::new(pool, 255).list_for_run(run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unwritable_directory_is_a_file_failure() {
        let pool = test_pool().await;
        let run_id = start_run(&pool).await;
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does").join("not").join("exist");

        let mut rows = MockTableRowSource::new();
        rows.expect_fetch_rows().returning(|_| Ok(rows_stream(vec![])));

        let exporter = exporter(&pool, rows, columns_returning(&["ID"]));
        let result = exporter.export_table(&TableDescriptor::new("CLAIMS"), &missing, run_id).await;
        assert_eq!(result.outcome, FileOutcome::Failed);
    }
}
