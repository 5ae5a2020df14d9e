use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domains::history::types::{FileOutcome, RunOutcome};

/// One typed cell of a retrieved row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExportValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Decimal(Decimal),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Bytes(Vec<u8>),
}

impl From<&str> for ExportValue {
    fn from(value: &str) -> Self {
        ExportValue::Text(value.to_string())
    }
}

impl From<String> for ExportValue {
    fn from(value: String) -> Self {
        ExportValue::Text(value)
    }
}

impl From<i64> for ExportValue {
    fn from(value: i64) -> Self {
        ExportValue::Integer(value)
    }
}

impl From<Decimal> for ExportValue {
    fn from(value: Decimal) -> Self {
        ExportValue::Decimal(value)
    }
}

impl From<NaiveDateTime> for ExportValue {
    fn from(value: NaiveDateTime) -> Self {
        ExportValue::DateTime(value)
    }
}

impl<T: Into<ExportValue>> From<Option<T>> for ExportValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ExportValue::Null)
    }
}

/// Column name to value mapping for one row of an exported table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    values: HashMap<String, ExportValue>,
}

impl ExportRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: impl Into<ExportValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: &str, value: impl Into<ExportValue>) {
        self.values.insert(column.to_string(), value.into());
    }

    /// Exact match first, then a case-insensitive one; the column-order
    /// catalog and the physical schema do not always agree on case.
    pub fn get(&self, column: &str) -> Option<&ExportValue> {
        self.values.get(column).or_else(|| {
            self.values
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(column))
                .map(|(_, value)| value)
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A table selected for export by a job's target grouping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub table_name: String,
    pub truncate_after_export: bool,
}

impl TableDescriptor {
    pub fn new(table_name: &str) -> Self {
        Self { table_name: table_name.to_string(), truncate_after_export: false }
    }

    pub fn truncated_after_export(mut self) -> Self {
        self.truncate_after_export = true;
        self
    }
}

/// What happened to one table inside a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExportResult {
    pub table_name: String,
    /// None when the table name was unusable and nothing was attempted on disk
    pub file_name: Option<String>,
    pub outcome: FileOutcome,
    pub rows_written: u64,
    pub rows_truncated: Option<u64>,
    pub error: Option<String>,
}

impl FileExportResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == FileOutcome::Succeeded
    }
}

/// Run-scoped counters, owned by a single firing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub attempted: i64,
    pub succeeded: i64,
}

impl RunCounters {
    pub fn record(&mut self, result: &FileExportResult) {
        self.attempted += 1;
        if result.succeeded() {
            self.succeeded += 1;
        }
    }

    pub fn failed(&self) -> i64 {
        self.attempted - self.succeeded
    }
}

/// Returned to callers after a firing has been finalized
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRunSummary {
    pub run_id: Uuid,
    pub job_name: String,
    pub counters: RunCounters,
    pub outcome: RunOutcome,
    pub error_text: Option<String>,
    pub duration_seconds: i64,
    pub files: Vec<FileExportResult>,
}
