use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use futures::stream::Stream;
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{query, query_as, query_scalar, Column, Row, SqlitePool, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::validation::is_safe_identifier;

use super::types::{ExportRow, ExportValue, TableDescriptor};

/// Rows of one table, produced lazily page by page
pub type RowStream = Pin<Box<dyn Stream<Item = DomainResult<ExportRow>> + Send>>;

/// Display column order of a table
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ColumnOrderSource: Send + Sync {
    async fn resolve_column_order(&self, table: &str) -> DomainResult<Vec<String>>;
}

/// Row retrieval and cleanup for exported tables
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TableRowSource: Send + Sync {
    async fn fetch_rows(&self, table: &str) -> DomainResult<RowStream>;
    /// Empty the table; returns the number of rows removed.
    async fn truncate(&self, table: &str) -> DomainResult<u64>;
}

/// Maps a job's target grouping value to the tables it exports
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TableGroupResolver: Send + Sync {
    async fn resolve_tables_for_group(&self, group: &str) -> DomainResult<Vec<TableDescriptor>>;
}

/// Row source and column mapper serving one table
#[derive(Clone)]
pub struct TableBinding {
    pub rows: Arc<dyn TableRowSource>,
    pub columns: Arc<dyn ColumnOrderSource>,
}

impl TableBinding {
    pub fn new(rows: Arc<dyn TableRowSource>, columns: Arc<dyn ColumnOrderSource>) -> Self {
        Self { rows, columns }
    }
}

/// Table name to binding lookup, populated at start-up.
///
/// Adding an exportable table is a registration, not a code change. Tables
/// without an explicit binding use the default one when it is set.
#[derive(Clone, Default)]
pub struct ExportTableRegistry {
    bindings: HashMap<String, TableBinding>,
    default_binding: Option<TableBinding>,
}

impl ExportTableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, binding: TableBinding) -> Self {
        self.default_binding = Some(binding);
        self
    }

    pub fn register(&mut self, table: &str, binding: TableBinding) {
        self.bindings.insert(table.to_ascii_uppercase(), binding);
    }

    pub fn binding_for(&self, table: &str) -> DomainResult<TableBinding> {
        self.bindings
            .get(&table.to_ascii_uppercase())
            .or(self.default_binding.as_ref())
            .cloned()
            .ok_or_else(|| DomainError::Internal(format!("No export binding registered for table {}", table)))
    }
}

fn checked_identifier(table: &str) -> DomainResult<&str> {
    if is_safe_identifier(table) {
        Ok(table)
    } else {
        Err(DomainError::Validation(ValidationError::format(
            "table_name",
            &format!("'{}' is not a plain table identifier", table),
        )))
    }
}

/// Column order from `table_columns_order`, falling back to the physical order.
pub struct SqliteColumnOrderSource {
    pool: SqlitePool,
}

impl SqliteColumnOrderSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ColumnOrderSource for SqliteColumnOrderSource {
    async fn resolve_column_order(&self, table: &str) -> DomainResult<Vec<String>> {
        let table = checked_identifier(table)?;

        let configured: Vec<String> = query_scalar(
            "SELECT table_column FROM table_columns_order WHERE UPPER(table_name) = UPPER(?) ORDER BY column_order ASC, table_column ASC"
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        if !configured.is_empty() {
            return Ok(configured);
        }

        let physical: Vec<String> = query(&format!("PRAGMA table_info(\"{}\")", table))
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<_, _>>()?;

        if physical.is_empty() {
            return Err(DomainError::External(format!("Table {} does not exist", table)));
        }
        Ok(physical)
    }
}

/// Streams any table of the backing SQLite store as typed rows.
pub struct SqliteTableSource {
    pool: SqlitePool,
    batch_size: i64,
}

impl SqliteTableSource {
    pub fn new(pool: SqlitePool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: i64::try_from(batch_size.max(1)).unwrap_or(i64::MAX),
        }
    }
}

#[async_trait]
impl TableRowSource for SqliteTableSource {
    async fn fetch_rows(&self, table: &str) -> DomainResult<RowStream> {
        let table = checked_identifier(table)?.to_string();

        // Also surfaces a missing table here rather than as the first stream item
        let declared = declared_kinds(&self.pool, &table).await?;

        let (tx, rx) = mpsc::channel(self.batch_size.clamp(1, 1024) as usize);
        let pool = self.pool.clone();
        let batch_size = self.batch_size;

        tokio::spawn(async move {
            let sql = format!("SELECT * FROM \"{}\" ORDER BY rowid LIMIT ? OFFSET ?", table);
            let mut offset: i64 = 0;

            loop {
                let batch = query(&sql)
                    .bind(batch_size)
                    .bind(offset)
                    .fetch_all(&pool)
                    .await;

                match batch {
                    Ok(rows) => {
                        if rows.is_empty() {
                            break;
                        }
                        let fetched = rows.len() as i64;
                        for row in rows {
                            if tx.send(decode_row(&row, &declared)).await.is_err() {
                                return; // Receiver dropped
                            }
                        }
                        if fetched < batch_size {
                            break;
                        }
                        offset += fetched;
                        tokio::task::yield_now().await;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn truncate(&self, table: &str) -> DomainResult<u64> {
        let table = checked_identifier(table)?;
        let result = query(&format!("DELETE FROM \"{}\"", table))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeclaredKind {
    Bool,
    DateTime,
    Date,
    Decimal,
    Plain,
}

fn classify_declared(declared: &str) -> DeclaredKind {
    let declared = declared.to_ascii_uppercase();
    if declared.contains("BOOL") {
        DeclaredKind::Bool
    } else if declared.contains("DATETIME") || declared.contains("TIMESTAMP") {
        DeclaredKind::DateTime
    } else if declared == "DATE" {
        DeclaredKind::Date
    } else if declared.contains("DEC") || declared.contains("NUMERIC") || declared.contains("MONEY") {
        DeclaredKind::Decimal
    } else {
        DeclaredKind::Plain
    }
}

async fn declared_kinds(pool: &SqlitePool, table: &str) -> DomainResult<HashMap<String, DeclaredKind>> {
    let rows = query(&format!("PRAGMA table_info(\"{}\")", table))
        .fetch_all(pool)
        .await?;

    if rows.is_empty() {
        return Err(DomainError::External(format!("Table {} does not exist", table)));
    }

    rows.iter()
        .map(|row| -> DomainResult<(String, DeclaredKind)> {
            let name: String = row.try_get("name")?;
            let declared: String = row.try_get("type")?;
            Ok((name, classify_declared(&declared)))
        })
        .collect()
}

fn decode_row(row: &SqliteRow, declared: &HashMap<String, DeclaredKind>) -> DomainResult<ExportRow> {
    let mut export_row = ExportRow::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let kind = declared.get(column.name()).copied().unwrap_or(DeclaredKind::Plain);
        export_row.insert(column.name(), decode_value(row, idx, kind)?);
    }
    Ok(export_row)
}

/// Declared column type picks the rich variants; the storage class decides the rest.
fn decode_value(row: &SqliteRow, idx: usize, kind: DeclaredKind) -> DomainResult<ExportValue> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(ExportValue::Null);
    }
    let storage = raw.type_info().name().to_ascii_uppercase();

    let value = match (kind, storage.as_str()) {
        (DeclaredKind::Bool, "INTEGER") => ExportValue::Bool(row.try_get_unchecked::<i64, _>(idx)? != 0),
        (DeclaredKind::DateTime, "TEXT") => {
            let text: String = row.try_get_unchecked(idx)?;
            parse_datetime(&text).map(ExportValue::DateTime).unwrap_or(ExportValue::Text(text))
        }
        (DeclaredKind::Date, "TEXT") => {
            let text: String = row.try_get_unchecked(idx)?;
            NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                .map(ExportValue::Date)
                .unwrap_or(ExportValue::Text(text))
        }
        (DeclaredKind::Decimal, "INTEGER") => {
            ExportValue::Decimal(Decimal::from(row.try_get_unchecked::<i64, _>(idx)?))
        }
        (DeclaredKind::Decimal, "REAL") => {
            let f: f64 = row.try_get_unchecked(idx)?;
            Decimal::try_from(f).map(ExportValue::Decimal).unwrap_or(ExportValue::Float(f))
        }
        (DeclaredKind::Decimal, "TEXT") => {
            let text: String = row.try_get_unchecked(idx)?;
            Decimal::from_str(text.trim())
                .map(ExportValue::Decimal)
                .unwrap_or(ExportValue::Text(text))
        }
        (_, "INTEGER") => ExportValue::Integer(row.try_get_unchecked(idx)?),
        (_, "REAL") => ExportValue::Float(row.try_get_unchecked(idx)?),
        (_, "BLOB") => ExportValue::Bytes(row.try_get_unchecked(idx)?),
        _ => ExportValue::Text(row.try_get_unchecked(idx)?),
    };
    Ok(value)
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.naive_utc()))
}

/// Table groups from the `export_tables` catalog.
pub struct SqliteTableGroupResolver {
    pool: SqlitePool,
    shared_group: Option<String>,
}

impl SqliteTableGroupResolver {
    pub fn new(pool: SqlitePool, shared_group: Option<String>) -> Self {
        Self { pool, shared_group }
    }
}

#[async_trait]
impl TableGroupResolver for SqliteTableGroupResolver {
    async fn resolve_tables_for_group(&self, group: &str) -> DomainResult<Vec<TableDescriptor>> {
        #[derive(sqlx::FromRow)]
        struct CatalogRow {
            table_name: String,
            truncate_after_export: i64,
        }

        let shared = self.shared_group.as_deref().unwrap_or(group);
        let rows: Vec<CatalogRow> = query_as(
            "SELECT table_name, truncate_after_export FROM export_tables
             WHERE deleted = 0 AND csv_required = 1 AND (scheduler_group = ? OR scheduler_group = ?)
             ORDER BY id ASC"
        )
        .bind(group)
        .bind(shared)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| TableDescriptor {
                table_name: row.table_name,
                truncate_after_export: row.truncate_after_export != 0,
            })
            .collect())
    }
}
