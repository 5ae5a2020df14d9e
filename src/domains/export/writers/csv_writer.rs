use crate::domains::export::types::{ExportRow, ExportValue};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

fn space_run_regex() -> &'static Regex {
    static SPACE_RUN_REGEX: OnceLock<Regex> = OnceLock::new();
    SPACE_RUN_REGEX.get_or_init(|| Regex::new(r" {2,}").unwrap())
}

#[derive(Clone, Debug)]
pub struct CsvConfig {
    pub delimiter: char,
    pub quote_char: char,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            delimiter: ',',
            quote_char: '"',
        }
    }
}

/// Turns one row into one delimited line, following a precomputed column order.
///
/// Never fails: a column missing from the row renders as an empty field.
#[derive(Clone, Debug, Default)]
pub struct CsvLineSerializer {
    config: CsvConfig,
}

impl CsvLineSerializer {
    pub fn new(config: CsvConfig) -> Self {
        Self { config }
    }

    pub fn header_line(&self, columns: &[String]) -> String {
        columns.join(&self.config.delimiter.to_string())
    }

    pub fn serialize_row(&self, columns: &[String], row: &ExportRow) -> String {
        let delimiter = self.config.delimiter.to_string();
        columns
            .iter()
            .map(|column| match row.get(column) {
                Some(value) => self.format_value(value),
                None => String::new(),
            })
            .collect::<Vec<_>>()
            .join(&delimiter)
    }

    pub fn format_value(&self, value: &ExportValue) -> String {
        match value {
            ExportValue::Null => String::new(),
            ExportValue::Text(text) => self.quote_text(text),
            ExportValue::Integer(i) => i.to_string(),
            ExportValue::Float(f) => f.to_string(),
            ExportValue::Bool(b) => b.to_string(),
            ExportValue::Decimal(d) if d.is_zero() => "0".to_string(),
            ExportValue::Decimal(d) => d.to_string(),
            ExportValue::DateTime(dt) => dt
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string()
                .replacen('T', " ", 1),
            ExportValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            ExportValue::Bytes(bytes) => hex::encode(bytes),
        }
    }

    fn quote_text(&self, text: &str) -> String {
        let quote = self.config.quote_char.to_string();
        let collapsed = space_run_regex().replace_all(text.trim(), " ");
        let escaped = collapsed.replace(&quote, &format!("{0}{0}", quote));
        format!("{0}{1}{0}", quote, escaped)
    }
}

/// Writes one export file: the header, then `\n` + line for every row.
///
/// The file carries no trailing newline, so a table without rows yields a
/// file holding the header alone.
pub struct CsvFileWriter {
    inner: BufWriter<File>,
    serializer: CsvLineSerializer,
    columns: Vec<String>,
    rows_written: u64,
}

impl CsvFileWriter {
    pub async fn create(path: &Path, columns: Vec<String>, serializer: CsvLineSerializer) -> std::io::Result<Self> {
        let file = File::create(path).await?;
        let mut inner = BufWriter::new(file);
        inner.write_all(serializer.header_line(&columns).as_bytes()).await?;
        Ok(Self {
            inner,
            serializer,
            columns,
            rows_written: 0,
        })
    }

    pub async fn write_row(&mut self, row: &ExportRow) -> std::io::Result<()> {
        let line = self.serializer.serialize_row(&self.columns, row);
        self.inner.write_all(b"\n").await?;
        self.inner.write_all(line.as_bytes()).await?;
        self.rows_written += 1;
        Ok(())
    }

    /// Flush and close; returns the number of data rows written.
    pub async fn finish(mut self) -> std::io::Result<u64> {
        self.inner.flush().await?;
        self.inner.get_mut().sync_all().await?;
        Ok(self.rows_written)
    }
}
