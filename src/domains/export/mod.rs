pub mod types;
pub mod writers;
pub mod repository;
pub mod file_exporter;
pub mod service;

pub use types::{ExportRow, ExportRunSummary, ExportValue, FileExportResult, RunCounters, TableDescriptor};
pub use writers::{CsvConfig, CsvFileWriter, CsvLineSerializer};
pub use repository::{
    ColumnOrderSource, ExportTableRegistry, SqliteColumnOrderSource, SqliteTableGroupResolver,
    SqliteTableSource, TableBinding, TableGroupResolver, TableRowSource,
};
pub use file_exporter::FileExporter;
pub use service::{ExportRunService, ExportRunSettings, ExportRunner, JobStatusWriter};
