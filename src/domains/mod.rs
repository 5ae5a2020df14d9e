pub mod export;
pub mod history;
pub mod scheduler;

pub use export::{ExportRunService, FileExporter};
pub use scheduler::{JobDefinition, JobRegistry, JobStatus};
