use std::sync::Arc;

// Public modules
pub mod config;
pub mod domains;
pub mod errors;
pub mod globals;
pub mod validation;

// Private modules
mod db_migration;
mod utils;

use config::ExportConfig;
use domains::scheduler::JobRegistry;
use errors::ServiceResult;

// Entry point for initialization
/// Wire the database, stores and job registry from `config`.
/// Must be called before any other function in the library.
pub async fn initialize(config: ExportConfig) -> ServiceResult<()> {
    globals::initialize(config).await
}

/// Get a reference to the SQLite connection pool
pub fn get_db_pool() -> ServiceResult<sqlx::SqlitePool> {
    globals::get_db_pool()
}

pub fn get_job_registry() -> ServiceResult<Arc<JobRegistry>> {
    globals::get_job_registry()
}
