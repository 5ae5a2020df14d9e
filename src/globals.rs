use lazy_static::lazy_static;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{ExportConfig, LockBackend};
use crate::db_migration;
use crate::domains::export::file_exporter::FileExporter;
use crate::domains::export::repository::{
    ExportTableRegistry, SqliteColumnOrderSource, SqliteTableGroupResolver, SqliteTableSource, TableBinding,
};
use crate::domains::export::service::ExportRunService;
use crate::domains::history::repository::{
    count_unfinalized_runs, AuditLogStore, FileHistoryStore, RunHistoryStore, SqliteAuditLogStore,
    SqliteFileHistoryStore, SqliteRunHistoryStore,
};
use crate::domains::scheduler::lock::{DistributedLock, InMemoryDistributedLock, LeasedLock, SqliteDistributedLock};
use crate::domains::scheduler::registry::JobRegistry;
use crate::domains::scheduler::repository::SqliteJobDefinitionRepository;
use crate::errors::{DomainError, ServiceError, ServiceResult};

// Global state definitions
lazy_static! {
    static ref INIT_MUTEX: tokio::sync::Mutex<()> = tokio::sync::Mutex::new(());
    static ref INITIALIZED: AtomicBool = AtomicBool::new(false);

    static ref DB_POOL: Mutex<Option<SqlitePool>> = Mutex::new(None);
    static ref CONFIG: Mutex<Option<ExportConfig>> = Mutex::new(None);

    // History
    static ref RUN_HISTORY_STORE: Mutex<Option<Arc<dyn RunHistoryStore>>> = Mutex::new(None);
    static ref FILE_HISTORY_STORE: Mutex<Option<Arc<dyn FileHistoryStore>>> = Mutex::new(None);
    static ref AUDIT_LOG_STORE: Mutex<Option<Arc<dyn AuditLogStore>>> = Mutex::new(None);

    // Scheduler
    static ref JOB_REGISTRY: Mutex<Option<Arc<JobRegistry>>> = Mutex::new(None);
}

fn read_slot<T: Clone>(slot: &Mutex<Option<T>>, name: &str) -> ServiceResult<T> {
    slot.lock()
        .map_err(|_| ServiceError::Domain(DomainError::Internal(format!("{} lock poisoned", name))))?
        .clone()
        .ok_or_else(|| ServiceError::Domain(DomainError::Internal(format!("{} not initialized", name))))
}

fn write_slot<T>(slot: &Mutex<Option<T>>, name: &str, value: T) -> ServiceResult<()> {
    let mut guard = slot
        .lock()
        .map_err(|_| ServiceError::Domain(DomainError::Internal(format!("{} lock poisoned", name))))?;
    *guard = Some(value);
    Ok(())
}

// --- Getter Functions ---

pub fn get_db_pool() -> ServiceResult<SqlitePool> {
    read_slot(&DB_POOL, "DB_POOL")
}

pub fn get_config() -> ServiceResult<ExportConfig> {
    read_slot(&CONFIG, "CONFIG")
}

pub fn get_job_registry() -> ServiceResult<Arc<JobRegistry>> {
    read_slot(&JOB_REGISTRY, "JOB_REGISTRY")
}

pub fn get_run_history_store() -> ServiceResult<Arc<dyn RunHistoryStore>> {
    read_slot(&RUN_HISTORY_STORE, "RUN_HISTORY_STORE")
}

pub fn get_file_history_store() -> ServiceResult<Arc<dyn FileHistoryStore>> {
    read_slot(&FILE_HISTORY_STORE, "FILE_HISTORY_STORE")
}

pub fn get_audit_log_store() -> ServiceResult<Arc<dyn AuditLogStore>> {
    read_slot(&AUDIT_LOG_STORE, "AUDIT_LOG_STORE")
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Wire every service once; later calls return immediately.
pub async fn initialize(config: ExportConfig) -> ServiceResult<()> {
    // Acquire the async mutex to ensure single initialization
    let _guard = INIT_MUTEX.lock().await;

    if INITIALIZED.load(Ordering::Acquire) {
        return Ok(());
    }

    let result = initialize_internal(config).await;

    // Mark as initialized only if successful
    if result.is_ok() {
        INITIALIZED.store(true, Ordering::Release);
    }

    result
}

async fn initialize_internal(config: ExportConfig) -> ServiceResult<()> {
    // Initialize logging first
    if std::env::var("RUST_LOG").is_err() {
        #[cfg(debug_assertions)]
        std::env::set_var("RUST_LOG", "debug");
        #[cfg(not(debug_assertions))]
        std::env::set_var("RUST_LOG", "info");
    }
    let _ = env_logger::try_init();

    config.validate()?;
    log::info!("Starting export scheduler initialization");
    log::debug!("Database URL: {}", config.database_url);
    log::debug!("Export directory template: {}", config.export_dir);
    log::debug!("Lock backend: {:?}", config.lock_backend);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .map_err(|e| {
            log::error!("Database connection failed: {}", e);
            ServiceError::Domain(DomainError::from(e))
        })?;
    log::info!("Database connection established");

    db_migration::initialize_database(&pool).await?;

    let open_runs = count_unfinalized_runs(&pool).await?;
    if open_runs > 0 {
        log::warn!("{} runs were left unfinalized by a previous process", open_runs);
    }

    // History
    let run_store: Arc<dyn RunHistoryStore> = Arc::new(SqliteRunHistoryStore::new(pool.clone()));
    let file_store: Arc<dyn FileHistoryStore> =
        Arc::new(SqliteFileHistoryStore::new(pool.clone(), config.error_text_max));
    let audit_store: Arc<dyn AuditLogStore> = Arc::new(SqliteAuditLogStore::new(pool.clone()));

    // Export pipeline: every catalog table is served by the default binding
    let tables = ExportTableRegistry::new().with_default(TableBinding::new(
        Arc::new(SqliteTableSource::new(pool.clone(), config.fetch_batch_size)),
        Arc::new(SqliteColumnOrderSource::new(pool.clone())),
    ));
    let exporter = FileExporter::new(tables, file_store.clone(), audit_store.clone(), &config.file_prefix);
    let run_service = Arc::new(ExportRunService::new(
        run_store.clone(),
        Arc::new(SqliteTableGroupResolver::new(pool.clone(), config.shared_group.clone())),
        Arc::new(exporter),
        config.run_settings(),
    ));

    // Scheduler
    let lock: Arc<dyn DistributedLock> = match config.lock_backend {
        LockBackend::Sqlite => Arc::new(SqliteDistributedLock::new(pool.clone())),
        LockBackend::Memory => Arc::new(InMemoryDistributedLock::new()),
    };
    let registry = JobRegistry::new(
        Arc::new(SqliteJobDefinitionRepository::new(pool.clone())),
        run_service,
        run_store.clone(),
        LeasedLock::new(lock, config.lease_policy()),
    );

    write_slot(&DB_POOL, "DB_POOL", pool)?;
    write_slot(&RUN_HISTORY_STORE, "RUN_HISTORY_STORE", run_store)?;
    write_slot(&FILE_HISTORY_STORE, "FILE_HISTORY_STORE", file_store)?;
    write_slot(&AUDIT_LOG_STORE, "AUDIT_LOG_STORE", audit_store)?;
    write_slot(&JOB_REGISTRY, "JOB_REGISTRY", registry)?;
    write_slot(&CONFIG, "CONFIG", config)?;

    log::info!("Export scheduler initialized");
    Ok(())
}
