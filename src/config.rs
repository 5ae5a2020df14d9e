use std::str::FromStr;
use std::time::Duration;

use crate::domains::export::service::ExportRunSettings;
use crate::domains::scheduler::lock::LeasePolicy;
use crate::errors::{ServiceError, ServiceResult};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://export_scheduler.sqlite?mode=rwc";
pub const DEFAULT_EXPORT_DIR: &str = "exports/{date}";
pub const DEFAULT_FILE_PREFIX: &str = "DM";
pub const DEFAULT_ERROR_TEXT_MAX: usize = 255;
pub const DEFAULT_LOCK_AT_LEAST_SECS: u64 = 60;
pub const DEFAULT_LOCK_AT_MOST_SECS: u64 = 120;
pub const DEFAULT_FETCH_BATCH_SIZE: usize = 500;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

/// Where firing leases live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBackend {
    /// `scheduler_locks` table, shared by every instance on the same database
    Sqlite,
    /// Process-local only
    Memory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportConfig {
    pub database_url: String,
    pub export_dir: String,
    pub file_prefix: String,
    pub error_text_max: usize,
    pub shared_group: Option<String>,
    pub lock_backend: LockBackend,
    pub lock_at_least: Duration,
    pub lock_at_most: Duration,
    pub fetch_batch_size: usize,
    pub db_max_connections: u32,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            export_dir: DEFAULT_EXPORT_DIR.to_string(),
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            error_text_max: DEFAULT_ERROR_TEXT_MAX,
            shared_group: None,
            lock_backend: LockBackend::Sqlite,
            lock_at_least: Duration::from_secs(DEFAULT_LOCK_AT_LEAST_SECS),
            lock_at_most: Duration::from_secs(DEFAULT_LOCK_AT_MOST_SECS),
            fetch_batch_size: DEFAULT_FETCH_BATCH_SIZE,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
        }
    }
}

impl ExportConfig {
    /// Reads `EXPORT_*` variables from the process environment.
    pub fn from_env() -> ServiceResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> ServiceResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let lock_backend = match text("EXPORT_LOCK_BACKEND").as_deref() {
            None | Some("sqlite") => LockBackend::Sqlite,
            Some("memory") => LockBackend::Memory,
            Some(other) => {
                return Err(ServiceError::Configuration(format!(
                    "EXPORT_LOCK_BACKEND must be 'sqlite' or 'memory', got '{}'",
                    other
                )));
            }
        };

        let config = Self {
            database_url: text("EXPORT_DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            export_dir: text("EXPORT_DIR").unwrap_or_else(|| DEFAULT_EXPORT_DIR.to_string()),
            file_prefix: text("EXPORT_FILE_PREFIX").unwrap_or_else(|| DEFAULT_FILE_PREFIX.to_string()),
            error_text_max: number_or_default(&text, "EXPORT_ERROR_TEXT_MAX", DEFAULT_ERROR_TEXT_MAX),
            shared_group: text("EXPORT_SHARED_GROUP"),
            lock_backend,
            lock_at_least: Duration::from_secs(number_or_default(
                &text,
                "EXPORT_LOCK_AT_LEAST_SECS",
                DEFAULT_LOCK_AT_LEAST_SECS,
            )),
            lock_at_most: Duration::from_secs(number_or_default(
                &text,
                "EXPORT_LOCK_AT_MOST_SECS",
                DEFAULT_LOCK_AT_MOST_SECS,
            )),
            fetch_batch_size: number_or_default(&text, "EXPORT_FETCH_BATCH_SIZE", DEFAULT_FETCH_BATCH_SIZE),
            db_max_connections: number_or_default(&text, "EXPORT_DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ServiceResult<()> {
        if self.lock_at_least > self.lock_at_most {
            return Err(ServiceError::Configuration(format!(
                "lock hold minimum ({}s) exceeds its maximum ({}s)",
                self.lock_at_least.as_secs(),
                self.lock_at_most.as_secs()
            )));
        }
        if self.lock_at_most.is_zero() {
            return Err(ServiceError::Configuration("EXPORT_LOCK_AT_MOST_SECS must be positive".to_string()));
        }
        if self.fetch_batch_size == 0 || self.db_max_connections == 0 || self.error_text_max == 0 {
            return Err(ServiceError::Configuration(
                "batch size, pool size and error text length must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lease_policy(&self) -> LeasePolicy {
        LeasePolicy::new(self.lock_at_least, self.lock_at_most)
    }

    pub fn run_settings(&self) -> ExportRunSettings {
        ExportRunSettings {
            export_dir_template: self.export_dir.clone(),
            error_text_max: self.error_text_max,
        }
    }
}

fn number_or_default<T, F>(text: &F, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
    F: Fn(&str) -> Option<String>,
{
    match text(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            log::warn!("{} has invalid value '{}', using {}", key, raw, default);
            default
        }),
    }
}
