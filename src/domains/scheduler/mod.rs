pub mod types;
pub mod repository;
pub mod lock;
pub mod cron_engine;
pub mod registry;

pub use types::{JobDefinition, JobStatus, NewJobDefinition, TriggerDefinition, UpdateJobDefinition};
pub use repository::{JobDefinitionRepository, SqliteJobDefinitionRepository};
pub use lock::{DistributedLock, InMemoryDistributedLock, LeasePolicy, LeasedLock, SqliteDistributedLock};
pub use cron_engine::{CronEngine, TriggerListener};
pub use registry::JobRegistry;
