pub mod types;
pub mod repository;

pub use types::*;
pub use repository::{
    AuditLogStore, FileHistoryStore, RunHistoryStore,
    SqliteAuditLogStore, SqliteFileHistoryStore, SqliteRunHistoryStore,
};
