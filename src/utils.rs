use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::errors::{DomainError, DomainResult};

/// Fixed-width RFC 3339 so that stored timestamps sort lexicographically.
pub fn to_db_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_db_timestamp(value: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DomainError::Internal(format!("Bad timestamp '{}': {}", value, e)))
}

pub fn parse_db_uuid(value: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| DomainError::InvalidUuid(format!("{}: {}", value, e)))
}

/// Cuts `text` to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
