use crate::errors::{ValidationError, DomainResult, DomainError};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

/// A trait that entities should implement for validation.
pub trait Validate {
    /// Validates the entity and returns an error if validation fails.
    fn validate(&self) -> DomainResult<()>;
}

// Common regex patterns
fn identifier_regex() -> &'static Regex {
    static IDENTIFIER_REGEX: OnceLock<Regex> = OnceLock::new();
    IDENTIFIER_REGEX.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap())
}

fn job_name_regex() -> &'static Regex {
    static JOB_NAME_REGEX: OnceLock<Regex> = OnceLock::new();
    JOB_NAME_REGEX.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap())
}

/// Returns true when `name` can be spliced into SQL as a quoted identifier.
pub fn is_safe_identifier(name: &str) -> bool {
    identifier_regex().is_match(name)
}

/// Struct for configuring validations in a fluent style
#[derive(Default)]
pub struct ValidationBuilder<T> {
    field_name: String,
    value: Option<T>,
    errors: Vec<ValidationError>,
}

/// Generic validation implementations
impl<T> ValidationBuilder<T> {
    pub fn new(field_name: &str, value: Option<T>) -> Self {
        Self {
            field_name: field_name.to_string(),
            value,
            errors: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self
    where T: Default + PartialEq {
        if self.value.is_none() || self.value == Some(T::default()) {
            self.errors.push(ValidationError::required(&self.field_name));
        }
        self
    }

    pub fn validate_with<F>(mut self, validator: F) -> Self
    where F: FnOnce(&T) -> Result<(), ValidationError> {
        if let Some(value) = &self.value {
            if let Err(err) = validator(value) {
                self.errors.push(err);
            }
        }
        self
    }

    /// Complete validation and return result
    pub fn validate(self) -> DomainResult<()> {
        match self.errors.into_iter().next() {
            None => Ok(()),
            // Return the first error for simplicity
            Some(first) => Err(DomainError::Validation(first)),
        }
    }
}

/// String-specific validations
impl ValidationBuilder<String> {
    pub fn max_length(mut self, max: usize) -> Self {
        if let Some(value) = &self.value {
            if value.chars().count() > max {
                self.errors.push(ValidationError::max_length(&self.field_name, max));
            }
        }
        self
    }

    pub fn matches_pattern(mut self, pattern: &Regex, message: &str) -> Self {
        if let Some(value) = &self.value {
            if !pattern.is_match(value) {
                self.errors.push(ValidationError::format(&self.field_name, message));
            }
        }
        self
    }

    pub fn not_blank(mut self) -> Self {
        if let Some(value) = &self.value {
            if value.trim().is_empty() {
                self.errors.push(ValidationError::required(&self.field_name));
            }
        }
        self
    }

    pub fn job_name(self) -> Self {
        self.matches_pattern(job_name_regex(), "may only contain letters, digits, '_', '.' and '-'")
    }
}

impl ValidationBuilder<DateTime<Utc>> {
    pub fn after(mut self, date: DateTime<Utc>) -> Self {
        if let Some(value) = &self.value {
            if value <= &date {
                self.errors.push(ValidationError::invalid_value(
                    &self.field_name,
                    &format!("must be after {}", date.to_rfc3339())
                ));
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_identifier_validation() {
        assert!(is_safe_identifier("CLAIMS_2024"));
        assert!(is_safe_identifier("_staging"));
        assert!(!is_safe_identifier("claims; DROP TABLE x"));
        assert!(!is_safe_identifier("1claims"));
        assert!(!is_safe_identifier(""));
    }

    #[test]
    fn test_validation_builder() {
        let result = ValidationBuilder::new("name", Some("".to_string()))
            .required()
            .validate();
        assert!(result.is_err());

        let result = ValidationBuilder::new("name", Some("   ".to_string()))
            .not_blank()
            .validate();
        assert!(result.is_err());

        let result = ValidationBuilder::new("name", Some("NIGHTLY-01".to_string()))
            .required()
            .max_length(100)
            .job_name()
            .validate();
        assert!(result.is_ok());

        let result = ValidationBuilder::new("name", Some("nightly job".to_string()))
            .job_name()
            .validate();
        assert!(matches!(
            result,
            Err(DomainError::Validation(ValidationError::Format { .. }))
        ));

        let result = ValidationBuilder::new("name", Some("x".repeat(101)))
            .max_length(100)
            .validate();
        assert!(matches!(
            result,
            Err(DomainError::Validation(ValidationError::MaxLength { max: 100, .. }))
        ));
    }

    #[test]
    fn test_date_after() {
        let start = Utc::now();
        assert!(ValidationBuilder::new("end_at", Some(start + Duration::hours(1)))
            .after(start)
            .validate()
            .is_ok());
        assert!(ValidationBuilder::new("end_at", Some(start))
            .after(start)
            .validate()
            .is_err());
    }
}
