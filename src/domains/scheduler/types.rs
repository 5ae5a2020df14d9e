use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domains::history::types::RunOutcome;
use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::validation::{Validate, ValidationBuilder};

use super::cron_engine::parse_cron_expression;

/// Whether a job currently has a live trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Stopped,
    Active,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Stopped => "stopped",
            JobStatus::Active => "active",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(JobStatus::Stopped),
            "active" => Some(JobStatus::Active),
            _ => None,
        }
    }
}

/// JobDefinition entity - a named, cron-driven export of one table group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: Uuid,
    pub name: String,
    pub cron_expression: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub target_group: String,
    pub processing_hint: Option<String>,
    pub status: JobStatus,
    pub last_run_outcome: Option<RunOutcome>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobDefinition {
    pub fn is_active(&self) -> bool {
        self.status == JobStatus::Active
    }

    pub fn trigger(&self) -> TriggerDefinition {
        TriggerDefinition {
            job_name: self.name.clone(),
            cron_expression: self.cron_expression.clone(),
            start_at: self.start_at,
            end_at: self.end_at,
        }
    }
}

/// What the cron engine needs to fire a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub job_name: String,
    pub cron_expression: String,
    pub start_at: DateTime<Utc>,
    /// None means open-ended
    pub end_at: Option<DateTime<Utc>>,
}

/// NewJobDefinition DTO - used when creating a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJobDefinition {
    pub name: String,
    pub cron_expression: String,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub target_group: String,
    pub processing_hint: Option<String>,
}

impl NewJobDefinition {
    pub fn new(name: &str, cron_expression: &str, target_group: &str) -> Self {
        Self {
            name: name.to_string(),
            cron_expression: cron_expression.to_string(),
            start_at: None,
            end_at: None,
            target_group: target_group.to_string(),
            processing_hint: None,
        }
    }
}

impl Validate for NewJobDefinition {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("name", Some(self.name.clone()))
            .required()
            .max_length(100)
            .job_name()
            .validate()?;

        validate_cron("cron_expression", &self.cron_expression)?;

        ValidationBuilder::new("target_group", Some(self.target_group.clone()))
            .required()
            .not_blank()
            .max_length(100)
            .validate()?;

        if let (Some(start), Some(end)) = (self.start_at, self.end_at) {
            ValidationBuilder::new("end_at", Some(end)).after(start).validate()?;
        }

        Ok(())
    }
}

/// UpdateJobDefinition DTO - every field optional, metadata only
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateJobDefinition {
    pub cron_expression: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears the end instant
    pub end_at: Option<Option<DateTime<Utc>>>,
    pub target_group: Option<String>,
    pub processing_hint: Option<Option<String>>,
}

impl Validate for UpdateJobDefinition {
    fn validate(&self) -> DomainResult<()> {
        if let Some(expression) = &self.cron_expression {
            validate_cron("cron_expression", expression)?;
        }

        if let Some(group) = &self.target_group {
            ValidationBuilder::new("target_group", Some(group.clone()))
                .required()
                .not_blank()
                .max_length(100)
                .validate()?;
        }

        if let (Some(start), Some(Some(end))) = (self.start_at, self.end_at) {
            ValidationBuilder::new("end_at", Some(end)).after(start).validate()?;
        }

        Ok(())
    }
}

fn validate_cron(field: &str, expression: &str) -> DomainResult<()> {
    ValidationBuilder::new(field, Some(expression.to_string()))
        .required()
        .not_blank()
        .validate()?;

    parse_cron_expression(expression)
        .map(|_| ())
        .map_err(|e| DomainError::Validation(ValidationError::format(field, &e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_job_validation() {
        assert!(NewJobDefinition::new("NIGHTLY", "0 0 2 * * ?", "Scheduler1").validate().is_ok());
        assert!(NewJobDefinition::new("nightly.claims-v2", "30 2 * * *", "Scheduler1").validate().is_ok());

        assert!(NewJobDefinition::new("", "0 0 2 * * ?", "Scheduler1").validate().is_err());
        assert!(NewJobDefinition::new("has space", "0 0 2 * * ?", "Scheduler1").validate().is_err());
        assert!(NewJobDefinition::new(&"x".repeat(101), "0 0 2 * * ?", "Scheduler1").validate().is_err());
        assert!(NewJobDefinition::new("NIGHTLY", "not a cron", "Scheduler1").validate().is_err());
        assert!(NewJobDefinition::new("NIGHTLY", "0 0 2 * * ?", "  ").validate().is_err());
    }

    #[test]
    fn test_end_must_follow_start() {
        let now = Utc::now();
        let mut job = NewJobDefinition::new("NIGHTLY", "0 0 2 * * ?", "Scheduler1");
        job.start_at = Some(now);
        job.end_at = Some(now - Duration::hours(1));
        assert!(job.validate().is_err());

        job.end_at = Some(now + Duration::hours(1));
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_update_validation() {
        assert!(UpdateJobDefinition::default().validate().is_ok());
        let update = UpdateJobDefinition {
            cron_expression: Some("61 * * * * *".into()),
            ..Default::default()
        };
        assert!(update.validate().is_err());
    }

    #[test]
    fn test_status_strings() {
        for status in [JobStatus::Stopped, JobStatus::Active] {
            assert_eq!(JobStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::from_str("paused"), None);
    }
}
