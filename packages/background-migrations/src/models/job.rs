//! Job model: one bounded, independently retryable slice of a migration's key range.

use std::backtrace::BacktraceStatus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::migration::Migration;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "background_migration_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Enqueued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Legal edges of the job state machine.
    ///
    /// `Running -> Running` is a stuck job being re-dispatched and `Running -> Enqueued`
    /// is a failed attempt with attempts left. `Failed -> Enqueued` is an explicit retry.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, to),
            (Enqueued, Running)
                | (Running, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Enqueued)
                | (Failed, Enqueued)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub migration_id: Uuid,

    // Inclusive bounds
    pub min_value: i64,
    pub max_value: i64,

    pub status: JobStatus,
    pub attempts: i32,

    // Tuning frozen from the migration at creation
    pub batch_size: i64,
    pub sub_batch_size: i64,
    pub pause_ms: i64,
    pub max_attempts: i32,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    // Error tracking
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub backtrace: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build an enqueued job for `[min_value, max_value]` of `migration`.
    pub fn for_range(migration: &Migration, min_value: i64, max_value: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            migration_id: migration.id,
            min_value,
            max_value,
            status: JobStatus::Enqueued,
            attempts: 0,
            batch_size: migration.batch_size,
            sub_batch_size: migration.sub_batch_size,
            pause_ms: migration.sub_batch_pause_ms,
            max_attempts: migration.batch_max_attempts,
            started_at: None,
            finished_at: None,
            error_class: None,
            error_message: None,
            backtrace: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check bounds against the owning migration.
    pub fn validate(&self, migration: &Migration) -> Result<()> {
        if self.migration_id != migration.id {
            return Err(Error::Validation(format!(
                "job {} does not belong to migration {}",
                self.id, migration.id
            )));
        }
        if migration.composite {
            return Err(Error::CompositeMigration(migration.id));
        }
        if self.min_value > self.max_value {
            return Err(Error::Validation(format!(
                "job min_value ({}) must not exceed max_value ({})",
                self.min_value, self.max_value
            )));
        }
        if self.min_value < migration.min_value || self.max_value > migration.max_value {
            return Err(Error::Validation(format!(
                "job range [{}, {}] is outside migration range [{}, {}]",
                self.min_value, self.max_value, migration.min_value, migration.max_value
            )));
        }
        if self.sub_batch_size <= 0 || self.sub_batch_size > self.batch_size {
            return Err(Error::Validation(format!(
                "job sub_batch_size ({}) must be in 1..={}",
                self.sub_batch_size, self.batch_size
            )));
        }
        if self.max_attempts < 1 {
            return Err(Error::Validation("job max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn transition_to(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                record: "job",
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Reset a failed job so it is picked up again from scratch.
    pub fn retry(&mut self) -> Result<()> {
        if self.status != JobStatus::Failed {
            return Err(Error::InvalidTransition {
                record: "job",
                from: self.status.as_str(),
                to: JobStatus::Enqueued.as_str(),
            });
        }
        self.transition_to(JobStatus::Enqueued)?;
        self.attempts = 0;
        self.started_at = None;
        self.finished_at = None;
        self.clear_error();
        Ok(())
    }

    pub fn attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Running and silent for longer than the stuck threshold.
    pub fn is_stuck(&self, stuck_before: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.updated_at <= stuck_before
    }

    pub fn record_error(&mut self, error: &anyhow::Error) {
        self.error_class = Some(error_class(error));
        self.error_message = Some(format!("{:#}", error));
        let backtrace = error.backtrace();
        self.backtrace = match backtrace.status() {
            BacktraceStatus::Captured => Some(backtrace.to_string()),
            _ => None,
        };
    }

    pub fn clear_error(&mut self) {
        self.error_class = None;
        self.error_message = None;
        self.backtrace = None;
    }
}

/// Best-effort name of the concrete error type behind an `anyhow::Error`.
pub fn error_class(error: &anyhow::Error) -> String {
    if let Some(err) = error.downcast_ref::<Error>() {
        format!("background_migrations::Error::{}", err.class())
    } else if error.downcast_ref::<sqlx::Error>().is_some() {
        "sqlx::Error".to_string()
    } else if error.downcast_ref::<std::io::Error>().is_some() {
        "std::io::Error".to_string()
    } else if error.downcast_ref::<serde_json::Error>().is_some() {
        "serde_json::Error".to_string()
    } else {
        "anyhow::Error".to_string()
    }
}
