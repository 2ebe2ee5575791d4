//! Background migration model.
//!
//! A migration row is one logical data migration plus its run state. Composite
//! migrations own one child per shard and never run jobs themselves; their status is
//! derived from the children.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::job::{Job, JobStatus};
use crate::error::{Error, Result};

/// Range value used by composite parents, which are never iterated.
pub const COMPOSITE_SENTINEL: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "background_migration_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    #[default]
    Enqueued,
    Running,
    Paused,
    Failed,
    Succeeded,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
        }
    }

    /// Whether the scheduler may pick the migration up.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Enqueued | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Succeeded)
    }

    pub fn can_transition_to(&self, to: MigrationStatus) -> bool {
        use MigrationStatus::*;

        matches!(
            (self, to),
            (Enqueued, Running)
                | (Enqueued, Paused)
                | (Enqueued, Succeeded)
                | (Enqueued, Failed)
                | (Running, Paused)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Paused, Running)
                | (Failed, Enqueued)
        )
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MigrationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "enqueued" => Ok(Self::Enqueued),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "failed" => Ok(Self::Failed),
            "succeeded" => Ok(Self::Succeeded),
            other => Err(Error::Validation(format!(
                "unknown migration status '{}'",
                other
            ))),
        }
    }
}

#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,

    // Identity
    pub migration_name: String,
    pub arguments: serde_json::Value,
    pub shard: Option<String>,
    pub composite: bool,

    pub status: MigrationStatus,

    // Range
    pub batch_column_name: String,
    pub min_value: i64,
    pub max_value: i64,
    pub rows_count: Option<i64>,

    // Tuning
    pub batch_size: i64,
    pub sub_batch_size: i64,
    pub batch_pause_ms: i64,
    pub sub_batch_pause_ms: i64,
    pub batch_max_attempts: i32,

    // Lease
    pub locked_by: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,

    // Timestamps
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Attributes of a migration about to be created.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewMigration {
    pub migration_name: String,
    #[builder(default = serde_json::Value::Null)]
    pub arguments: serde_json::Value,
    #[builder(default)]
    pub shard: Option<String>,
    #[builder(default)]
    pub parent_id: Option<Uuid>,
    #[builder(default = false)]
    pub composite: bool,
    #[builder(default = "id".to_string())]
    pub batch_column_name: String,
    pub min_value: i64,
    pub max_value: i64,
    #[builder(default)]
    pub rows_count: Option<i64>,
    #[builder(default = 20_000)]
    pub batch_size: i64,
    #[builder(default = 1_000)]
    pub sub_batch_size: i64,
    #[builder(default = 0)]
    pub batch_pause_ms: i64,
    #[builder(default = 100)]
    pub sub_batch_pause_ms: i64,
    #[builder(default = 5)]
    pub batch_max_attempts: i32,
}

impl NewMigration {
    pub fn into_migration(self) -> Migration {
        let now = Utc::now();
        Migration {
            id: Uuid::now_v7(),
            parent_id: self.parent_id,
            migration_name: self.migration_name,
            arguments: self.arguments,
            shard: self.shard,
            composite: self.composite,
            status: MigrationStatus::Enqueued,
            batch_column_name: self.batch_column_name,
            min_value: self.min_value,
            max_value: self.max_value,
            rows_count: self.rows_count,
            batch_size: self.batch_size,
            sub_batch_size: self.sub_batch_size,
            batch_pause_ms: self.batch_pause_ms,
            sub_batch_pause_ms: self.sub_batch_pause_ms,
            batch_max_attempts: self.batch_max_attempts,
            locked_by: None,
            lock_expires_at: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-status job counts for one migration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub enqueued: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}

impl JobCounts {
    pub fn total(&self) -> i64 {
        self.enqueued + self.running + self.succeeded + self.failed
    }

    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut counts = Self::default();
        for job in jobs {
            match job.status {
                JobStatus::Enqueued => counts.enqueued += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

/// Queryable progress of a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub migration_id: Uuid,
    pub status: MigrationStatus,
    /// Percentage complete, `None` when nothing can be estimated.
    pub percentage: Option<f64>,
    pub jobs: JobCounts,
}

impl Migration {
    /// Validate the invariants that must hold before the row is persisted.
    pub fn validate(&self) -> Result<()> {
        if self.migration_name.trim().is_empty() {
            return Err(Error::Validation("migration name must not be empty".into()));
        }
        if self.batch_size <= 0 {
            return Err(Error::Validation(format!(
                "batch_size must be positive, got {}",
                self.batch_size
            )));
        }
        if self.sub_batch_size <= 0 {
            return Err(Error::Validation(format!(
                "sub_batch_size must be positive, got {}",
                self.sub_batch_size
            )));
        }
        if self.sub_batch_size > self.batch_size {
            return Err(Error::Validation(format!(
                "sub_batch_size ({}) must not exceed batch_size ({})",
                self.sub_batch_size, self.batch_size
            )));
        }
        if self.batch_pause_ms < 0 || self.sub_batch_pause_ms < 0 {
            return Err(Error::Validation("pauses must not be negative".into()));
        }
        if self.batch_max_attempts < 1 {
            return Err(Error::Validation(format!(
                "batch_max_attempts must be at least 1, got {}",
                self.batch_max_attempts
            )));
        }
        if !self.composite && self.min_value > self.max_value {
            return Err(Error::Validation(format!(
                "min_value ({}) must not exceed max_value ({})",
                self.min_value, self.max_value
            )));
        }
        Ok(())
    }

    /// Move to `to`, stamping lifecycle timestamps.
    pub fn transition_to(&mut self, to: MigrationStatus) -> Result<()> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                record: "migration",
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }

        let now = Utc::now();
        match to {
            MigrationStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(now);
            }
            MigrationStatus::Succeeded | MigrationStatus::Failed => {
                self.finished_at = Some(now);
            }
            MigrationStatus::Enqueued => {
                self.finished_at = None;
            }
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    pub fn is_child(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Key domain width covered by this migration.
    pub fn range_width(&self) -> i128 {
        self.max_value as i128 - self.min_value as i128 + 1
    }

    /// Progress of a non-composite migration, computed from its jobs.
    pub fn progress_from_jobs(&self, jobs: &[Job]) -> Progress {
        let counts = JobCounts::from_jobs(jobs);

        let percentage = if self.status == MigrationStatus::Succeeded {
            Some(100.0)
        } else if let Some(rows) = self.rows_count.filter(|rows| *rows > 0) {
            let done: i64 = jobs
                .iter()
                .filter(|job| job.status == JobStatus::Succeeded)
                .map(|job| job.batch_size)
                .sum();
            Some((done as f64 / rows as f64 * 100.0).min(100.0))
        } else if self.rows_count == Some(0) {
            Some(0.0)
        } else {
            let covered: i128 = jobs
                .iter()
                .filter(|job| job.status == JobStatus::Succeeded)
                .map(|job| job.max_value as i128 - job.min_value as i128 + 1)
                .sum();
            Some((covered as f64 / self.range_width() as f64 * 100.0).min(100.0))
        };

        Progress {
            migration_id: self.id,
            status: self.status,
            percentage,
            jobs: counts,
        }
    }
}
