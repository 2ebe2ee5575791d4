//! Durable storage for migrations and their jobs.
//!
//! The store holds no processing logic. Status updates are optimistic: callers pass the
//! status they read and a concurrent change surfaces as [`Error::StaleRecord`].
//!
//! [`Error::StaleRecord`]: crate::Error::StaleRecord

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Job, JobCounts, JobStatus, Migration, MigrationStatus};

pub use memory::InMemoryMigrationStore;
pub use postgres::PostgresMigrationStore;

#[async_trait]
pub trait MigrationStore: Send + Sync {
    // Migrations

    /// Insert a migration. Returns `None` when one with the same name, arguments and shard
    /// already exists.
    async fn insert_migration(&self, migration: &Migration) -> Result<Option<Migration>>;

    /// Insert a composite parent together with its children, all or nothing.
    ///
    /// Returns `None` when the parent already exists. A child that collides with an
    /// existing migration fails the whole insert with [`Error::Validation`].
    ///
    /// [`Error::Validation`]: crate::Error::Validation
    async fn insert_composite(
        &self,
        parent: &Migration,
        children: &[Migration],
    ) -> Result<Option<Migration>>;

    async fn find_migration(&self, id: Uuid) -> Result<Option<Migration>>;

    async fn find_migration_by_identity(
        &self,
        name: &str,
        arguments: &serde_json::Value,
        shard: Option<&str>,
    ) -> Result<Option<Migration>>;

    /// Top-level migrations (no parent), oldest first.
    async fn list_migrations(&self) -> Result<Vec<Migration>>;

    async fn children(&self, parent_id: Uuid) -> Result<Vec<Migration>>;

    /// Enqueued or running non-composite migrations, oldest first, optionally for one shard.
    async fn active_migrations(&self, shard: Option<&str>) -> Result<Vec<Migration>>;

    /// Persist status, range, estimate and timestamps if the stored status is `expected`.
    /// Lease columns are left untouched.
    async fn update_migration(
        &self,
        migration: &Migration,
        expected: MigrationStatus,
    ) -> Result<Migration>;

    /// Delete a migration with its jobs and children.
    async fn delete_migration(&self, id: Uuid) -> Result<bool>;

    /// Take the per-migration lease for `owner` unless someone else holds an unexpired one.
    async fn try_lock_migration(&self, id: Uuid, owner: &str, lease: Duration) -> Result<bool>;

    async fn unlock_migration(&self, id: Uuid, owner: &str) -> Result<()>;

    // Jobs

    async fn insert_job(&self, job: &Job) -> Result<Job>;

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>>;

    /// Persist the job if the stored status is `expected`.
    async fn update_job(&self, job: &Job, expected: JobStatus) -> Result<Job>;

    /// Heartbeat: bump `updated_at` of a running job.
    async fn touch_job(&self, id: Uuid) -> Result<()>;

    /// All jobs of a migration ordered by range.
    async fn jobs_for(&self, migration_id: Uuid) -> Result<Vec<Job>>;

    /// Highest claimed key of a migration.
    async fn max_job_value(&self, migration_id: Uuid) -> Result<Option<i64>>;

    /// Latest time any job of the migration was created, dispatched, heartbeated or
    /// finished.
    async fn last_job_activity(&self, migration_id: Uuid) -> Result<Option<DateTime<Utc>>>;

    /// Job to run again before claiming new range: a stuck running job, then an enqueued
    /// one, then a failed one with attempts left. Lowest range first within each group.
    async fn next_retryable_job(
        &self,
        migration_id: Uuid,
        stuck_before: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    async fn job_counts(&self, migration_id: Uuid) -> Result<JobCounts>;

    /// Whether a job is running and has heartbeated after `stuck_before`.
    async fn has_running_job(&self, migration_id: Uuid, stuck_before: DateTime<Utc>)
        -> Result<bool>;
}
