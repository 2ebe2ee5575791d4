//! Persisted records: migrations and their jobs.

pub mod job;
pub mod migration;

pub use job::{error_class, Job, JobStatus};
pub use migration::{
    JobCounts, Migration, MigrationStatus, NewMigration, Progress, COMPOSITE_SENTINEL,
};
