//! Batched background data migrations for PostgreSQL.
//!
//! Large data changes (backfills, column copies) are split into bounded jobs over an
//! integer key range, persisted, retried and paced so they can run alongside production
//! traffic and survive restarts.
//!
//! # Architecture
//!
//! ```text
//! cron ─► Scheduler::run(shard, concurrency)
//!             │  throttler? interval elapsed?
//!             ▼
//!         MigrationRunner::run_migration_job      (per-migration lease)
//!             │  retry stuck/enqueued/failed job, or claim next range
//!             ▼
//!         JobRunner::run                          (sub-batches + pause)
//!             │
//!             ▼
//!         BackgroundMigration::process_batch      (user code, idempotent)
//! ```
//!
//! State lives in a [`MigrationStore`]: [`PostgresMigrationStore`] in production,
//! [`InMemoryMigrationStore`] for tests.

pub mod batch;
pub mod builtin;
pub mod config;
pub mod definition;
pub mod error;
pub mod events;
pub mod job_runner;
pub mod manager;
pub mod models;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod testing;

pub use batch::{compute_bounds, BatchRange, KeySource, TableRelation};
pub use config::{Config, Environment, Settings};
pub use definition::{Batch, BackgroundMigration};
pub use error::{Error, Result};
pub use events::{EventSink, MigrationEvent, TracingEventSink};
pub use job_runner::JobRunner;
pub use manager::{BackgroundMigrations, EnqueueOptions, EnqueueResult};
pub use models::{Job, JobCounts, JobStatus, Migration, MigrationStatus, NewMigration, Progress};
pub use registry::{MigrationRegistry, SharedMigrationRegistry};
pub use runner::MigrationRunner;
pub use scheduler::Scheduler;
pub use store::{InMemoryMigrationStore, MigrationStore, PostgresMigrationStore};
