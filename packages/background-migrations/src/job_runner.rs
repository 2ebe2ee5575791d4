//! Job runner: executes one job of a migration.
//!
//! ```text
//! JobRunner::run(job)
//!     │
//!     ├─► mark running (optimistic, against the status the orchestrator read)
//!     ├─► for each sub-batch of [min_value, max_value]:
//!     │       process_batch ─► heartbeat (+ lease renewal) ─► sleep pause_ms
//!     ├─► ok:  succeeded + "processed"
//!     └─► err: attempts += 1
//!              ├─ attempts left: enqueued + "retried"
//!              └─ exhausted:     failed + error handler (+ Error::Processing inline)
//! ```
//!
//! There is no in-process retry loop. A job put back to `enqueued` is picked up by a later
//! orchestrator step.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::batch::next_sub_batch;
use crate::config::Settings;
use crate::definition::{Batch, BackgroundMigration};
use crate::error::{Error, Result};
use crate::events::MigrationEvent;
use crate::models::{Job, JobStatus, Migration};
use crate::store::MigrationStore;

pub struct JobRunner {
    store: Arc<dyn MigrationStore>,
    settings: Settings,
    lease_owner: Option<String>,
}

impl JobRunner {
    pub fn new(store: Arc<dyn MigrationStore>, settings: Settings) -> Self {
        Self {
            store,
            settings,
            lease_owner: None,
        }
    }

    /// Renew the migration lease held by `owner` on every heartbeat.
    pub fn with_lease_owner(mut self, owner: impl Into<String>) -> Self {
        self.lease_owner = Some(owner.into());
        self
    }

    /// Run `job` to success or failure and return it as persisted.
    ///
    /// Processing failures are recorded on the job and only returned as
    /// [`Error::Processing`] when the job is exhausted and `run_inline` is set.
    #[instrument(skip_all, fields(job_id = %job.id, migration_id = %migration.id))]
    pub async fn run(
        &self,
        migration: &Migration,
        definition: &dyn BackgroundMigration,
        mut job: Job,
    ) -> Result<Job> {
        job.validate(migration)?;

        let expected = job.status;
        if job.status == JobStatus::Failed {
            job.transition_to(JobStatus::Enqueued)?;
        }
        job.transition_to(JobStatus::Running)?;
        if job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        job.finished_at = None;
        let job = self.store.update_job(&job, expected).await?;

        debug!(
            min_value = job.min_value,
            max_value = job.max_value,
            attempts = job.attempts,
            "running background migration job"
        );

        let started = Instant::now();
        match self.process(migration, definition, &job).await {
            Ok(()) => self.succeed(job, started.elapsed()).await,
            Err(err) => self.fail(job, err).await,
        }
    }

    async fn process(
        &self,
        migration: &Migration,
        definition: &dyn BackgroundMigration,
        job: &Job,
    ) -> anyhow::Result<()> {
        let keys = definition.relation(migration.shard.as_deref())?;
        let pause = Duration::from_millis(u64::try_from(job.pause_ms).unwrap_or(0));

        let mut cursor = None;
        while let Some(range) = next_sub_batch(keys.as_ref(), job, cursor).await? {
            if cursor.is_some() && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }

            let batch = Batch {
                migration_id: migration.id,
                job_id: job.id,
                shard: migration.shard.clone(),
                column: migration.batch_column_name.clone(),
                min_value: range.min_value,
                max_value: range.max_value,
            };

            let started = Instant::now();
            definition.process_batch(&batch).await?;
            self.settings.events.emit(&MigrationEvent::ProcessBatch {
                migration_id: migration.id,
                job_id: job.id,
                min_value: range.min_value,
                max_value: range.max_value,
                duration_ms: elapsed_ms(started.elapsed()),
            });

            self.heartbeat(migration, job).await?;
            cursor = Some(range.max_value);
        }

        Ok(())
    }

    async fn heartbeat(&self, migration: &Migration, job: &Job) -> Result<()> {
        self.store.touch_job(job.id).await?;

        let Some(owner) = &self.lease_owner else {
            return Ok(());
        };
        let renewed = self
            .store
            .try_lock_migration(migration.id, owner, self.settings.stuck_jobs_timeout)
            .await?;
        if !renewed {
            warn!(owner = %owner, "background migration lease taken by another runner");
        }
        Ok(())
    }

    async fn succeed(&self, mut job: Job, elapsed: Duration) -> Result<Job> {
        job.transition_to(JobStatus::Succeeded)?;
        job.finished_at = Some(Utc::now());
        job.clear_error();
        let job = self.store.update_job(&job, JobStatus::Running).await?;

        info!(
            min_value = job.min_value,
            max_value = job.max_value,
            "background migration job succeeded"
        );
        self.settings.events.emit(&MigrationEvent::Processed {
            migration_id: job.migration_id,
            job_id: job.id,
            min_value: job.min_value,
            max_value: job.max_value,
            duration_ms: elapsed_ms(elapsed),
        });

        Ok(job)
    }

    async fn fail(&self, mut job: Job, err: anyhow::Error) -> Result<Job> {
        job.attempts += 1;
        job.record_error(&err);

        if job.attempts_left() {
            job.transition_to(JobStatus::Enqueued)?;
            let job = self.store.update_job(&job, JobStatus::Running).await?;

            warn!(
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                error = %format!("{:#}", err),
                "background migration job failed, will retry"
            );
            self.settings.events.emit(&MigrationEvent::Retried {
                migration_id: job.migration_id,
                job_id: job.id,
                attempts: job.attempts,
                error: format!("{:#}", err),
            });
            return Ok(job);
        }

        job.transition_to(JobStatus::Failed)?;
        job.finished_at = Some(Utc::now());
        let job = self.store.update_job(&job, JobStatus::Running).await?;

        (self.settings.error_handler)(&err, &job);

        if self.settings.run_inline {
            return Err(Error::Processing {
                job_id: job.id,
                source: err,
            });
        }
        Ok(job)
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
