//! Scheduler: the periodic entry point.
//!
//! Meant to be called on a fixed cadence by cron or any recurring trigger, possibly from
//! several processes at once. Each tick picks up to `concurrency` runnable migrations and
//! advances each by one job.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, error, info};

use crate::config::Settings;
use crate::error::Result;
use crate::events::MigrationEvent;
use crate::models::Migration;
use crate::runner::MigrationRunner;
use crate::store::MigrationStore;

pub struct Scheduler {
    store: Arc<dyn MigrationStore>,
    runner: MigrationRunner,
    settings: Settings,
}

impl Scheduler {
    pub fn new(store: Arc<dyn MigrationStore>, runner: MigrationRunner, settings: Settings) -> Self {
        Self {
            store,
            runner,
            settings,
        }
    }

    /// Run one scheduling tick and return the number of jobs run.
    ///
    /// Failures of individual migrations are logged and do not stop the tick, unless
    /// `run_inline` is set.
    pub async fn run(&self, shard: Option<&str>, concurrency: usize) -> Result<usize> {
        if (self.settings.throttler)() {
            info!(shard = ?shard, "background migrations throttled");
            self.settings.events.emit(&MigrationEvent::Throttled {
                shard: shard.map(str::to_string),
            });
            return Ok(0);
        }

        let mut runnable = Vec::new();
        for migration in self.store.active_migrations(shard).await? {
            if runnable.len() >= concurrency {
                break;
            }
            if self.interval_elapsed(&migration).await? {
                runnable.push(migration);
            }
        }

        let mut dispatched = 0;
        for migration in &runnable {
            match self.runner.run_migration_job(migration).await {
                Ok(Some(job)) => {
                    debug!(
                        migration_id = %migration.id,
                        job_id = %job.id,
                        status = job.status.as_str(),
                        "dispatched background migration job"
                    );
                    dispatched += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    error!(
                        migration_id = %migration.id,
                        migration_name = %migration.migration_name,
                        error = %err,
                        "background migration step failed"
                    );
                    if self.settings.run_inline {
                        return Err(err);
                    }
                }
            }
        }

        Ok(dispatched)
    }

    /// Whether `migration` may get its next job: nothing is running for it (stuck jobs do
    /// not count) and `batch_pause_ms` has passed since any of its jobs last changed, so
    /// retries are paced like new jobs.
    pub async fn interval_elapsed(&self, migration: &Migration) -> Result<bool> {
        let now = Utc::now();
        let stuck_before = self.settings.stuck_before(now);

        if self
            .store
            .has_running_job(migration.id, stuck_before)
            .await?
        {
            return Ok(false);
        }

        if migration.batch_pause_ms <= 0 {
            return Ok(true);
        }

        match self.store.last_job_activity(migration.id).await? {
            Some(last) => Ok(last + Duration::milliseconds(migration.batch_pause_ms) <= now),
            None => Ok(true),
        }
    }
}
