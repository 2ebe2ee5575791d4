//! Migration orchestrator.
//!
//! One call to [`MigrationRunner::run_migration_job`] advances one migration by one job:
//!
//! ```text
//! run_migration_job(migration)
//!     │
//!     ├─► reload, reject composites, skip paused/terminal
//!     ├─► take per-migration lease (skip if another worker holds it)
//!     ├─► mark running (first time: after_start + "started")
//!     ├─► skip while a job is running and heartbeating
//!     ├─► job = stuck running ─► enqueued ─► failed with attempts left ─► next range
//!     ├─► Some(job): JobRunner::run(job)
//!     └─► None: finish ─► succeeded / failed ─► recompute parent
//! ```
//!
//! Mutual exclusion between schedulers comes from the lease on the migration row, so a
//! range is computed and a job is run by at most one worker at a time. A crashed holder's
//! lease expires after `stuck_jobs_timeout`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::next_range;
use crate::config::Settings;
use crate::definition::BackgroundMigration;
use crate::error::{Error, Result};
use crate::events::MigrationEvent;
use crate::job_runner::JobRunner;
use crate::models::{Job, JobStatus, Migration, MigrationStatus};
use crate::registry::SharedMigrationRegistry;
use crate::store::MigrationStore;

/// Attempts at recomputing a parent whose row changed underneath us.
const PARENT_REFRESH_ATTEMPTS: usize = 3;

/// Each runner takes migration leases under its own owner id.
pub struct MigrationRunner {
    store: Arc<dyn MigrationStore>,
    registry: SharedMigrationRegistry,
    settings: Settings,
    owner: String,
}

impl MigrationRunner {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        registry: SharedMigrationRegistry,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
            owner: format!("runner-{}", Uuid::new_v4()),
        }
    }

    /// Identity used for the migration lease.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Advance `migration` by one job.
    ///
    /// Returns the job that was run, or `None` when there was nothing to do: the migration
    /// is paused or finished, another worker holds its lease, a job is still running, or
    /// this step finished the migration.
    pub async fn run_migration_job(&self, migration: &Migration) -> Result<Option<Job>> {
        let migration = self
            .store
            .find_migration(migration.id)
            .await?
            .ok_or(Error::MigrationNotFound(migration.id))?;

        if migration.composite {
            return Err(Error::CompositeMigration(migration.id));
        }
        if !migration.status.is_active() {
            debug!(
                migration_id = %migration.id,
                status = migration.status.as_str(),
                "background migration is not active, skipping"
            );
            return Ok(None);
        }

        let locked = self
            .store
            .try_lock_migration(migration.id, &self.owner, self.settings.stuck_jobs_timeout)
            .await?;
        if !locked {
            debug!(migration_id = %migration.id, "background migration is locked by another worker");
            return Ok(None);
        }

        let id = migration.id;
        let result = self.step(migration).await;
        let unlocked = self.store.unlock_migration(id, &self.owner).await;

        let job = result?;
        unlocked?;
        Ok(job)
    }

    /// Run `migration` until it has no more work. Composite migrations run each child.
    ///
    /// Not allowed in production, where work must stay bounded per scheduler tick.
    pub async fn run_all_migration_jobs(&self, migration: &Migration) -> Result<()> {
        if self.settings.environment.is_production() {
            return Err(Error::NotForProduction("run_all_migration_jobs"));
        }

        let migration = self
            .store
            .find_migration(migration.id)
            .await?
            .ok_or(Error::MigrationNotFound(migration.id))?;

        if migration.composite {
            for child in self.store.children(migration.id).await? {
                self.run_to_completion(&child).await?;
            }
            return Ok(());
        }

        self.run_to_completion(&migration).await
    }

    async fn run_to_completion(&self, migration: &Migration) -> Result<()> {
        while self.run_migration_job(migration).await?.is_some() {}
        Ok(())
    }

    async fn step(&self, mut migration: Migration) -> Result<Option<Job>> {
        let definition = self
            .registry
            .build(&migration.migration_name, &migration.arguments)?;

        if migration.status == MigrationStatus::Enqueued {
            let first_start = migration.started_at.is_none();
            migration.transition_to(MigrationStatus::Running)?;
            migration = self
                .store
                .update_migration(&migration, MigrationStatus::Enqueued)
                .await?;

            if first_start {
                definition.after_start(&migration).await;
                self.settings.events.emit(&MigrationEvent::Started {
                    migration_id: migration.id,
                    migration_name: migration.migration_name.clone(),
                    shard: migration.shard.clone(),
                });
            }
        }

        let stuck_before = self.settings.stuck_before(Utc::now());
        if self
            .store
            .has_running_job(migration.id, stuck_before)
            .await?
        {
            debug!(migration_id = %migration.id, "waiting for running job to finish");
            return Ok(None);
        }

        match self.next_job(&migration, definition.as_ref(), stuck_before).await? {
            Some(job) => {
                let runner = JobRunner::new(self.store.clone(), self.settings.clone())
                    .with_lease_owner(self.owner.clone());
                let job = runner.run(&migration, definition.as_ref(), job).await?;
                Ok(Some(job))
            }
            None => {
                self.finish(migration, definition.as_ref()).await?;
                Ok(None)
            }
        }
    }

    async fn next_job(
        &self,
        migration: &Migration,
        definition: &dyn BackgroundMigration,
        stuck_before: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        if let Some(job) = self
            .store
            .next_retryable_job(migration.id, stuck_before)
            .await?
        {
            if job.status == JobStatus::Running {
                warn!(
                    migration_id = %migration.id,
                    job_id = %job.id,
                    last_heartbeat = %job.updated_at,
                    "re-dispatching stuck background migration job"
                );
            }
            return Ok(Some(job));
        }

        let keys = definition.relation(migration.shard.as_deref())?;
        let Some(range) = next_range(self.store.as_ref(), migration, keys.as_ref()).await? else {
            return Ok(None);
        };

        let job = Job::for_range(migration, range.min_value, range.max_value);
        job.validate(migration)?;
        let job = self.store.insert_job(&job).await?;

        debug!(
            migration_id = %migration.id,
            job_id = %job.id,
            min_value = job.min_value,
            max_value = job.max_value,
            "created background migration job"
        );
        Ok(Some(job))
    }

    async fn finish(
        &self,
        mut migration: Migration,
        definition: &dyn BackgroundMigration,
    ) -> Result<()> {
        let counts = self.store.job_counts(migration.id).await?;
        let status = if counts.failed > 0 {
            MigrationStatus::Failed
        } else {
            MigrationStatus::Succeeded
        };

        let expected = migration.status;
        migration.transition_to(status)?;
        let migration = self.store.update_migration(&migration, expected).await?;

        match status {
            MigrationStatus::Failed => {
                warn!(
                    migration_id = %migration.id,
                    failed_jobs = counts.failed,
                    "background migration failed"
                );
                definition.after_stop(&migration).await;
            }
            _ => {
                info!(
                    migration_id = %migration.id,
                    jobs = counts.total(),
                    "background migration succeeded"
                );
                definition.after_complete(&migration).await;
            }
        }
        self.emit_completed(&migration);

        if let Some(parent_id) = migration.parent_id {
            self.refresh_parent(parent_id).await?;
        }
        Ok(())
    }

    /// Derive a composite parent's status from its children.
    async fn refresh_parent(&self, parent_id: Uuid) -> Result<()> {
        for _ in 0..PARENT_REFRESH_ATTEMPTS {
            match self.try_refresh_parent(parent_id).await {
                Err(Error::StaleRecord { .. }) => continue,
                other => return other,
            }
        }
        warn!(migration_id = %parent_id, "gave up recomputing composite migration status");
        Ok(())
    }

    async fn try_refresh_parent(&self, parent_id: Uuid) -> Result<()> {
        let Some(mut parent) = self.store.find_migration(parent_id).await? else {
            return Ok(());
        };
        if parent.status == MigrationStatus::Paused || parent.status.is_terminal() {
            return Ok(());
        }

        let children = self.store.children(parent_id).await?;
        let expected = parent.status;

        if children.iter().all(|child| child.status.is_terminal()) {
            let status = if children
                .iter()
                .all(|child| child.status == MigrationStatus::Succeeded)
            {
                MigrationStatus::Succeeded
            } else {
                MigrationStatus::Failed
            };

            parent.transition_to(status)?;
            let parent = self.store.update_migration(&parent, expected).await?;
            info!(
                migration_id = %parent.id,
                status = parent.status.as_str(),
                "composite background migration finished"
            );
            self.emit_completed(&parent);
        } else if parent.status == MigrationStatus::Enqueued {
            parent.transition_to(MigrationStatus::Running)?;
            self.store.update_migration(&parent, expected).await?;
        }

        Ok(())
    }

    fn emit_completed(&self, migration: &Migration) {
        self.settings.events.emit(&MigrationEvent::Completed {
            migration_id: migration.id,
            migration_name: migration.migration_name.clone(),
            status: migration.status,
        });
    }
}
