//! Programmatic API for background migrations.
//!
//! ```ignore
//! let migrations = BackgroundMigrations::new(store, registry, settings);
//!
//! // Define (idempotent on name + arguments)
//! let result = migrations
//!     .enqueue("backfill_column", EnqueueOptions::builder()
//!         .arguments(json!({"table": "users", "column": "active", "value": true}))
//!         .batch_size(10_000)
//!         .build())
//!     .await?;
//!
//! // From cron
//! migrations.scheduler().run(None, 1).await?;
//!
//! // Operate
//! migrations.progress(result.migration().id).await?;
//! migrations.pause(id).await?;
//! migrations.resume(id).await?;
//! migrations.retry_failed_jobs(id).await?;
//! ```

use std::sync::Arc;

use tracing::info;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::batch::compute_bounds;
use crate::config::Settings;
use crate::definition::BackgroundMigration;
use crate::error::{Error, Result};
use crate::models::{
    Job, JobCounts, JobStatus, Migration, MigrationStatus, NewMigration, Progress,
    COMPOSITE_SENTINEL,
};
use crate::registry::SharedMigrationRegistry;
use crate::runner::MigrationRunner;
use crate::scheduler::Scheduler;
use crate::store::MigrationStore;

/// Result of an enqueue, which is idempotent on name, arguments and shard.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// A new migration was created
    Created(Migration),
    /// The migration already existed
    Duplicate(Migration),
}

impl EnqueueResult {
    pub fn migration(&self) -> &Migration {
        match self {
            EnqueueResult::Created(m) | EnqueueResult::Duplicate(m) => m,
        }
    }

    pub fn into_migration(self) -> Migration {
        match self {
            EnqueueResult::Created(m) | EnqueueResult::Duplicate(m) => m,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Per-migration overrides. Unset tuning falls back to [`Settings`]; an unset range is
/// computed from the migration's relation.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct EnqueueOptions {
    #[builder(default = serde_json::Value::Null)]
    pub arguments: serde_json::Value,
    #[builder(default, setter(strip_option, into))]
    pub batch_column_name: Option<String>,
    #[builder(default, setter(strip_option))]
    pub min_value: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub max_value: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub batch_size: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub sub_batch_size: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub batch_pause_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub sub_batch_pause_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub batch_max_attempts: Option<i32>,
}

#[derive(Clone)]
pub struct BackgroundMigrations {
    store: Arc<dyn MigrationStore>,
    registry: SharedMigrationRegistry,
    settings: Settings,
}

impl BackgroundMigrations {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        registry: SharedMigrationRegistry,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn MigrationStore> {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn runner(&self) -> MigrationRunner {
        MigrationRunner::new(
            self.store.clone(),
            self.registry.clone(),
            self.settings.clone(),
        )
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.store.clone(), self.runner(), self.settings.clone())
    }

    /// Create a migration for the registered `name`.
    ///
    /// A definition spanning several shards becomes a composite parent with one child per
    /// shard. Bad ranges, tuning or relations are rejected here, before anything is stored.
    pub async fn enqueue(&self, name: &str, options: EnqueueOptions) -> Result<EnqueueResult> {
        let definition = self.registry.build(name, &options.arguments)?;
        let shards = definition.shards();
        let top_shard = match shards.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        };

        if let Some(existing) = self
            .store
            .find_migration_by_identity(name, &options.arguments, top_shard)
            .await?
        {
            return Ok(EnqueueResult::Duplicate(existing));
        }

        if shards.len() > 1 {
            return self
                .enqueue_composite(name, &options, definition.as_ref(), &shards)
                .await;
        }

        let migration = self
            .build_migration(name, &options, definition.as_ref(), top_shard)
            .await?;
        match self.store.insert_migration(&migration).await? {
            Some(migration) => {
                info!(
                    migration_id = %migration.id,
                    migration_name = %migration.migration_name,
                    min_value = migration.min_value,
                    max_value = migration.max_value,
                    "enqueued background migration"
                );
                Ok(EnqueueResult::Created(migration))
            }
            None => self.existing(name, &options.arguments, top_shard).await,
        }
    }

    async fn enqueue_composite(
        &self,
        name: &str,
        options: &EnqueueOptions,
        definition: &dyn BackgroundMigration,
        shards: &[String],
    ) -> Result<EnqueueResult> {
        // Build every child first so a bad shard rejects the whole migration.
        let mut children = Vec::with_capacity(shards.len());
        for shard in shards {
            children.push(
                self.build_migration(name, options, definition, Some(shard.as_str()))
                    .await?,
            );
        }

        let rows_count = children
            .iter()
            .map(|child| child.rows_count)
            .sum::<Option<i64>>();
        let mut parent = self.new_migration(name, options);
        parent.composite = true;
        parent.rows_count = rows_count;
        let parent = parent.into_migration();
        parent.validate()?;

        let Some(parent) = self.store.insert_composite(&parent, &children).await? else {
            return self.existing(name, &options.arguments, None).await;
        };

        info!(
            migration_id = %parent.id,
            migration_name = %parent.migration_name,
            shards = shards.len(),
            "enqueued composite background migration"
        );
        Ok(EnqueueResult::Created(parent))
    }

    async fn existing(
        &self,
        name: &str,
        arguments: &serde_json::Value,
        shard: Option<&str>,
    ) -> Result<EnqueueResult> {
        let migration = self
            .store
            .find_migration_by_identity(name, arguments, shard)
            .await?
            .ok_or_else(|| Error::Validation(format!("background migration {} vanished", name)))?;
        Ok(EnqueueResult::Duplicate(migration))
    }

    fn new_migration(
        &self,
        name: &str,
        options: &EnqueueOptions,
    ) -> NewMigration {
        NewMigration::builder()
            .migration_name(name)
            .arguments(options.arguments.clone())
            .batch_size(options.batch_size.unwrap_or(self.settings.batch_size))
            .sub_batch_size(options.sub_batch_size.unwrap_or(self.settings.sub_batch_size))
            .batch_pause_ms(options.batch_pause_ms.unwrap_or(self.settings.batch_pause_ms))
            .sub_batch_pause_ms(
                options
                    .sub_batch_pause_ms
                    .unwrap_or(self.settings.sub_batch_pause_ms),
            )
            .batch_max_attempts(
                options
                    .batch_max_attempts
                    .unwrap_or(self.settings.batch_max_attempts),
            )
            .min_value(COMPOSITE_SENTINEL)
            .max_value(COMPOSITE_SENTINEL)
            .build()
    }

    async fn build_migration(
        &self,
        name: &str,
        options: &EnqueueOptions,
        definition: &dyn BackgroundMigration,
        shard: Option<&str>,
    ) -> Result<Migration> {
        let keys = definition.relation(shard)?;
        keys.validate()?;

        let (min_value, max_value) = match (options.min_value, options.max_value) {
            (Some(min), Some(max)) => (min, max),
            (min, max) => {
                let (lo, hi) = compute_bounds(keys.as_ref()).await?.unwrap_or((1, 1));
                (min.unwrap_or(lo), max.unwrap_or(hi))
            }
        };

        let rows_count = definition.count(shard).await?;
        let column = options
            .batch_column_name
            .clone()
            .unwrap_or_else(|| keys.column().to_string());

        let mut new = self.new_migration(name, options);
        new.shard = shard.map(str::to_string);
        new.batch_column_name = column;
        new.min_value = min_value;
        new.max_value = max_value;
        new.rows_count = rows_count;

        let migration = new.into_migration();
        migration.validate()?;
        Ok(migration)
    }

    pub async fn find(&self, id: Uuid) -> Result<Migration> {
        self.store
            .find_migration(id)
            .await?
            .ok_or(Error::MigrationNotFound(id))
    }

    /// Top-level migrations, oldest first.
    pub async fn list(&self) -> Result<Vec<Migration>> {
        self.store.list_migrations().await
    }

    pub async fn children(&self, id: Uuid) -> Result<Vec<Migration>> {
        self.store.children(id).await
    }

    pub async fn jobs(&self, id: Uuid) -> Result<Vec<Job>> {
        self.store.jobs_for(id).await
    }

    /// Status, percentage complete and job counts. Composites average their children.
    pub async fn progress(&self, id: Uuid) -> Result<Progress> {
        let migration = self.find(id).await?;
        if !migration.composite {
            let jobs = self.store.jobs_for(id).await?;
            return Ok(migration.progress_from_jobs(&jobs));
        }

        let children = self.store.children(id).await?;
        let mut jobs = JobCounts::default();
        let mut percentages = Vec::with_capacity(children.len());
        for child in &children {
            let progress = child.progress_from_jobs(&self.store.jobs_for(child.id).await?);
            jobs.enqueued += progress.jobs.enqueued;
            jobs.running += progress.jobs.running;
            jobs.succeeded += progress.jobs.succeeded;
            jobs.failed += progress.jobs.failed;
            percentages.push(progress.percentage);
        }

        let percentage = if migration.status == MigrationStatus::Succeeded {
            Some(100.0)
        } else if percentages.is_empty() {
            None
        } else {
            percentages
                .iter()
                .copied()
                .sum::<Option<f64>>()
                .map(|total| total / percentages.len() as f64)
        };

        Ok(Progress {
            migration_id: migration.id,
            status: migration.status,
            percentage,
            jobs,
        })
    }

    /// Pause a migration. Composite migrations pause every active child too.
    ///
    /// A job already running is not interrupted.
    pub async fn pause(&self, id: Uuid) -> Result<Migration> {
        let migration = self.find(id).await?;
        if !migration.status.can_transition_to(MigrationStatus::Paused) {
            return Err(Error::InvalidTransition {
                record: "migration",
                from: migration.status.as_str(),
                to: MigrationStatus::Paused.as_str(),
            });
        }

        if migration.composite {
            for child in self.store.children(id).await? {
                if child.status.is_active() {
                    self.set_status(child, MigrationStatus::Paused).await?;
                }
            }
        }
        self.set_status(migration, MigrationStatus::Paused).await
    }

    /// Resume a paused migration and its paused children.
    pub async fn resume(&self, id: Uuid) -> Result<Migration> {
        let migration = self.find(id).await?;
        if migration.status != MigrationStatus::Paused {
            return Err(Error::InvalidTransition {
                record: "migration",
                from: migration.status.as_str(),
                to: MigrationStatus::Running.as_str(),
            });
        }

        if migration.composite {
            for child in self.store.children(id).await? {
                if child.status == MigrationStatus::Paused {
                    self.set_status(child, MigrationStatus::Running).await?;
                }
            }
        }
        self.set_status(migration, MigrationStatus::Running).await
    }

    /// Reset exhausted jobs and put failed migrations back in the queue.
    ///
    /// Returns the number of jobs reset.
    pub async fn retry_failed_jobs(&self, id: Uuid) -> Result<usize> {
        let migration = self.find(id).await?;
        let targets = if migration.composite {
            self.store.children(id).await?
        } else {
            vec![migration.clone()]
        };

        let mut reset = 0;
        for target in targets {
            for mut job in self.store.jobs_for(target.id).await? {
                if job.status != JobStatus::Failed {
                    continue;
                }
                job.retry()?;
                self.store.update_job(&job, JobStatus::Failed).await?;
                reset += 1;
            }
            if target.status == MigrationStatus::Failed {
                self.set_status(target, MigrationStatus::Enqueued).await?;
            }
        }

        let parent_id = if migration.composite {
            Some(migration.id)
        } else {
            migration.parent_id
        };
        if let Some(parent_id) = parent_id {
            let parent = self.find(parent_id).await?;
            if parent.status == MigrationStatus::Failed {
                self.set_status(parent, MigrationStatus::Enqueued).await?;
            }
        }

        info!(migration_id = %id, jobs = reset, "retrying failed background migration jobs");
        Ok(reset)
    }

    /// Delete a migration with its jobs and children.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let deleted = self.store.delete_migration(id).await?;
        if deleted {
            info!(migration_id = %id, "deleted background migration");
        }
        Ok(deleted)
    }

    /// Advance a migration by one job.
    pub async fn run_migration_job(&self, id: Uuid) -> Result<Option<Job>> {
        let migration = self.find(id).await?;
        self.runner().run_migration_job(&migration).await
    }

    /// Run a migration to completion. Refused in production.
    pub async fn run_all_migration_jobs(&self, id: Uuid) -> Result<()> {
        let migration = self.find(id).await?;
        self.runner().run_all_migration_jobs(&migration).await
    }

    async fn set_status(&self, mut migration: Migration, to: MigrationStatus) -> Result<Migration> {
        let expected = migration.status;
        migration.transition_to(to)?;
        let migration = self.store.update_migration(&migration, expected).await?;

        if !migration.composite && matches!(to, MigrationStatus::Paused | MigrationStatus::Running)
        {
            let definition = self
                .registry
                .build(&migration.migration_name, &migration.arguments)?;
            match to {
                MigrationStatus::Paused => definition.after_pause(&migration).await,
                _ => definition.after_resume(&migration).await,
            }
        }

        info!(
            migration_id = %migration.id,
            from = expected.as_str(),
            to = to.as_str(),
            "background migration status changed"
        );
        Ok(migration)
    }
}
