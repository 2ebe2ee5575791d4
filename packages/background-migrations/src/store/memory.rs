use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::MigrationStore;
use crate::error::{Error, Result};
use crate::models::{Job, JobCounts, JobStatus, Migration, MigrationStatus};

/// In-memory store for tests and single-process tooling.
///
/// Records are kept in insertion order, which matches creation order because ids are
/// time-ordered.
#[derive(Debug, Default)]
pub struct InMemoryMigrationStore {
    migrations: RwLock<Vec<Migration>>,
    jobs: RwLock<Vec<Job>>,
}

impl InMemoryMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored job.
    pub fn all_jobs(&self) -> Vec<Job> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Overwrite a job without any status check, to stage test scenarios.
    pub fn put_job(&self, job: Job) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job,
            None => jobs.push(job),
        }
    }

    fn descendants(migrations: &[Migration], id: Uuid) -> Vec<Uuid> {
        let mut ids = vec![id];
        let mut i = 0;
        while i < ids.len() {
            let parent = ids[i];
            ids.extend(
                migrations
                    .iter()
                    .filter(|m| m.parent_id == Some(parent))
                    .map(|m| m.id),
            );
            i += 1;
        }
        ids
    }
}

fn same_identity(a: &Migration, b: &Migration) -> bool {
    a.migration_name == b.migration_name && a.arguments == b.arguments && a.shard == b.shard
}

#[async_trait]
impl MigrationStore for InMemoryMigrationStore {
    async fn insert_migration(&self, migration: &Migration) -> Result<Option<Migration>> {
        let mut migrations = self.migrations.write().unwrap_or_else(|e| e.into_inner());
        if migrations.iter().any(|m| same_identity(m, migration)) {
            return Ok(None);
        }
        if let Some(parent_id) = migration.parent_id {
            if !migrations.iter().any(|m| m.id == parent_id) {
                return Err(Error::MigrationNotFound(parent_id));
            }
        }

        migrations.push(migration.clone());
        Ok(Some(migration.clone()))
    }

    async fn insert_composite(
        &self,
        parent: &Migration,
        children: &[Migration],
    ) -> Result<Option<Migration>> {
        let mut migrations = self.migrations.write().unwrap_or_else(|e| e.into_inner());
        if migrations.iter().any(|m| same_identity(m, parent)) {
            return Ok(None);
        }
        for (i, child) in children.iter().enumerate() {
            let taken = migrations.iter().any(|m| same_identity(m, child))
                || children[..i].iter().any(|c| same_identity(c, child));
            if taken {
                return Err(Error::Validation(format!(
                    "background migration {} already exists for shard {}",
                    child.migration_name,
                    child.shard.as_deref().unwrap_or_default()
                )));
            }
        }

        migrations.push(parent.clone());
        migrations.extend(children.iter().map(|child| Migration {
            parent_id: Some(parent.id),
            ..child.clone()
        }));
        Ok(Some(parent.clone()))
    }

    async fn find_migration(&self, id: Uuid) -> Result<Option<Migration>> {
        Ok(self
            .migrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }

    async fn find_migration_by_identity(
        &self,
        name: &str,
        arguments: &serde_json::Value,
        shard: Option<&str>,
    ) -> Result<Option<Migration>> {
        Ok(self
            .migrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|m| {
                m.migration_name == name && &m.arguments == arguments && m.shard.as_deref() == shard
            })
            .cloned())
    }

    async fn list_migrations(&self) -> Result<Vec<Migration>> {
        Ok(self
            .migrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.parent_id.is_none())
            .cloned()
            .collect())
    }

    async fn children(&self, parent_id: Uuid) -> Result<Vec<Migration>> {
        Ok(self
            .migrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn active_migrations(&self, shard: Option<&str>) -> Result<Vec<Migration>> {
        Ok(self
            .migrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.status.is_active() && !m.composite)
            .filter(|m| shard.is_none() || m.shard.as_deref() == shard)
            .cloned()
            .collect())
    }

    async fn update_migration(
        &self,
        migration: &Migration,
        expected: MigrationStatus,
    ) -> Result<Migration> {
        let mut migrations = self.migrations.write().unwrap_or_else(|e| e.into_inner());
        let stored = migrations
            .iter_mut()
            .find(|m| m.id == migration.id)
            .ok_or(Error::MigrationNotFound(migration.id))?;

        if stored.status != expected {
            return Err(Error::StaleRecord {
                record: "migration",
                id: migration.id,
            });
        }

        stored.status = migration.status;
        stored.min_value = migration.min_value;
        stored.max_value = migration.max_value;
        stored.rows_count = migration.rows_count;
        stored.started_at = migration.started_at;
        stored.finished_at = migration.finished_at;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn delete_migration(&self, id: Uuid) -> Result<bool> {
        let mut migrations = self.migrations.write().unwrap_or_else(|e| e.into_inner());
        if !migrations.iter().any(|m| m.id == id) {
            return Ok(false);
        }

        let doomed = Self::descendants(&migrations, id);
        migrations.retain(|m| !doomed.contains(&m.id));
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|j| !doomed.contains(&j.migration_id));
        Ok(true)
    }

    async fn try_lock_migration(&self, id: Uuid, owner: &str, lease: Duration) -> Result<bool> {
        let mut migrations = self.migrations.write().unwrap_or_else(|e| e.into_inner());
        let Some(migration) = migrations.iter_mut().find(|m| m.id == id) else {
            return Ok(false);
        };

        let now = Utc::now();
        let held_by_other = match (&migration.locked_by, migration.lock_expires_at) {
            (Some(holder), Some(expires)) => holder != owner && expires > now,
            _ => false,
        };
        if held_by_other {
            return Ok(false);
        }

        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365));
        migration.locked_by = Some(owner.to_string());
        migration.lock_expires_at = now.checked_add_signed(lease);
        Ok(true)
    }

    async fn unlock_migration(&self, id: Uuid, owner: &str) -> Result<()> {
        let mut migrations = self.migrations.write().unwrap_or_else(|e| e.into_inner());
        if let Some(migration) = migrations
            .iter_mut()
            .find(|m| m.id == id && m.locked_by.as_deref() == Some(owner))
        {
            migration.locked_by = None;
            migration.lock_expires_at = None;
        }
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<Job> {
        let exists = self
            .migrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|m| m.id == job.migration_id);
        if !exists {
            return Err(Error::MigrationNotFound(job.migration_id));
        }

        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(job.clone());
        Ok(job.clone())
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|j| j.id == id)
            .cloned())
    }

    async fn update_job(&self, job: &Job, expected: JobStatus) -> Result<Job> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let stored = jobs
            .iter_mut()
            .find(|j| j.id == job.id)
            .ok_or(Error::JobNotFound(job.id))?;

        if stored.status != expected {
            return Err(Error::StaleRecord {
                record: "job",
                id: job.id,
            });
        }

        *stored = job.clone();
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn touch_job(&self, id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs
            .iter_mut()
            .find(|j| j.id == id && j.status == JobStatus::Running)
        {
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn jobs_for(&self, migration_id: Uuid) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|j| j.migration_id == migration_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.min_value);
        Ok(jobs)
    }

    async fn max_job_value(&self, migration_id: Uuid) -> Result<Option<i64>> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|j| j.migration_id == migration_id)
            .map(|j| j.max_value)
            .max())
    }

    async fn last_job_activity(&self, migration_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|j| j.migration_id == migration_id)
            .map(|j| j.updated_at.max(j.created_at))
            .max())
    }

    async fn next_retryable_job(
        &self,
        migration_id: Uuid,
        stuck_before: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let jobs = self.jobs_for(migration_id).await?;

        let stuck = jobs.iter().find(|j| j.is_stuck(stuck_before));
        let enqueued = || jobs.iter().find(|j| j.status == JobStatus::Enqueued);
        let failed = || {
            jobs.iter()
                .find(|j| j.status == JobStatus::Failed && j.attempts_left())
        };

        Ok(stuck.or_else(enqueued).or_else(failed).cloned())
    }

    async fn job_counts(&self, migration_id: Uuid) -> Result<JobCounts> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(JobCounts::from_jobs(
            jobs.iter().filter(|j| j.migration_id == migration_id),
        ))
    }

    async fn has_running_job(
        &self,
        migration_id: Uuid,
        stuck_before: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|j| {
                j.migration_id == migration_id
                    && j.status == JobStatus::Running
                    && j.updated_at > stuck_before
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMigration;

    fn migration(name: &str) -> Migration {
        NewMigration::builder()
            .migration_name(name)
            .min_value(1)
            .max_value(100)
            .batch_size(10)
            .sub_batch_size(10)
            .build()
            .into_migration()
    }

    #[tokio::test]
    async fn duplicate_identity_is_not_inserted() {
        let store = InMemoryMigrationStore::new();
        assert!(store.insert_migration(&migration("a")).await.unwrap().is_some());
        assert!(store.insert_migration(&migration("a")).await.unwrap().is_none());
        assert!(store.insert_migration(&migration("b")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_status_is_rejected() {
        let store = InMemoryMigrationStore::new();
        let mut m = store
            .insert_migration(&migration("a"))
            .await
            .unwrap()
            .unwrap();
        m.transition_to(MigrationStatus::Running).unwrap();
        store
            .update_migration(&m, MigrationStatus::Enqueued)
            .await
            .unwrap();

        // Second writer still believes the migration is enqueued
        let err = store
            .update_migration(&m, MigrationStatus::Enqueued)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StaleRecord { .. }));
    }

    #[tokio::test]
    async fn lease_excludes_other_owners_until_released() {
        let store = InMemoryMigrationStore::new();
        let m = store
            .insert_migration(&migration("a"))
            .await
            .unwrap()
            .unwrap();
        let lease = Duration::from_secs(60);

        assert!(store.try_lock_migration(m.id, "worker-1", lease).await.unwrap());
        assert!(!store.try_lock_migration(m.id, "worker-2", lease).await.unwrap());

        store.unlock_migration(m.id, "worker-2").await.unwrap();
        assert!(!store.try_lock_migration(m.id, "worker-2", lease).await.unwrap());

        store.unlock_migration(m.id, "worker-1").await.unwrap();
        assert!(store.try_lock_migration(m.id, "worker-2", lease).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = InMemoryMigrationStore::new();
        let m = store
            .insert_migration(&migration("a"))
            .await
            .unwrap()
            .unwrap();

        assert!(store
            .try_lock_migration(m.id, "crashed", Duration::ZERO)
            .await
            .unwrap());
        assert!(store
            .try_lock_migration(m.id, "worker", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_cascades_to_children_and_jobs() {
        let store = InMemoryMigrationStore::new();
        let parent = store
            .insert_migration(&migration("parent"))
            .await
            .unwrap()
            .unwrap();
        let child = NewMigration::builder()
            .migration_name("parent")
            .shard(Some("shard_1".to_string()))
            .parent_id(Some(parent.id))
            .min_value(1)
            .max_value(10)
            .batch_size(10)
            .sub_batch_size(10)
            .build()
            .into_migration();
        let child = store.insert_migration(&child).await.unwrap().unwrap();
        store
            .insert_job(&Job::for_range(&child, 1, 10))
            .await
            .unwrap();

        assert!(store.delete_migration(parent.id).await.unwrap());
        assert!(store.find_migration(child.id).await.unwrap().is_none());
        assert!(store.all_jobs().is_empty());
        assert!(!store.delete_migration(parent.id).await.unwrap());
    }

    #[tokio::test]
    async fn retry_candidates_prefer_stuck_then_enqueued_then_failed() {
        let store = InMemoryMigrationStore::new();
        let m = store
            .insert_migration(&migration("a"))
            .await
            .unwrap()
            .unwrap();

        let mut failed = Job::for_range(&m, 1, 10);
        failed.status = JobStatus::Failed;
        failed.attempts = 1;
        let enqueued = Job::for_range(&m, 11, 20);
        let mut stuck = Job::for_range(&m, 21, 30);
        stuck.status = JobStatus::Running;
        for job in [&failed, &enqueued, &stuck] {
            store.insert_job(job).await.unwrap();
        }

        let now = Utc::now();
        let cutoff_in_past = now - chrono::Duration::hours(1);
        let cutoff_in_future = now + chrono::Duration::hours(1);

        let next = store.next_retryable_job(m.id, cutoff_in_future).await.unwrap();
        assert_eq!(next.map(|j| j.id), Some(stuck.id));

        let next = store.next_retryable_job(m.id, cutoff_in_past).await.unwrap();
        assert_eq!(next.map(|j| j.id), Some(enqueued.id));
        assert!(store.has_running_job(m.id, cutoff_in_past).await.unwrap());
    }

    fn shard(name: &str, shard: &str) -> Migration {
        Migration {
            shard: Some(shard.to_string()),
            ..migration(name)
        }
    }

    #[tokio::test]
    async fn composite_with_taken_child_inserts_nothing() {
        let store = InMemoryMigrationStore::new();
        store.insert_migration(&shard("a", "west")).await.unwrap();
        let parent = Migration {
            composite: true,
            ..migration("a")
        };
        let children = [shard("a", "east"), shard("a", "west")];

        let err = store.insert_composite(&parent, &children).await.unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert!(store.find_migration(parent.id).await.unwrap().is_none());
        assert!(store.find_migration(children[0].id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn composite_links_children_to_parent() {
        let store = InMemoryMigrationStore::new();
        let parent = Migration {
            composite: true,
            ..migration("a")
        };
        let children = [shard("a", "east"), shard("a", "west")];

        let inserted = store.insert_composite(&parent, &children).await.unwrap();
        assert_eq!(inserted.map(|m| m.id), Some(parent.id));
        assert_eq!(store.children(parent.id).await.unwrap().len(), 2);

        // Same parent identity again
        let again = Migration {
            composite: true,
            ..migration("a")
        };
        assert!(store.insert_composite(&again, &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn job_activity_tracks_latest_update() {
        let store = InMemoryMigrationStore::new();
        let m = store
            .insert_migration(&migration("a"))
            .await
            .unwrap()
            .unwrap();
        assert!(store.last_job_activity(m.id).await.unwrap().is_none());

        let mut job = Job::for_range(&m, 1, 10);
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        job.created_at = long_ago;
        job.updated_at = long_ago;
        store.insert_job(&job).await.unwrap();
        assert_eq!(store.last_job_activity(m.id).await.unwrap(), Some(long_ago));

        job.status = JobStatus::Running;
        store.update_job(&job, JobStatus::Enqueued).await.unwrap();
        let activity = store.last_job_activity(m.id).await.unwrap().unwrap();
        assert!(activity > Utc::now() - chrono::Duration::minutes(1));
    }
}
