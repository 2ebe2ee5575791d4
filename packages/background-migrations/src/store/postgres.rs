use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::MigrationStore;
use crate::error::{Error, Result};
use crate::models::{Job, JobCounts, JobStatus, Migration, MigrationStatus};

/// PostgreSQL-backed store.
#[derive(Debug, Clone)]
pub struct PostgresMigrationStore {
    pool: PgPool,
}

impl PostgresMigrationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("background migration schema is up to date");
        Ok(())
    }
}

#[async_trait]
impl MigrationStore for PostgresMigrationStore {
    async fn insert_migration(&self, migration: &Migration) -> Result<Option<Migration>> {
        insert_row(&self.pool, migration).await
    }

    async fn insert_composite(
        &self,
        parent: &Migration,
        children: &[Migration],
    ) -> Result<Option<Migration>> {
        let mut tx = self.pool.begin().await?;

        let Some(inserted) = insert_row(&mut *tx, parent).await? else {
            return Ok(None);
        };
        for child in children {
            let child = Migration {
                parent_id: Some(parent.id),
                ..child.clone()
            };
            if insert_row(&mut *tx, &child).await?.is_none() {
                tx.rollback().await?;
                return Err(Error::Validation(format!(
                    "background migration {} already exists for shard {}",
                    child.migration_name,
                    child.shard.as_deref().unwrap_or_default()
                )));
            }
        }

        tx.commit().await?;
        Ok(Some(inserted))
    }

    async fn find_migration(&self, id: Uuid) -> Result<Option<Migration>> {
        let migration = sqlx::query_as::<_, Migration>(
            "SELECT * FROM background_migrations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(migration)
    }

    async fn find_migration_by_identity(
        &self,
        name: &str,
        arguments: &serde_json::Value,
        shard: Option<&str>,
    ) -> Result<Option<Migration>> {
        let migration = sqlx::query_as::<_, Migration>(
            r#"
            SELECT * FROM background_migrations
            WHERE migration_name = $1
              AND arguments = $2
              AND COALESCE(shard, '') = COALESCE($3, '')
            "#,
        )
        .bind(name)
        .bind(arguments)
        .bind(shard)
        .fetch_optional(&self.pool)
        .await?;

        Ok(migration)
    }

    async fn list_migrations(&self) -> Result<Vec<Migration>> {
        let migrations = sqlx::query_as::<_, Migration>(
            r#"
            SELECT * FROM background_migrations
            WHERE parent_id IS NULL
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(migrations)
    }

    async fn children(&self, parent_id: Uuid) -> Result<Vec<Migration>> {
        let children = sqlx::query_as::<_, Migration>(
            r#"
            SELECT * FROM background_migrations
            WHERE parent_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(children)
    }

    async fn active_migrations(&self, shard: Option<&str>) -> Result<Vec<Migration>> {
        let migrations = sqlx::query_as::<_, Migration>(
            r#"
            SELECT * FROM background_migrations
            WHERE status IN ('enqueued', 'running')
              AND composite = false
              AND ($1::TEXT IS NULL OR shard = $1)
            ORDER BY created_at, id
            "#,
        )
        .bind(shard)
        .fetch_all(&self.pool)
        .await?;

        Ok(migrations)
    }

    async fn update_migration(
        &self,
        migration: &Migration,
        expected: MigrationStatus,
    ) -> Result<Migration> {
        let updated = sqlx::query_as::<_, Migration>(
            r#"
            UPDATE background_migrations
            SET status = $3,
                min_value = $4,
                max_value = $5,
                rows_count = $6,
                started_at = $7,
                finished_at = $8,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(migration.id)
        .bind(expected)
        .bind(migration.status)
        .bind(migration.min_value)
        .bind(migration.max_value)
        .bind(migration.rows_count)
        .bind(migration.started_at)
        .bind(migration.finished_at)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(migration) => Ok(migration),
            None if self.find_migration(migration.id).await?.is_some() => {
                Err(Error::StaleRecord {
                    record: "migration",
                    id: migration.id,
                })
            }
            None => Err(Error::MigrationNotFound(migration.id)),
        }
    }

    async fn delete_migration(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM background_migrations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn try_lock_migration(&self, id: Uuid, owner: &str, lease: Duration) -> Result<bool> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);

        let locked = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE background_migrations
            SET locked_by = $2,
                lock_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL
            WHERE id = $1
              AND (locked_by IS NULL OR locked_by = $2 OR lock_expires_at <= NOW())
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(lease_ms.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(locked.is_some())
    }

    async fn unlock_migration(&self, id: Uuid, owner: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE background_migrations
            SET locked_by = NULL, lock_expires_at = NULL
            WHERE id = $1 AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<Job> {
        let inserted = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO background_migration_jobs (
                id, migration_id, min_value, max_value, status, attempts,
                batch_size, sub_batch_size, pause_ms, max_attempts,
                started_at, finished_at, error_class, error_message, backtrace,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(job.migration_id)
        .bind(job.min_value)
        .bind(job.max_value)
        .bind(job.status)
        .bind(job.attempts)
        .bind(job.batch_size)
        .bind(job.sub_batch_size)
        .bind(job.pause_ms)
        .bind(job.max_attempts)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.error_class)
        .bind(&job.error_message)
        .bind(&job.backtrace)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            "SELECT * FROM background_migration_jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn update_job(&self, job: &Job, expected: JobStatus) -> Result<Job> {
        let updated = sqlx::query_as::<_, Job>(
            r#"
            UPDATE background_migration_jobs
            SET status = $3,
                attempts = $4,
                started_at = $5,
                finished_at = $6,
                error_class = $7,
                error_message = $8,
                backtrace = $9,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(expected)
        .bind(job.status)
        .bind(job.attempts)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.error_class)
        .bind(&job.error_message)
        .bind(&job.backtrace)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(job) => Ok(job),
            None if self.find_job(job.id).await?.is_some() => Err(Error::StaleRecord {
                record: "job",
                id: job.id,
            }),
            None => Err(Error::JobNotFound(job.id)),
        }
    }

    async fn touch_job(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE background_migration_jobs
            SET updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn jobs_for(&self, migration_id: Uuid) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM background_migration_jobs
            WHERE migration_id = $1
            ORDER BY min_value
            "#,
        )
        .bind(migration_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn max_job_value(&self, migration_id: Uuid) -> Result<Option<i64>> {
        let max = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(max_value) FROM background_migration_jobs WHERE migration_id = $1",
        )
        .bind(migration_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(max)
    }

    async fn last_job_activity(&self, migration_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let activity = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            r#"
            SELECT MAX(GREATEST(created_at, updated_at))
            FROM background_migration_jobs
            WHERE migration_id = $1
            "#,
        )
        .bind(migration_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(activity)
    }

    async fn next_retryable_job(
        &self,
        migration_id: Uuid,
        stuck_before: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM background_migration_jobs
            WHERE migration_id = $1
              AND (
                (status = 'running' AND updated_at <= $2)
                OR status = 'enqueued'
                OR (status = 'failed' AND attempts < max_attempts)
              )
            ORDER BY
              CASE status
                WHEN 'running' THEN 0
                WHEN 'enqueued' THEN 1
                ELSE 2
              END,
              min_value
            LIMIT 1
            "#,
        )
        .bind(migration_id)
        .bind(stuck_before)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn job_counts(&self, migration_id: Uuid) -> Result<JobCounts> {
        let (enqueued, running, succeeded, failed) =
            sqlx::query_as::<_, (i64, i64, i64, i64)>(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE status = 'enqueued'),
                    COUNT(*) FILTER (WHERE status = 'running'),
                    COUNT(*) FILTER (WHERE status = 'succeeded'),
                    COUNT(*) FILTER (WHERE status = 'failed')
                FROM background_migration_jobs
                WHERE migration_id = $1
                "#,
            )
            .bind(migration_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(JobCounts {
            enqueued,
            running,
            succeeded,
            failed,
        })
    }

    async fn has_running_job(
        &self,
        migration_id: Uuid,
        stuck_before: DateTime<Utc>,
    ) -> Result<bool> {
        let running = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM background_migration_jobs
                WHERE migration_id = $1 AND status = 'running' AND updated_at > $2
            )
            "#,
        )
        .bind(migration_id)
        .bind(stuck_before)
        .fetch_one(&self.pool)
        .await?;

        Ok(running)
    }
}

async fn insert_row<'e, E>(executor: E, migration: &Migration) -> Result<Option<Migration>>
where
    E: sqlx::PgExecutor<'e>,
{
    let inserted = sqlx::query_as::<_, Migration>(
        r#"
        INSERT INTO background_migrations (
            id, parent_id, migration_name, arguments, shard, composite, status,
            batch_column_name, min_value, max_value, rows_count,
            batch_size, sub_batch_size, batch_pause_ms, sub_batch_pause_ms, batch_max_attempts,
            started_at, finished_at, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
        ON CONFLICT DO NOTHING
        RETURNING *
        "#,
    )
    .bind(migration.id)
    .bind(migration.parent_id)
    .bind(&migration.migration_name)
    .bind(&migration.arguments)
    .bind(&migration.shard)
    .bind(migration.composite)
    .bind(migration.status)
    .bind(&migration.batch_column_name)
    .bind(migration.min_value)
    .bind(migration.max_value)
    .bind(migration.rows_count)
    .bind(migration.batch_size)
    .bind(migration.sub_batch_size)
    .bind(migration.batch_pause_ms)
    .bind(migration.sub_batch_pause_ms)
    .bind(migration.batch_max_attempts)
    .bind(migration.started_at)
    .bind(migration.finished_at)
    .bind(migration.created_at)
    .bind(migration.updated_at)
    .fetch_optional(executor)
    .await?;

    Ok(inserted)
}
