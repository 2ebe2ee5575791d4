//! User-supplied background migrations.
//!
//! A background migration names the relation to iterate and mutates one bounded batch at a
//! time. The engine owns everything else: ranges, jobs, retries, pacing.
//!
//! # Example
//!
//! ```rust,ignore
//! pub struct NormalizeEmails {
//!     pool: PgPool,
//! }
//!
//! #[async_trait]
//! impl BackgroundMigration for NormalizeEmails {
//!     fn relation(&self, _shard: Option<&str>) -> anyhow::Result<Arc<dyn KeySource>> {
//!         Ok(Arc::new(TableRelation::new(self.pool.clone(), "users", "id")))
//!     }
//!
//!     async fn process_batch(&self, batch: &Batch) -> anyhow::Result<()> {
//!         sqlx::query(
//!             "UPDATE users SET email = LOWER(email) WHERE id BETWEEN $1 AND $2 AND email <> LOWER(email)",
//!         )
//!         .bind(batch.min_value)
//!         .bind(batch.max_value)
//!         .execute(&self.pool)
//!         .await?;
//!         Ok(())
//!     }
//! }
//! ```
//!
//! `process_batch` may run more than once for the same keys (retries, stuck-job
//! re-dispatch), so it must be idempotent, typically through a conditional `WHERE`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::KeySource;
use crate::models::Migration;

/// The bounded row set handed to [`BackgroundMigration::process_batch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub migration_id: Uuid,
    pub job_id: Uuid,
    pub shard: Option<String>,
    /// Batch column the bounds apply to.
    pub column: String,
    /// Inclusive bounds.
    pub min_value: i64,
    pub max_value: i64,
}

#[async_trait]
pub trait BackgroundMigration: Send + Sync {
    /// The relation to iterate, for `shard` when the migration is sharded.
    fn relation(&self, shard: Option<&str>) -> anyhow::Result<Arc<dyn KeySource>>;

    /// Mutate the rows between `batch.min_value` and `batch.max_value`.
    async fn process_batch(&self, batch: &Batch) -> anyhow::Result<()>;

    /// Row estimate used for progress.
    async fn count(&self, _shard: Option<&str>) -> anyhow::Result<Option<i64>> {
        Ok(None)
    }

    /// Shards the work spans; one child migration is created per shard.
    fn shards(&self) -> Vec<String> {
        Vec::new()
    }

    async fn after_start(&self, _migration: &Migration) {}

    async fn after_resume(&self, _migration: &Migration) {}

    async fn after_pause(&self, _migration: &Migration) {}

    /// Called when the migration ends in `failed`.
    async fn after_stop(&self, _migration: &Migration) {}

    async fn after_complete(&self, _migration: &Migration) {}
}
