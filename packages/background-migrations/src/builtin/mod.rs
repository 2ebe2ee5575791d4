//! Built-in background migrations for common column backfills.

mod backfill_column;
mod copy_column;

pub use backfill_column::{BackfillColumn, BackfillColumnArgs};
pub use copy_column::{CopyColumn, CopyColumnArgs};

use std::sync::Arc;

use sqlx::PgPool;

use crate::definition::BackgroundMigration;
use crate::error::Result;
use crate::registry::MigrationRegistry;

fn default_batch_column() -> String {
    "id".to_string()
}

/// Register the built-in migrations against `pool`.
pub fn register_builtins(registry: &mut MigrationRegistry, pool: PgPool) -> Result<()> {
    let backfill_pool = pool.clone();
    registry.register::<BackfillColumnArgs, _>(BackfillColumn::NAME, move |args| {
        let migration: Arc<dyn BackgroundMigration> =
            Arc::new(BackfillColumn::new(backfill_pool.clone(), args)?);
        Ok(migration)
    })?;

    registry.register::<CopyColumnArgs, _>(CopyColumn::NAME, move |args| {
        let migration: Arc<dyn BackgroundMigration> = Arc::new(CopyColumn::new(pool.clone(), args)?);
        Ok(migration)
    })?;

    Ok(())
}
