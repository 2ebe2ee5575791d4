use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use super::default_batch_column;
use crate::batch::{quote_qualified, KeySource, TableRelation};
use crate::definition::{Batch, BackgroundMigration};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyColumnArgs {
    pub table: String,
    pub from: String,
    pub to: String,
    #[serde(default = "default_batch_column")]
    pub batch_column: String,
}

/// Copies one column into another, typically ahead of a rename or type change.
#[derive(Debug)]
pub struct CopyColumn {
    relation: Arc<TableRelation>,
    args: CopyColumnArgs,
    sql: String,
}

impl CopyColumn {
    pub const NAME: &'static str = "copy_column";

    pub fn new(pool: PgPool, args: CopyColumnArgs) -> Result<Self> {
        if args.from == args.to {
            return Err(Error::Configuration(format!(
                "cannot copy column {} onto itself",
                args.from
            )));
        }

        let relation = TableRelation::new(pool, &args.table, &args.batch_column);
        relation.validate()?;

        let table = relation.quoted_table()?;
        let key = relation.quoted_column()?;
        let from = quote_qualified(&args.from, 1)?;
        let to = quote_qualified(&args.to, 1)?;

        let sql = format!(
            r#"
            UPDATE {table}
            SET {to} = {from}
            WHERE {key} BETWEEN $1 AND $2
              AND {to} IS DISTINCT FROM {from}
            "#,
        );

        Ok(Self {
            relation: Arc::new(relation),
            args,
            sql,
        })
    }
}

#[async_trait]
impl BackgroundMigration for CopyColumn {
    fn relation(&self, _shard: Option<&str>) -> anyhow::Result<Arc<dyn KeySource>> {
        Ok(self.relation.clone())
    }

    async fn process_batch(&self, batch: &Batch) -> anyhow::Result<()> {
        sqlx::query(&self.sql)
            .bind(batch.min_value)
            .bind(batch.max_value)
            .execute(self.relation.pool())
            .await
            .with_context(|| {
                format!(
                    "copying {}.{} to {} for [{}, {}]",
                    self.args.table, self.args.from, self.args.to, batch.min_value, batch.max_value
                )
            })?;
        Ok(())
    }

    async fn count(&self, _shard: Option<&str>) -> anyhow::Result<Option<i64>> {
        Ok(self.relation.estimated_count().await?)
    }
}
