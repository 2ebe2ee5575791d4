use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use super::default_batch_column;
use crate::batch::{quote_qualified, validate_identifier, KeySource, TableRelation};
use crate::definition::{Batch, BackgroundMigration};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillColumnArgs {
    pub table: String,
    pub column: String,
    /// New value, converted to the column's type by Postgres.
    pub value: serde_json::Value,
    #[serde(default = "default_batch_column")]
    pub batch_column: String,
}

/// Sets `column` to a constant value on every row where it differs.
#[derive(Debug)]
pub struct BackfillColumn {
    relation: Arc<TableRelation>,
    args: BackfillColumnArgs,
    sql: String,
}

impl BackfillColumn {
    pub const NAME: &'static str = "backfill_column";

    pub fn new(pool: PgPool, args: BackfillColumnArgs) -> Result<Self> {
        validate_identifier(&args.column)?;
        let relation = TableRelation::new(pool, &args.table, &args.batch_column);
        relation.validate()?;

        let table = relation.quoted_table()?;
        let column = quote_qualified(&args.column, 1)?;
        let key = relation.quoted_column()?;

        // jsonb_populate_record coerces the JSON value to the column's declared type
        let sql = format!(
            r#"
            WITH v AS (
                SELECT (jsonb_populate_record(NULL::{table}, jsonb_build_object($3::TEXT, $4::JSONB))).{column} AS value
            )
            UPDATE {table}
            SET {column} = v.value
            FROM v
            WHERE {key} BETWEEN $1 AND $2
              AND {table}.{column} IS DISTINCT FROM v.value
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
impl BackgroundMigration for BackfillColumn {
    fn relation(&self, _shard: Option<&str>) -> anyhow::Result<Arc<dyn KeySource>> {
        Ok(self.relation.clone())
    }

    async fn process_batch(&self, batch: &Batch) -> anyhow::Result<()> {
        sqlx::query(&self.sql)
            .bind(batch.min_value)
            .bind(batch.max_value)
            .bind(&self.args.column)
            .bind(&self.args.value)
            .execute(self.relation.pool())
            .await
            .with_context(|| {
                format!(
                    "backfilling {}.{} for [{}, {}]",
                    self.args.table, self.args.column, batch.min_value, batch.max_value
                )
            })?;
        Ok(())
    }

    async fn count(&self, _shard: Option<&str>) -> anyhow::Result<Option<i64>> {
        Ok(self.relation.estimated_count().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn lazy_pool() -> PgPool {
        PgPool::connect_lazy("postgres://localhost/unused").unwrap()
    }

    #[tokio::test]
    async fn builds_update_with_quoted_identifiers() {
        let migration = BackfillColumn::new(
            lazy_pool(),
            BackfillColumnArgs {
                table: "public.users".to_string(),
                column: "active".to_string(),
                value: serde_json::json!(true),
                batch_column: "id".to_string(),
            },
        )
        .unwrap();

        assert!(migration.sql.contains("UPDATE \"public\".\"users\""));
        assert!(migration.sql.contains("SET \"active\" = v.value"));
        assert!(migration.sql.contains("\"id\" BETWEEN $1 AND $2"));
    }

    #[tokio::test]
    async fn rejects_unsafe_column() {
        let err = BackfillColumn::new(
            lazy_pool(),
            BackfillColumnArgs {
                table: "users".to_string(),
                column: "active = true; --".to_string(),
                value: serde_json::json!(true),
                batch_column: "id".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn batch_column_defaults_to_id() {
        let args: BackfillColumnArgs = serde_json::from_value(serde_json::json!({
            "table": "users",
            "column": "active",
            "value": false
        }))
        .unwrap();
        assert_eq!(args.batch_column, "id");
    }
}
