//! Key sources: the ordered set of batch-column values a migration iterates.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::{Error, Result};

/// Ordered, unique integer keys of the relation being migrated.
///
/// Keys may be sparse. Implementations must answer from an index-ordered scan so that
/// repeated calls with the same arguments return the same key while the data is stable.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Name of the batch column, as stored on the migration.
    fn column(&self) -> &str;

    /// Reject relation shapes that cannot be iterated safely.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// First and last key, `None` when the relation has no rows.
    async fn bounds(&self) -> Result<Option<(i64, i64)>>;

    /// The key `offset` positions after the first key `>= start`.
    async fn key_at(&self, start: i64, offset: i64) -> Result<Option<i64>>;
}

/// Compute the `[min, max]` key range of `source`.
///
/// Configuration problems surface here, when the migration is defined, rather than on the
/// first run.
pub async fn compute_bounds(source: &dyn KeySource) -> Result<Option<(i64, i64)>> {
    source.validate()?;
    source.bounds().await
}

/// A Postgres table (optionally joined and filtered) iterated by an integer column.
#[derive(Debug, Clone)]
pub struct TableRelation {
    pool: PgPool,
    table: String,
    column: String,
    joins: Option<String>,
    filter: Option<String>,
}

impl TableRelation {
    pub fn new(pool: PgPool, table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
            column: column.into(),
            joins: None,
            filter: None,
        }
    }

    /// Raw `JOIN ...` clause appended after the table.
    pub fn with_joins(mut self, joins: impl Into<String>) -> Self {
        self.joins = Some(joins.into());
        self
    }

    /// Raw SQL predicate restricting the rows that qualify.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Quoted table reference, e.g. `"public"."users"`.
    pub fn quoted_table(&self) -> Result<String> {
        quote_qualified(&self.table, 2)
    }

    /// Quoted batch column reference, e.g. `"users"."id"`.
    pub fn quoted_column(&self) -> Result<String> {
        quote_qualified(&self.column, 3)
    }

    fn from_clause(&self) -> Result<String> {
        let mut from = self.quoted_table()?;
        if let Some(joins) = &self.joins {
            from.push(' ');
            from.push_str(joins);
        }
        Ok(from)
    }

    fn filter_clause(&self) -> String {
        match &self.filter {
            Some(filter) => format!("AND ({})", filter),
            None => String::new(),
        }
    }

    /// Planner row estimate for the table, `None` when it has never been analyzed.
    pub async fn estimated_count(&self) -> Result<Option<i64>> {
        let estimate: Option<f32> = sqlx::query_scalar(
            r#"
            SELECT reltuples FROM pg_class WHERE oid = to_regclass($1)
            "#,
        )
        .bind(&self.table)
        .fetch_optional(&self.pool)
        .await?;

        Ok(estimate.filter(|rows| *rows >= 0.0).map(|rows| rows as i64))
    }

    async fn edge_key(&self, descending: bool) -> Result<Option<i64>> {
        let column = self.quoted_column()?;
        let sql = format!(
            "SELECT {column}::BIGINT FROM {from} WHERE {column} IS NOT NULL {filter} ORDER BY {column} {direction} LIMIT 1",
            column = column,
            from = self.from_clause()?,
            filter = self.filter_clause(),
            direction = if descending { "DESC" } else { "ASC" },
        );

        let key = sqlx::query_scalar::<_, i64>(&sql)
            .fetch_optional(&self.pool)
            .await?;
        Ok(key)
    }
}

#[async_trait]
impl KeySource for TableRelation {
    fn column(&self) -> &str {
        &self.column
    }

    fn validate(&self) -> Result<()> {
        self.quoted_table()?;
        self.quoted_column()?;

        if let Some(filter) = &self.filter {
            if let Some(keyword) = forbidden_clause(filter) {
                return Err(Error::Configuration(format!(
                    "relation for {} must not contain {}; pass an unordered, unlimited relation",
                    self.table, keyword
                )));
            }
        }

        if self.joins.is_some() && !self.column.contains('.') {
            return Err(Error::Configuration(format!(
                "batch column '{}' must be qualified with its table when the relation has joins",
                self.column
            )));
        }

        Ok(())
    }

    async fn bounds(&self) -> Result<Option<(i64, i64)>> {
        let Some(min) = self.edge_key(false).await? else {
            return Ok(None);
        };
        let max = self.edge_key(true).await?.unwrap_or(min);
        Ok(Some((min, max)))
    }

    async fn key_at(&self, start: i64, offset: i64) -> Result<Option<i64>> {
        let column = self.quoted_column()?;
        let sql = format!(
            "SELECT {column}::BIGINT FROM {from} WHERE {column} >= $1 {filter} ORDER BY {column} ASC OFFSET $2 LIMIT 1",
            column = column,
            from = self.from_clause()?,
            filter = self.filter_clause(),
        );

        let key = sqlx::query_scalar::<_, i64>(&sql)
            .bind(start)
            .bind(offset.max(0))
            .fetch_optional(&self.pool)
            .await?;
        Ok(key)
    }
}

fn forbidden_clause(filter: &str) -> Option<&'static str> {
    let words: Vec<String> = filter
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|word| !word.is_empty())
        .map(|word| word.to_ascii_uppercase())
        .collect();

    for (i, word) in words.iter().enumerate() {
        match word.as_str() {
            "ORDER" if words.get(i + 1).map(String::as_str) == Some("BY") => {
                return Some("ORDER BY")
            }
            "LIMIT" => return Some("LIMIT"),
            "OFFSET" => return Some("OFFSET"),
            _ => {}
        }
    }
    None
}

/// Validate a PostgreSQL identifier.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Configuration("identifier must not be empty".into()));
    }

    if name.len() > 63 {
        return Err(Error::Configuration(format!(
            "identifier '{}' exceeds PostgreSQL maximum length of 63 bytes (got {})",
            name,
            name.len()
        )));
    }

    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_alphabetic() && first != '_' {
            return Err(Error::Configuration(format!(
                "identifier '{}' must start with a letter or underscore",
                name
            )));
        }
    }

    if let Some(ch) = chars.find(|ch| !ch.is_ascii_alphanumeric() && *ch != '_') {
        return Err(Error::Configuration(format!(
            "identifier '{}' contains invalid character '{}'",
            name, ch
        )));
    }

    Ok(())
}

/// Quote a possibly dotted identifier with at most `max_parts` parts.
pub fn quote_qualified(name: &str, max_parts: usize) -> Result<String> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > max_parts {
        return Err(Error::Configuration(format!(
            "'{}' has too many qualifiers",
            name
        )));
    }

    let mut quoted = Vec::with_capacity(parts.len());
    for part in parts {
        validate_identifier(part)?;
        quoted.push(format!("\"{}\"", part));
    }
    Ok(quoted.join("."))
}
