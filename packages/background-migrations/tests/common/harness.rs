//! Test harness with testcontainers for Postgres integration testing.
//!
//! One Postgres container is shared across all tests. The schema is applied once on first
//! use, then each test gets a fresh pool.

use anyhow::{Context, Result};
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

use background_migrations::PostgresMigrationStore;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    db_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

/// Global shared infrastructure - initialized once, reused by all tests.
static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --ignored --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!(
            "postgresql://postgres:postgres@{}:{}/postgres",
            pg_host, pg_port
        );

        let store = PostgresMigrationStore::connect(&db_url)
            .await
            .context("Failed to connect to Postgres for migrations")?;
        store.migrate().await.context("Failed to run migrations")?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Test harness backed by the shared Postgres container.
///
/// ```ignore
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// #[ignore] // Requires docker
/// async fn my_test(ctx: &TestHarness) {
///     let store = ctx.store();
/// }
/// ```
pub struct TestHarness {
    pub db_pool: PgPool,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        // Database pool is automatically dropped
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;
        let db_pool = PgPool::connect(&infra.db_url)
            .await
            .context("Failed to connect to test database")?;

        Ok(Self { db_pool })
    }

    pub fn store(&self) -> PostgresMigrationStore {
        PostgresMigrationStore::new(self.db_pool.clone())
    }

    /// Create a fresh table `name` with `id BIGINT` keys `ids` plus the given extra columns.
    pub async fn create_table(&self, name: &str, columns: &str, ids: &[i64]) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", name))
            .execute(&self.db_pool)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE {} (id BIGINT PRIMARY KEY{}{})",
            name,
            if columns.is_empty() { "" } else { ", " },
            columns
        ))
        .execute(&self.db_pool)
        .await?;
        sqlx::query(&format!(
            "INSERT INTO {} (id) SELECT UNNEST($1::BIGINT[])",
            name
        ))
        .bind(ids)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }
}
