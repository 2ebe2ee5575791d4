//! In-memory engine wiring for behaviour tests.

use std::sync::Arc;

use background_migrations::testing::{registry_with, RecordingEventSink, RecordingMigration};
use background_migrations::{
    BackgroundMigrations, EnqueueOptions, InMemoryMigrationStore, Migration, Settings,
};

pub const MIGRATION_NAME: &str = "recording";

/// A manager over an in-memory store with a single registered [`RecordingMigration`].
pub struct Engine {
    pub store: Arc<InMemoryMigrationStore>,
    pub definition: Arc<RecordingMigration>,
    pub events: Arc<RecordingEventSink>,
    pub migrations: BackgroundMigrations,
}

impl Engine {
    /// Default settings without sub-batch pauses.
    pub fn new(definition: RecordingMigration) -> Self {
        Self::with_settings(definition, |events| {
            Settings::builder()
                .sub_batch_pause_ms(0)
                .events(events)
                .build()
        })
    }

    pub fn with_settings(
        definition: RecordingMigration,
        settings: impl FnOnce(Arc<RecordingEventSink>) -> Settings,
    ) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let store = Arc::new(InMemoryMigrationStore::new());
        let definition = Arc::new(definition);
        let events = Arc::new(RecordingEventSink::new());
        let registry = registry_with(MIGRATION_NAME, definition.clone())
            .expect("Failed to build registry");

        let migrations =
            BackgroundMigrations::new(store.clone(), Arc::new(registry), settings(events.clone()));

        Self {
            store,
            definition,
            events,
            migrations,
        }
    }

    /// Enqueue with the given tuning and no extra arguments.
    pub async fn enqueue(&self, batch_size: i64, sub_batch_size: i64) -> Migration {
        self.enqueue_with(
            EnqueueOptions::builder()
                .batch_size(batch_size)
                .sub_batch_size(sub_batch_size)
                .build(),
        )
        .await
    }

    pub async fn enqueue_with(&self, options: EnqueueOptions) -> Migration {
        self.migrations
            .enqueue(MIGRATION_NAME, options)
            .await
            .expect("Failed to enqueue migration")
            .into_migration()
    }

    pub async fn reload(&self, migration: &Migration) -> Migration {
        self.migrations
            .find(migration.id)
            .await
            .expect("Failed to reload migration")
    }

    /// Call the orchestrator until it reports nothing to do; returns the number of steps
    /// that ran a job.
    pub async fn drain(&self, migration: &Migration) -> usize {
        let runner = self.migrations.runner();
        let mut steps = 0;
        while runner
            .run_migration_job(migration)
            .await
            .expect("Orchestrator step failed")
            .is_some()
        {
            steps += 1;
            assert!(steps < 10_000, "orchestrator did not converge");
        }
        steps
    }
}
