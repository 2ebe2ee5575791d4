//! Orchestrator behaviour against the in-memory store.
//!
//! Covers range coverage, idempotence, retry bounds, resumability, empty relations, stuck
//! jobs and the per-migration lease.

mod common;

use std::time::Duration;

use background_migrations::testing::{RecordingMigration, StaticKeys};
use background_migrations::{
    EnqueueOptions, Environment, Error, Job, JobStatus, MigrationStatus, MigrationStore, Settings,
};

use crate::common::Engine;

/// Assert that `jobs` cover every key exactly once, in order, without overlap.
fn assert_exact_cover(jobs: &[Job], keys: &[i64]) {
    for pair in jobs.windows(2) {
        assert!(
            pair[0].max_value < pair[1].min_value,
            "jobs overlap: [{}, {}] and [{}, {}]",
            pair[0].min_value,
            pair[0].max_value,
            pair[1].min_value,
            pair[1].max_value
        );
    }
    for key in keys {
        let covering = jobs
            .iter()
            .filter(|job| job.min_value <= *key && *key <= job.max_value)
            .count();
        assert_eq!(covering, 1, "key {} covered {} times", key, covering);
    }
}

// =============================================================================
// Range coverage
// =============================================================================

#[tokio::test]
async fn creates_ceil_n_over_b_jobs_covering_dense_keys() {
    let keys: Vec<i64> = (1..=10).collect();
    let engine = Engine::new(RecordingMigration::new(StaticKeys::new(keys.clone())));
    let migration = engine.enqueue(3, 3).await;
    assert_eq!((migration.min_value, migration.max_value), (1, 10));

    let steps = engine.drain(&migration).await;

    let jobs = engine.migrations.jobs(migration.id).await.unwrap();
    assert_eq!(steps, 4);
    assert_eq!(jobs.len(), 4); // ceil(10 / 3)
    assert_exact_cover(&jobs, &keys);
    assert!(jobs.iter().all(|job| job.status == JobStatus::Succeeded));
    assert_eq!(
        engine.reload(&migration).await.status,
        MigrationStatus::Succeeded
    );
}

#[tokio::test]
async fn sparse_keys_are_batched_by_row_count() {
    let keys = vec![2, 3, 10, 11, 50, 51, 52, 900];
    let engine = Engine::new(RecordingMigration::new(StaticKeys::new(keys.clone())));
    let migration = engine.enqueue(3, 2).await;

    engine.drain(&migration).await;

    let jobs = engine.migrations.jobs(migration.id).await.unwrap();
    let ranges: Vec<(i64, i64)> = jobs.iter().map(|j| (j.min_value, j.max_value)).collect();
    assert_eq!(ranges, vec![(2, 10), (11, 51), (52, 900)]);
    assert_exact_cover(&jobs, &keys);

    // Every key was handed to process_batch exactly once
    let mut processed: Vec<i64> = Vec::new();
    for batch in engine.definition.batches() {
        processed.extend(
            keys.iter()
                .copied()
                .filter(|k| batch.min_value <= *k && *k <= batch.max_value),
        );
    }
    assert_eq!(processed, keys);
}

#[tokio::test]
async fn four_rows_in_batches_of_two() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::range(1..=4)));
    let migration = engine.enqueue(2, 2).await;
    let runner = engine.migrations.runner();

    let first = runner.run_migration_job(&migration).await.unwrap().unwrap();
    assert_eq!((first.min_value, first.max_value), (1, 2));
    assert_eq!(first.status, JobStatus::Succeeded);

    let second = runner.run_migration_job(&migration).await.unwrap().unwrap();
    assert_eq!((second.min_value, second.max_value), (3, 4));
    assert_eq!(
        engine.reload(&migration).await.status,
        MigrationStatus::Running
    );

    assert!(runner.run_migration_job(&migration).await.unwrap().is_none());
    assert_eq!(
        engine.reload(&migration).await.status,
        MigrationStatus::Succeeded
    );
    assert_eq!(engine.migrations.jobs(migration.id).await.unwrap().len(), 2);
    assert_eq!(engine.definition.calls(), 2);
}

#[tokio::test]
async fn resumes_after_existing_jobs() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::range(1..=30)));
    let migration = engine.enqueue(10, 10).await;

    for (min, max) in [(1, 10), (11, 20)] {
        let mut job = Job::for_range(&migration, min, max);
        job.status = JobStatus::Succeeded;
        engine.store.insert_job(&job).await.unwrap();
    }

    let job = engine
        .migrations
        .runner()
        .run_migration_job(&migration)
        .await
        .unwrap()
        .unwrap();
    assert_eq!((job.min_value, job.max_value), (21, 30));

    let batches = engine.definition.batches();
    assert!(batches.iter().all(|b| b.min_value >= 21));
}

#[tokio::test]
async fn empty_relation_succeeds_without_jobs() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::empty()));
    let migration = engine.enqueue(10, 5).await;
    assert_eq!(migration.status, MigrationStatus::Enqueued);
    assert_eq!((migration.min_value, migration.max_value), (1, 1));

    let job = engine
        .migrations
        .runner()
        .run_migration_job(&migration)
        .await
        .unwrap();

    assert!(job.is_none());
    assert_eq!(
        engine.reload(&migration).await.status,
        MigrationStatus::Succeeded
    );
    assert!(engine.store.all_jobs().is_empty());
    assert_eq!(engine.definition.calls(), 0);
}

#[tokio::test]
async fn explicit_range_limits_the_work() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::range(1..=100)));
    let migration = engine
        .enqueue_with(
            EnqueueOptions::builder()
                .min_value(20)
                .max_value(39)
                .batch_size(10)
                .sub_batch_size(10)
                .build(),
        )
        .await;

    engine.drain(&migration).await;

    let ranges: Vec<(i64, i64)> = engine
        .migrations
        .jobs(migration.id)
        .await
        .unwrap()
        .iter()
        .map(|j| (j.min_value, j.max_value))
        .collect();
    assert_eq!(ranges, vec![(20, 29), (30, 39)]);
}

// =============================================================================
// Idempotence and terminal states
// =============================================================================

#[tokio::test]
async fn succeeded_migration_step_is_a_no_op() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::range(1..=5)));
    let migration = engine.enqueue(5, 5).await;
    engine.drain(&migration).await;

    let before = engine.reload(&migration).await;
    let jobs_before = engine.store.all_jobs().len();
    let calls_before = engine.definition.calls();

    let result = engine
        .migrations
        .runner()
        .run_migration_job(&migration)
        .await
        .unwrap();

    assert!(result.is_none());
    let after = engine.reload(&migration).await;
    assert_eq!(after.status, MigrationStatus::Succeeded);
    assert_eq!(after.finished_at, before.finished_at);
    assert_eq!(engine.store.all_jobs().len(), jobs_before);
    assert_eq!(engine.definition.calls(), calls_before);
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test]
async fn always_failing_job_runs_exactly_max_attempts_times() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::range(1..=5)).always_failing());
    let migration = engine
        .enqueue_with(
            EnqueueOptions::builder()
                .batch_size(10)
                .sub_batch_size(10)
                .batch_max_attempts(3)
                .build(),
        )
        .await;

    let steps = engine.drain(&migration).await;

    assert_eq!(steps, 3);
    assert_eq!(engine.definition.calls(), 3);

    let jobs = engine.migrations.jobs(migration.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[0].attempts, 3);
    assert!(jobs[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("simulated failure"));

    let migration = engine.reload(&migration).await;
    assert_eq!(migration.status, MigrationStatus::Failed);
    assert_eq!(engine.events.count("retried"), 2);

    // Nothing more happens once the migration failed
    assert!(engine
        .migrations
        .runner()
        .run_migration_job(&migration)
        .await
        .unwrap()
        .is_none());
    assert_eq!(engine.definition.calls(), 3);
}

#[tokio::test]
async fn failure_then_success_with_two_attempts() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::range(1..=2)).failing_first(1));
    let migration = engine
        .enqueue_with(
            EnqueueOptions::builder()
                .batch_size(2)
                .sub_batch_size(2)
                .batch_max_attempts(2)
                .build(),
        )
        .await;
    let runner = engine.migrations.runner();

    let job = runner.run_migration_job(&migration).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Enqueued);
    assert_eq!(job.attempts, 1);

    let retried = runner.run_migration_job(&migration).await.unwrap().unwrap();
    assert_eq!(retried.id, job.id);
    assert_eq!(retried.status, JobStatus::Succeeded);

    assert!(runner.run_migration_job(&migration).await.unwrap().is_none());
    assert_eq!(
        engine.reload(&migration).await.status,
        MigrationStatus::Succeeded
    );
}

#[tokio::test]
async fn retryable_job_is_preferred_over_new_range() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::range(1..=4)).failing_first(1));
    let migration = engine
        .enqueue_with(
            EnqueueOptions::builder()
                .batch_size(2)
                .sub_batch_size(2)
                .batch_max_attempts(3)
                .build(),
        )
        .await;
    let runner = engine.migrations.runner();

    let failed = runner.run_migration_job(&migration).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Enqueued);

    let next = runner.run_migration_job(&migration).await.unwrap().unwrap();
    assert_eq!(next.id, failed.id);
    assert_eq!(engine.store.all_jobs().len(), 1);
}

#[tokio::test]
async fn retry_failed_jobs_resets_and_completes() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::range(1..=4)).always_failing());
    let migration = engine
        .enqueue_with(
            EnqueueOptions::builder()
                .batch_size(2)
                .sub_batch_size(2)
                .batch_max_attempts(1)
                .build(),
        )
        .await;

    engine.drain(&migration).await;
    assert_eq!(
        engine.reload(&migration).await.status,
        MigrationStatus::Failed
    );

    engine.definition.set_always_fail(false);
    let reset = engine.migrations.retry_failed_jobs(migration.id).await.unwrap();
    assert_eq!(reset, 2);

    let migration = engine.reload(&migration).await;
    assert_eq!(migration.status, MigrationStatus::Enqueued);
    for job in engine.migrations.jobs(migration.id).await.unwrap() {
        assert_eq!(job.status, JobStatus::Enqueued);
        assert_eq!(job.attempts, 0);
        assert!(job.error_message.is_none());
    }

    engine.drain(&migration).await;
    assert_eq!(
        engine.reload(&migration).await.status,
        MigrationStatus::Succeeded
    );
    assert_eq!(engine.store.all_jobs().len(), 2);
}

// =============================================================================
// Stuck jobs and the lease
// =============================================================================

#[tokio::test]
async fn stuck_running_job_is_redispatched_without_counting_an_attempt() {
    let engine = Engine::with_settings(
        RecordingMigration::new(StaticKeys::range(1..=4)),
        |events| {
            Settings::builder()
                .sub_batch_pause_ms(0)
                .stuck_jobs_timeout(Duration::ZERO)
                .events(events)
                .build()
        },
    );
    let migration = engine.enqueue(2, 2).await;

    // A worker claimed [1, 2] and crashed
    let mut crashed = Job::for_range(&migration, 1, 2);
    crashed.status = JobStatus::Running;
    crashed.started_at = Some(chrono::Utc::now());
    engine.store.insert_job(&crashed).await.unwrap();

    let job = engine
        .migrations
        .runner()
        .run_migration_job(&migration)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(job.id, crashed.id);
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn live_running_job_keeps_migration_running() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::range(1..=2)));
    let migration = engine.enqueue(2, 2).await;

    let mut live = Job::for_range(&migration, 1, 2);
    live.status = JobStatus::Running;
    engine.store.insert_job(&live).await.unwrap();

    let result = engine
        .migrations
        .runner()
        .run_migration_job(&migration)
        .await
        .unwrap();

    assert!(result.is_none());
    assert_eq!(
        engine.reload(&migration).await.status,
        MigrationStatus::Running
    );
    assert_eq!(engine.definition.calls(), 0);
}

#[tokio::test]
async fn live_running_job_blocks_new_ranges() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::range(1..=20)));
    let migration = engine.enqueue(10, 10).await;

    let mut live = Job::for_range(&migration, 1, 10);
    live.status = JobStatus::Running;
    engine.store.insert_job(&live).await.unwrap();

    let result = engine
        .migrations
        .runner()
        .run_migration_job(&migration)
        .await
        .unwrap();

    assert!(result.is_none());
    assert_eq!(engine.store.all_jobs().len(), 1);
    assert_eq!(engine.definition.calls(), 0);
    assert_eq!(
        engine.reload(&migration).await.status,
        MigrationStatus::Running
    );
}

#[tokio::test]
async fn each_runner_leases_under_its_own_owner() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::range(1..=2)));
    let migration = engine.enqueue(2, 2).await;
    let first = engine.migrations.runner();
    let second = engine.migrations.runner();
    assert_ne!(first.owner(), second.owner());

    assert!(engine
        .store
        .try_lock_migration(migration.id, first.owner(), Duration::from_secs(3_600))
        .await
        .unwrap());

    assert!(second.run_migration_job(&migration).await.unwrap().is_none());
    assert_eq!(engine.definition.calls(), 0);

    assert!(first.run_migration_job(&migration).await.unwrap().is_some());
    assert_eq!(engine.definition.calls(), 1);
}

#[tokio::test]
async fn migration_leased_by_another_worker_is_skipped() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::range(1..=2)));
    let migration = engine.enqueue(2, 2).await;

    assert!(engine
        .store
        .try_lock_migration(migration.id, "other-worker", Duration::from_secs(3_600))
        .await
        .unwrap());

    let result = engine
        .migrations
        .runner()
        .run_migration_job(&migration)
        .await
        .unwrap();
    assert!(result.is_none());
    assert!(engine.store.all_jobs().is_empty());

    engine
        .store
        .unlock_migration(migration.id, "other-worker")
        .await
        .unwrap();
    assert!(engine
        .migrations
        .runner()
        .run_migration_job(&migration)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn lease_is_released_after_each_step() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::range(1..=4)));
    let migration = engine.enqueue(2, 2).await;

    engine
        .migrations
        .runner()
        .run_migration_job(&migration)
        .await
        .unwrap();

    let migration = engine.reload(&migration).await;
    assert!(migration.locked_by.is_none());
    assert!(migration.lock_expires_at.is_none());
}

// =============================================================================
// Guards
// =============================================================================

#[tokio::test]
async fn run_all_is_refused_in_production() {
    let engine = Engine::with_settings(
        RecordingMigration::new(StaticKeys::range(1..=4)),
        |events| {
            Settings::builder()
                .environment(Environment::Production)
                .events(events)
                .build()
        },
    );
    let migration = engine.enqueue(2, 2).await;

    let err = engine
        .migrations
        .run_all_migration_jobs(migration.id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotForProduction(_)));
    assert_eq!(engine.definition.calls(), 0);
}

#[tokio::test]
async fn run_all_completes_the_migration() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::range(1..=7)));
    let migration = engine.enqueue(2, 1).await;

    engine
        .migrations
        .run_all_migration_jobs(migration.id)
        .await
        .unwrap();

    assert_eq!(
        engine.reload(&migration).await.status,
        MigrationStatus::Succeeded
    );
    assert_eq!(engine.definition.calls(), 7);
}

#[tokio::test]
async fn lifecycle_hooks_and_events_fire_once() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::range(1..=4)));
    let migration = engine.enqueue(2, 2).await;

    engine.drain(&migration).await;

    assert_eq!(
        engine.definition.hooks(),
        vec!["after_start", "after_complete"]
    );
    assert_eq!(engine.events.count("started"), 1);
    assert_eq!(engine.events.count("completed"), 1);
    assert_eq!(engine.events.count("processed"), 2);
    assert_eq!(engine.events.count("process_batch"), 2);
}

#[tokio::test]
async fn failed_migration_calls_after_stop() {
    let engine = Engine::new(RecordingMigration::new(StaticKeys::range(1..=2)).always_failing());
    let migration = engine
        .enqueue_with(
            EnqueueOptions::builder()
                .batch_size(2)
                .sub_batch_size(2)
                .batch_max_attempts(1)
                .build(),
        )
        .await;

    engine.drain(&migration).await;

    assert_eq!(engine.definition.hooks(), vec!["after_start", "after_stop"]);
}
