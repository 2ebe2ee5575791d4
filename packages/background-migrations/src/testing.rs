//! Testing utilities.
//!
//! In-memory key sources, a background migration that records what it was asked to do, and
//! an event sink that keeps every event. Combined with
//! [`InMemoryMigrationStore`](crate::store::InMemoryMigrationStore) they drive the whole
//! engine without a database.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;

use crate::batch::KeySource;
use crate::definition::{Batch, BackgroundMigration};
use crate::error::Result;
use crate::events::{EventSink, MigrationEvent};
use crate::models::Migration;
use crate::registry::MigrationRegistry;

/// A fixed, possibly sparse, set of keys.
#[derive(Debug, Clone, Default)]
pub struct StaticKeys {
    column: String,
    keys: BTreeSet<i64>,
}

impl StaticKeys {
    pub fn new(keys: impl IntoIterator<Item = i64>) -> Self {
        Self {
            column: "id".to_string(),
            keys: keys.into_iter().collect(),
        }
    }

    pub fn range(range: RangeInclusive<i64>) -> Self {
        Self::new(range)
    }

    pub fn empty() -> Self {
        Self::new(Vec::<i64>::new())
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl KeySource for StaticKeys {
    fn column(&self) -> &str {
        &self.column
    }

    async fn bounds(&self) -> Result<Option<(i64, i64)>> {
        Ok(self.keys.first().copied().zip(self.keys.last().copied()))
    }

    async fn key_at(&self, start: i64, offset: i64) -> Result<Option<i64>> {
        let offset = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        Ok(self.keys.range(start..).nth(offset).copied())
    }
}

/// Background migration that records every batch and hook call.
///
/// It can be told to fail its first `n` batches, or every batch.
#[derive(Debug)]
pub struct RecordingMigration {
    keys: Arc<StaticKeys>,
    shards: Vec<String>,
    rows: Option<i64>,
    failures_left: AtomicUsize,
    always_fail: AtomicBool,
    batches: Mutex<Vec<Batch>>,
    hooks: Mutex<Vec<&'static str>>,
}

impl RecordingMigration {
    pub fn new(keys: StaticKeys) -> Self {
        Self {
            keys: Arc::new(keys),
            shards: Vec::new(),
            rows: None,
            failures_left: AtomicUsize::new(0),
            always_fail: AtomicBool::new(false),
            batches: Mutex::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Span the same keys over several shards.
    pub fn with_shards<S: Into<String>>(mut self, shards: impl IntoIterator<Item = S>) -> Self {
        self.shards = shards.into_iter().map(Into::into).collect();
        self
    }

    /// Report `rows` from the count hook.
    pub fn with_count(mut self, rows: i64) -> Self {
        self.rows = Some(rows);
        self
    }

    /// Fail the next `n` batch invocations.
    pub fn failing_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every batch invocation.
    pub fn always_failing(self) -> Self {
        self.always_fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_always_fail(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    /// Every batch handed to `process_batch`, failed ones included.
    pub fn batches(&self) -> Vec<Batch> {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn calls(&self) -> usize {
        self.batches.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn hooks(&self) -> Vec<&'static str> {
        self.hooks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record_hook(&self, hook: &'static str) {
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }
}

#[async_trait]
impl BackgroundMigration for RecordingMigration {
    fn relation(&self, _shard: Option<&str>) -> anyhow::Result<Arc<dyn KeySource>> {
        Ok(self.keys.clone())
    }

    async fn process_batch(&self, batch: &Batch) -> anyhow::Result<()> {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(batch.clone());

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(anyhow!(
                "simulated failure for [{}, {}]",
                batch.min_value,
                batch.max_value
            ));
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!(
                "simulated failure for [{}, {}]",
                batch.min_value,
                batch.max_value
            ));
        }

        Ok(())
    }

    async fn count(&self, _shard: Option<&str>) -> anyhow::Result<Option<i64>> {
        Ok(self.rows)
    }

    fn shards(&self) -> Vec<String> {
        self.shards.clone()
    }

    async fn after_start(&self, _migration: &Migration) {
        self.record_hook("after_start");
    }

    async fn after_resume(&self, _migration: &Migration) {
        self.record_hook("after_resume");
    }

    async fn after_pause(&self, _migration: &Migration) {
        self.record_hook("after_pause");
    }

    async fn after_stop(&self, _migration: &Migration) {
        self.record_hook("after_stop");
    }

    async fn after_complete(&self, _migration: &Migration) {
        self.record_hook("after_complete");
    }
}

/// Registry holding a single shared migration under `name`, with any arguments accepted.
pub fn registry_with(name: &str, migration: Arc<RecordingMigration>) -> Result<MigrationRegistry> {
    let mut registry = MigrationRegistry::new();
    registry.register::<serde_json::Value, _>(name, move |_args| {
        let migration: Arc<dyn BackgroundMigration> = migration.clone();
        Ok(migration)
    })?;
    Ok(registry)
}

/// Event sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<MigrationEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MigrationEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Event names in emission order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(MigrationEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: &MigrationEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
