//! Instrumentation events emitted by the engine.
//!
//! Events are facts about the migration lifecycle, not commands. They are handed to an
//! [`EventSink`] configured on [`Settings`](crate::Settings); the default sink logs them
//! through `tracing`.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::MigrationStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MigrationEvent {
    /// A migration was picked up for the first time.
    Started {
        migration_id: Uuid,
        migration_name: String,
        shard: Option<String>,
    },

    /// A migration reached a terminal status.
    Completed {
        migration_id: Uuid,
        migration_name: String,
        status: MigrationStatus,
    },

    /// The throttler asked the scheduler to back off.
    Throttled { shard: Option<String> },

    /// One sub-batch was handed to the processing callback.
    ProcessBatch {
        migration_id: Uuid,
        job_id: Uuid,
        min_value: i64,
        max_value: i64,
        duration_ms: u64,
    },

    /// A job finished all of its sub-batches.
    Processed {
        migration_id: Uuid,
        job_id: Uuid,
        min_value: i64,
        max_value: i64,
        duration_ms: u64,
    },

    /// A job failed and was put back in the queue.
    Retried {
        migration_id: Uuid,
        job_id: Uuid,
        attempts: i32,
        error: String,
    },
}

impl MigrationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MigrationEvent::Started { .. } => "started",
            MigrationEvent::Completed { .. } => "completed",
            MigrationEvent::Throttled { .. } => "throttled",
            MigrationEvent::ProcessBatch { .. } => "process_batch",
            MigrationEvent::Processed { .. } => "processed",
            MigrationEvent::Retried { .. } => "retried",
        }
    }
}

/// Receiver for [`MigrationEvent`]s.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &MigrationEvent);
}

/// Sink that writes every event to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &MigrationEvent) {
        match event {
            MigrationEvent::Started {
                migration_id,
                migration_name,
                shard,
            } => info!(
                event = event.name(),
                migration_id = %migration_id,
                migration_name = %migration_name,
                shard = ?shard,
                "background migration started"
            ),
            MigrationEvent::Completed {
                migration_id,
                migration_name,
                status,
            } => info!(
                event = event.name(),
                migration_id = %migration_id,
                migration_name = %migration_name,
                status = status.as_str(),
                "background migration completed"
            ),
            MigrationEvent::Throttled { shard } => {
                info!(event = event.name(), shard = ?shard, "background migrations throttled")
            }
            MigrationEvent::ProcessBatch {
                job_id,
                min_value,
                max_value,
                duration_ms,
                ..
            } => tracing::debug!(
                event = event.name(),
                job_id = %job_id,
                min_value,
                max_value,
                duration_ms,
                "processed sub-batch"
            ),
            MigrationEvent::Processed {
                migration_id,
                job_id,
                min_value,
                max_value,
                duration_ms,
            } => info!(
                event = event.name(),
                migration_id = %migration_id,
                job_id = %job_id,
                min_value,
                max_value,
                duration_ms,
                "job processed"
            ),
            MigrationEvent::Retried {
                migration_id,
                job_id,
                attempts,
                error,
            } => warn!(
                event = event.name(),
                migration_id = %migration_id,
                job_id = %job_id,
                attempts,
                error = %error,
                "job failed, will retry"
            ),
        }
    }
}
