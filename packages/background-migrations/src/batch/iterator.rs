//! Range arithmetic over a [`KeySource`].
//!
//! Jobs and sub-batches are both produced by the same walk: find the first existing key at
//! or after a cursor, then the key `size - 1` positions further, clamped to an upper bound.
//! Keys need not be contiguous, so deleted rows never produce empty or overlapping ranges.

use serde::{Deserialize, Serialize};

use super::relation::KeySource;
use crate::error::Result;
use crate::models::{Job, Migration};
use crate::store::MigrationStore;

/// An inclusive `[min_value, max_value]` slice of the key domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRange {
    pub min_value: i64,
    pub max_value: i64,
}

impl BatchRange {
    pub fn new(min_value: i64, max_value: i64) -> Self {
        Self {
            min_value,
            max_value,
        }
    }
}

/// Next range of at most `size` keys starting at the first key `>= start`, never past `max`.
pub async fn range_from(
    keys: &dyn KeySource,
    start: i64,
    max: i64,
    size: i64,
) -> Result<Option<BatchRange>> {
    if start > max {
        return Ok(None);
    }

    let Some(first) = keys.key_at(start, 0).await? else {
        return Ok(None);
    };
    if first > max {
        return Ok(None);
    }

    let upper = match keys.key_at(first, size.max(1) - 1).await? {
        Some(key) if key <= max => key,
        _ => max,
    };

    Ok(Some(BatchRange::new(first, upper)))
}

/// Next unclaimed range of `migration`, `None` once its whole range has been claimed.
///
/// Resumes one past the highest bound of any existing job, so completed ranges are never
/// issued twice.
pub async fn next_range(
    store: &dyn MigrationStore,
    migration: &Migration,
    keys: &dyn KeySource,
) -> Result<Option<BatchRange>> {
    let start = match store.max_job_value(migration.id).await? {
        Some(last) => match last.checked_add(1) {
            Some(start) => start,
            None => return Ok(None),
        },
        None => migration.min_value,
    };

    range_from(keys, start, migration.max_value, migration.batch_size).await
}

/// Sub-batch following `cursor` within `job`, `None` when the job's range is exhausted.
pub async fn next_sub_batch(
    keys: &dyn KeySource,
    job: &Job,
    cursor: Option<i64>,
) -> Result<Option<BatchRange>> {
    let start = match cursor {
        None => job.min_value,
        Some(previous) => match previous.checked_add(1) {
            Some(start) => start,
            None => return Ok(None),
        },
    };

    range_from(keys, start, job.max_value, job.sub_batch_size).await
}
