//! Chunked, retried writes with honest partial-completion reporting.

use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use indexmap::map::Entry;
use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub batch_size: usize,
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl BatchPolicy {
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    fn delay_for_retry(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << retry.saturating_sub(1).min(16))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub committed: usize,
    pub chunks: usize,
    pub retries: u32,
}

#[derive(Debug, Error)]
#[error("{entity}: chunk {chunk} of {chunks} failed after {attempts} attempt(s), {committed} of {total} committed: {source}")]
pub struct BatchAbort {
    pub entity: String,
    /// 1-based index of the failing chunk.
    pub chunk: usize,
    pub chunks: usize,
    pub attempts: u32,
    pub committed: usize,
    pub total: usize,
    #[source]
    pub source: StoreError,
}

/// Collapses items that share a natural key, keeping first-seen order.
///
/// `replaces(kept, incoming)` decides whether a later duplicate takes the
/// place of the one already kept. Returns the survivors and how many
/// duplicates were dropped. One upsert statement may touch each key once.
pub fn collapse_by_key<T, K, F, R>(items: Vec<T>, key: F, replaces: R) -> (Vec<T>, usize)
where
    K: Hash + Eq,
    F: Fn(&T) -> K,
    R: Fn(&T, &T) -> bool,
{
    let mut kept: IndexMap<K, T> = IndexMap::with_capacity(items.len());
    let mut dropped = 0usize;
    for item in items {
        match kept.entry(key(&item)) {
            Entry::Occupied(mut slot) => {
                dropped += 1;
                if replaces(slot.get(), &item) {
                    slot.insert(item);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(item);
            }
        }
    }
    (kept.into_values().collect(), dropped)
}

/// Writes `items` in chunks of `policy.batch_size`, in order.
///
/// Transient failures are retried with exponential backoff. The first chunk
/// that still fails stops the run; everything before it stays committed and
/// is reported in the error.
pub async fn upsert_in_batches<'a, T, F, Fut>(
    entity: &str,
    items: &'a [T],
    policy: BatchPolicy,
    mut write: F,
) -> Result<BatchReport, BatchAbort>
where
    F: FnMut(&'a [T]) -> Fut,
    Fut: Future<Output = Result<u64, StoreError>>,
{
    let batch_size = policy.batch_size.max(1);
    let chunks = items.len().div_ceil(batch_size);
    let mut report = BatchReport {
        total: items.len(),
        chunks,
        ..BatchReport::default()
    };

    for (index, chunk) in items.chunks(batch_size).enumerate() {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match write(chunk).await {
                Ok(_) => {
                    report.committed += chunk.len();
                    debug!(entity, chunk = index + 1, chunks, rows = chunk.len(), "chunk committed");
                    break;
                }
                Err(err) if err.is_transient() && attempt <= policy.max_retries => {
                    let delay = policy.delay_for_retry(attempt);
                    report.retries += 1;
                    warn!(entity, chunk = index + 1, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying chunk");
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    warn!(entity, chunk = index + 1, committed = report.committed, total = report.total, error = %source, "aborting remaining chunks");
                    return Err(BatchAbort {
                        entity: entity.to_string(),
                        chunk: index + 1,
                        chunks,
                        attempts: attempt,
                        committed: report.committed,
                        total: report.total,
                        source,
                    });
                }
            }
        }
    }
    Ok(report)
}
