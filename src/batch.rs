//! Bounded fan-out of one operation over many device ids.
//!
//! Ids are split into sequential batches of `batch_size`; each batch is
//! split again into windows of `max_concurrency` whose futures run
//! concurrently. A window fully settles before the next one starts, so at
//! most `max_concurrency` operations are ever in flight.
//!
//! Per-item errors never abort the run. They are recorded as failure
//! outcomes, in input order, next to the successes.

use std::future::Future;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{EppError, Result};

/// `[batch]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Ids per sequential batch.
    pub batch_size: usize,
    /// Concurrent operations per window.
    pub max_concurrency: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions {
            batch_size: 100,
            max_concurrency: 10,
        }
    }
}

impl BatchOptions {
    /// Creates options with the given sizes.
    pub fn new(batch_size: usize, max_concurrency: usize) -> Self {
        BatchOptions {
            batch_size,
            max_concurrency,
        }
    }

    /// Rejects zero sizes.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EppError::InvalidInput("batch_size must be greater than 0".into()));
        }
        if self.max_concurrency == 0 {
            return Err(EppError::InvalidInput(
                "max_concurrency must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Aggregate status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// No item failed (including an empty run).
    Completed,
    /// Some, but not all, items failed.
    PartialFailure,
    /// Every item failed.
    Failed,
}

/// Counters for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    /// Ids submitted.
    pub total: usize,
    /// Ids whose operation settled.
    pub processed: usize,
    /// Successful operations.
    pub succeeded: usize,
    /// Failed operations.
    pub failed: usize,
}

/// Outcome of one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome<T> {
    /// The operation returned a value.
    Success(T),
    /// The operation failed; the error message is kept.
    Failure(String),
}

impl<T> ItemOutcome<T> {
    /// Whether the operation succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Success(_))
    }
}

/// One id and what happened to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItemResult<T> {
    /// The input id.
    pub id: String,
    /// Its outcome.
    pub outcome: ItemOutcome<T>,
}

/// Result of [`run_batch`].
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult<T> {
    /// Unique id of this run.
    pub operation_id: Uuid,
    /// Name of the operation, for reports.
    pub operation: String,
    /// Aggregate status.
    pub status: BatchStatus,
    /// Counters.
    pub progress: BatchProgress,
    /// Per-item outcomes in input order.
    pub items: Vec<BatchItemResult<T>>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the last window settled.
    pub finished_at: DateTime<Utc>,
}

impl<T> BatchResult<T> {
    /// Successful items with their values.
    pub fn successes(&self) -> impl Iterator<Item = (&str, &T)> {
        self.items.iter().filter_map(|item| match &item.outcome {
            ItemOutcome::Success(value) => Some((item.id.as_str(), value)),
            ItemOutcome::Failure(_) => None,
        })
    }

    /// Failed items with their error messages.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().filter_map(|item| match &item.outcome {
            ItemOutcome::Failure(message) => Some((item.id.as_str(), message.as_str())),
            ItemOutcome::Success(_) => None,
        })
    }
}

fn aggregate_status(progress: &BatchProgress) -> BatchStatus {
    if progress.failed == 0 {
        BatchStatus::Completed
    } else if progress.succeeded == 0 {
        BatchStatus::Failed
    } else {
        BatchStatus::PartialFailure
    }
}

/// Runs `op` once per id with bounded concurrency. Start and finish
/// times are read from `clock`.
///
/// # Errors
///
/// `EppError::InvalidInput` when `options` has a zero size. Item errors are
/// recorded in the result, never returned.
pub async fn run_batch<T, F, Fut>(
    operation: &str,
    ids: &[String],
    options: &BatchOptions,
    clock: &dyn Clock,
    op: F,
) -> Result<BatchResult<T>>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    options.validate()?;

    let operation_id = Uuid::new_v4();
    let started_at = clock.utc_now();
    let mut progress = BatchProgress {
        total: ids.len(),
        ..Default::default()
    };
    let mut items = Vec::with_capacity(ids.len());

    info!(%operation_id, operation, total = ids.len(), "batch started");

    for (batch_index, batch) in ids.chunks(options.batch_size).enumerate() {
        debug!(%operation_id, batch = batch_index, size = batch.len(), "processing batch");
        for window in batch.chunks(options.max_concurrency) {
            let outcomes = join_all(window.iter().map(|id| op(id.clone()))).await;
            for (id, outcome) in window.iter().zip(outcomes) {
                progress.processed += 1;
                let outcome = match outcome {
                    Ok(value) => {
                        progress.succeeded += 1;
                        ItemOutcome::Success(value)
                    }
                    Err(err) => {
                        progress.failed += 1;
                        debug!(%operation_id, id = %id, error = %err, "batch item failed");
                        ItemOutcome::Failure(err.to_string())
                    }
                };
                items.push(BatchItemResult {
                    id: id.clone(),
                    outcome,
                });
            }
        }
    }

    let status = aggregate_status(&progress);
    info!(
        %operation_id,
        operation,
        succeeded = progress.succeeded,
        failed = progress.failed,
        ?status,
        "batch finished"
    );

    Ok(BatchResult {
        operation_id,
        operation: operation.to_string(),
        status,
        progress,
        items,
        started_at,
        finished_at: clock.utc_now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("dev-{i:03}")).collect()
    }

    #[tokio::test]
    async fn partial_failure_keeps_every_id_in_order() {
        let input = ids(250);
        let failing = ["dev-003", "dev-099", "dev-100", "dev-180", "dev-249"];
        let clock = MockClock::new();
        let options = BatchOptions::new(100, 10);
        let result = run_batch("scan", &input, &options, &clock, |id| async move {
            if failing.contains(&id.as_str()) {
                Err(EppError::InvalidInput(format!("{id} rejected")))
            } else {
                Ok(id.len())
            }
        })
        .await
        .unwrap();

        assert_eq!(result.status, BatchStatus::PartialFailure);
        assert_eq!(result.progress.total, 250);
        assert_eq!(result.progress.processed, 250);
        assert_eq!(result.progress.succeeded, 245);
        assert_eq!(result.progress.failed, 5);
        let seen: Vec<&str> = result.items.iter().map(|i| i.id.as_str()).collect();
        let expected: Vec<&str> = input.iter().map(String::as_str).collect();
        assert_eq!(seen, expected);
        let failed: Vec<&str> = result.failures().map(|(id, _)| id).collect();
        assert_eq!(failed, failing);
    }

    #[tokio::test]
    async fn all_failures_is_failed() {
        let clock = MockClock::new();
        let options = BatchOptions::new(3, 2);
        let result = run_batch("scan", &ids(7), &options, &clock, |_| async {
            Err::<(), _>(EppError::InvalidInput("no".into()))
        })
        .await
        .unwrap();
        assert_eq!(result.status, BatchStatus::Failed);
        assert_eq!(result.progress.failed, 7);
        assert!(result.items.iter().all(|i| !i.outcome.is_success()));
    }

    #[tokio::test]
    async fn empty_input_completes() {
        let clock = MockClock::new();
        let result = run_batch("noop", &[], &BatchOptions::default(), &clock, |_| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(result.progress, BatchProgress::default());
        assert!(result.items.is_empty());
    }

    #[tokio::test]
    async fn zero_sizes_are_rejected() {
        let clock = MockClock::new();
        for options in [BatchOptions::new(0, 5), BatchOptions::new(5, 0)] {
            let result = run_batch("x", &ids(3), &options, &clock, |_| async { Ok(()) }).await;
            assert!(matches!(result, Err(EppError::InvalidInput(_))));
        }
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_max_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let clock = MockClock::new();
        let options = BatchOptions::new(10, 4);
        let result = run_batch("probe", &ids(23), &options, &clock, |_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(result.progress.succeeded, 23);
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(peak.load(Ordering::SeqCst) > 1, "window items should overlap");
    }

    #[tokio::test]
    async fn timestamps_come_from_the_clock() {
        let start = Utc.with_ymd_and_hms(2026, 10, 17, 9, 0, 0).unwrap();
        let clock = MockClock::starting_at(start);
        let options = BatchOptions::new(10, 1);
        let result = run_batch("scan", &ids(3), &options, &clock, |_| {
            let clock = clock.clone();
            async move {
                clock.sleep(std::time::Duration::from_secs(5)).await;
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(result.started_at, start);
        assert_eq!(result.finished_at, start + chrono::Duration::seconds(15));
    }

    #[tokio::test]
    async fn result_serializes_for_reports() {
        let clock = MockClock::new();
        let options = BatchOptions::default();
        let result = run_batch("scan", &ids(2), &options, &clock, |id| async move {
            if id.ends_with('1') {
                Err(EppError::InvalidInput("offline".into()))
            } else {
                Ok("task-9".to_string())
            }
        })
        .await
        .unwrap();
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "partial_failure");
        assert_eq!(value["items"][0]["outcome"]["success"], "task-9");
        assert!(
            value["items"][1]["outcome"]["failure"]
                .as_str()
                .unwrap()
                .contains("offline")
        );
    }
}
