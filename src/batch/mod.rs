//! Bounded-concurrency batch orchestrator.
//!
//! Items are split into consecutive chunks. Every item of a chunk is
//! launched before any is awaited, the chunk is awaited as a whole, and an
//! optional pause separates chunks. A failing item never affects its
//! siblings: errors, panics and timeouts all become a [`ItemResult::Failure`]
//! at that item's position. Output order always matches input order.

use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::join_all;
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

/// Chunking and timing for [`run_batch`].
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Items launched together. Zero is treated as one.
    pub chunk_size: usize,
    /// Pause between chunks. Never applied after the last chunk.
    pub inter_chunk_delay: Duration,
    /// Upper bound for a single item. `None` waits indefinitely.
    pub item_timeout: Option<Duration>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5,
            inter_chunk_delay: Duration::ZERO,
            item_timeout: None,
        }
    }
}

impl BatchConfig {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.inter_chunk_delay = delay;
        self
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = Some(timeout);
        self
    }
}

/// How an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The operation returned an error.
    Failed,
    /// The operation panicked, either while starting or while running.
    Panicked,
    /// The item did not settle within the configured timeout.
    TimedOut,
}

/// Structured per-item failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    /// Position of the item in the input.
    pub index: usize,
    pub message: String,
    pub kind: FailureKind,
}

/// Outcome of one item. Exactly one side is populated.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemResult<R> {
    Success(R),
    Failure(ItemError),
}

impl<R> ItemResult<R> {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemResult::Success(_))
    }

    pub fn success(&self) -> Option<&R> {
        match self {
            ItemResult::Success(value) => Some(value),
            ItemResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ItemError> {
        match self {
            ItemResult::Success(_) => None,
            ItemResult::Failure(err) => Some(err),
        }
    }
}

/// Aggregate result of a batch. `succeeded + failed == total`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome<R> {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// One entry per input item, in input order.
    pub results: Vec<ItemResult<R>>,
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

impl<R> BatchOutcome<R> {
    fn from_results(results: Vec<ItemResult<R>>, elapsed: Duration) -> Self {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
            elapsed,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.total as f64
        }
    }

    /// Successful values in input order.
    pub fn successes(&self) -> impl Iterator<Item = &R> {
        self.results.iter().filter_map(ItemResult::success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemError> {
        self.results.iter().filter_map(ItemResult::failure)
    }
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Run `op` over `items` in chunks of `config.chunk_size`.
pub async fn run_batch<T, R, E, F, Fut>(items: Vec<T>, op: F, config: &BatchConfig) -> BatchOutcome<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Display,
{
    let start = Instant::now();
    let total = items.len();
    if total == 0 {
        return BatchOutcome::from_results(Vec::new(), start.elapsed());
    }

    let chunk_size = config.chunk_size.max(1);
    let chunk_count = total.div_ceil(chunk_size);
    let mut results = Vec::with_capacity(total);
    let mut pending = items.into_iter().enumerate();

    debug!(total, chunk_size, chunk_count, "Starting batch");

    for chunk_index in 0..chunk_count {
        let launched: Vec<Launched<Fut>> = pending
            .by_ref()
            .take(chunk_size)
            .map(|(index, item)| launch(index, &op, item))
            .collect();

        let settled = join_all(
            launched
                .into_iter()
                .map(|entry| settle(entry, config.item_timeout)),
        )
        .await;
        results.extend(settled);

        let is_last = chunk_index + 1 == chunk_count;
        if !is_last && !config.inter_chunk_delay.is_zero() {
            tokio::time::sleep(config.inter_chunk_delay).await;
        }
    }

    let outcome = BatchOutcome::from_results(results, start.elapsed());
    info!(
        total = outcome.total,
        succeeded = outcome.succeeded,
        failed = outcome.failed,
        elapsed_ms = outcome.elapsed.as_millis() as u64,
        "Batch complete"
    );
    outcome
}

// ── Item boundary ───────────────────────────────────────────────────

enum Launched<Fut> {
    Running { index: usize, fut: Fut },
    Panicked { index: usize, message: String },
}

fn launch<T, F, Fut>(index: usize, op: &F, item: T) -> Launched<Fut>
where
    F: Fn(T) -> Fut,
{
    match panic::catch_unwind(AssertUnwindSafe(|| op(item))) {
        Ok(fut) => Launched::Running { index, fut },
        Err(payload) => Launched::Panicked {
            index,
            message: panic_message(payload.as_ref()),
        },
    }
}

async fn settle<R, E, Fut>(entry: Launched<Fut>, timeout: Option<Duration>) -> ItemResult<R>
where
    Fut: Future<Output = Result<R, E>>,
    E: Display,
{
    let (index, fut) = match entry {
        Launched::Running { index, fut } => (index, fut),
        Launched::Panicked { index, message } => {
            warn!(index, error = %message, "Batch item panicked on launch");
            return failure(index, message, FailureKind::Panicked);
        }
    };

    let guarded = AssertUnwindSafe(fut).catch_unwind();
    let settled = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(settled) => settled,
            Err(_) => {
                warn!(index, timeout_ms = limit.as_millis() as u64, "Batch item timed out");
                return failure(
                    index,
                    format!("timed out after {}ms", limit.as_millis()),
                    FailureKind::TimedOut,
                );
            }
        },
        None => guarded.await,
    };

    match settled {
        Ok(Ok(value)) => ItemResult::Success(value),
        Ok(Err(err)) => {
            warn!(index, error = %err, "Batch item failed");
            failure(index, err.to_string(), FailureKind::Failed)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(index, error = %message, "Batch item panicked");
            failure(index, message, FailureKind::Panicked)
        }
    }
}

fn failure<R>(index: usize, message: String, kind: FailureKind) -> ItemResult<R> {
    ItemResult::Failure(ItemError {
        index,
        message,
        kind,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn values<R: Clone>(outcome: &BatchOutcome<R>) -> Vec<Option<R>> {
        outcome.results.iter().map(|r| r.success().cloned()).collect()
    }

    #[tokio::test]
    async fn empty_batch_returns_immediately() {
        let calls = AtomicUsize::new(0);
        let outcome = run_batch(
            Vec::<u32>::new(),
            |x| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, String>(x) }
            },
            &BatchConfig::new(3).with_delay(Duration::from_secs(5)),
        )
        .await;

        assert_eq!(outcome.total, 0);
        assert_eq!(outcome.succeeded, 0);
        assert_eq!(outcome.failed, 0);
        assert!(outcome.results.is_empty());
        assert!(outcome.elapsed < Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn order_preserved_when_later_items_finish_first() {
        let items: Vec<u64> = (0..6).collect();
        let outcome = run_batch(
            items,
            |i| async move {
                tokio::time::sleep(Duration::from_millis((6 - i) * 10)).await;
                Ok::<_, String>(i * 10)
            },
            &BatchConfig::new(6),
        )
        .await;

        assert_eq!(
            values(&outcome),
            vec![Some(0), Some(10), Some(20), Some(30), Some(40), Some(50)]
        );
    }

    #[tokio::test]
    async fn failing_item_is_isolated_across_chunks() {
        let items = vec!["a", "b", "c", "d", "e"];
        let seen = Arc::new(AtomicUsize::new(0));
        let outcome = run_batch(
            items,
            |s| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if s == "c" {
                        Err("boom".to_string())
                    } else {
                        Ok(s.to_uppercase())
                    }
                }
            },
            &BatchConfig::new(2).with_delay(Duration::from_millis(5)),
        )
        .await;

        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert_eq!(outcome.total, 5);
        assert_eq!(outcome.succeeded, 4);
        assert_eq!(outcome.failed, 1);
        assert_eq!(
            values(&outcome),
            vec![
                Some("A".to_string()),
                Some("B".to_string()),
                None,
                Some("D".to_string()),
                Some("E".to_string()),
            ]
        );
        let err = outcome.results[2].failure().unwrap();
        assert_eq!(err.index, 2);
        assert_eq!(err.message, "boom");
        assert_eq!(err.kind, FailureKind::Failed);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_chunk_size() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let outcome = run_batch(
            (0..11).collect::<Vec<u32>>(),
            |i| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(i)
                }
            },
            &BatchConfig::new(4),
        )
        .await;

        assert_eq!(outcome.succeeded, 11);
        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn whole_chunk_is_launched_before_any_completes() {
        let launched = Arc::new(AtomicUsize::new(0));

        let outcome = run_batch(
            vec![0u32, 1, 2],
            |i| {
                launched.fetch_add(1, Ordering::SeqCst);
                let launched = Arc::clone(&launched);
                async move { Ok::<_, String>((i, launched.load(Ordering::SeqCst))) }
            },
            &BatchConfig::new(3),
        )
        .await;

        for seen in outcome.successes() {
            assert_eq!(seen.1, 3);
        }
    }

    #[tokio::test]
    async fn sync_and_async_failures_are_both_captured() {
        let outcome = run_batch(
            vec![0u32, 1, 2, 3],
            |i| {
                if i == 1 {
                    panic!("refused to start");
                }
                async move {
                    match i {
                        2 => Err("async failure".to_string()),
                        3 => panic!("blew up mid-flight"),
                        _ => Ok(i),
                    }
                }
            },
            &BatchConfig::new(4),
        )
        .await;

        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed, 3);

        let kinds: Vec<_> = outcome.failures().map(|e| (e.index, e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (1, FailureKind::Panicked),
                (2, FailureKind::Failed),
                (3, FailureKind::Panicked),
            ]
        );
        assert_eq!(outcome.results[1].failure().unwrap().message, "refused to start");
    }

    #[tokio::test]
    async fn all_failures_still_return_outcome() {
        let outcome = run_batch(
            vec![1, 2, 3],
            |_| async { Err::<(), _>("nope") },
            &BatchConfig::new(2),
        )
        .await;

        assert_eq!(outcome.succeeded, 0);
        assert_eq!(outcome.failed, 3);
        assert_eq!(outcome.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn slow_item_times_out_without_blocking_siblings() {
        let outcome = run_batch(
            vec![0u64, 1],
            |i| async move {
                if i == 1 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok::<_, String>(i)
            },
            &BatchConfig::new(2).with_item_timeout(Duration::from_millis(20)),
        )
        .await;

        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.results[1].failure().unwrap().kind, FailureKind::TimedOut);
        assert!(outcome.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn single_chunk_skips_delay() {
        let outcome = run_batch(
            vec![1, 2, 3],
            |i| async move { Ok::<_, String>(i) },
            &BatchConfig::new(10).with_delay(Duration::from_secs(5)),
        )
        .await;

        assert_eq!(outcome.succeeded, 3);
        assert!(outcome.elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn zero_chunk_size_is_clamped() {
        let outcome = run_batch(
            vec![1, 2],
            |i| async move { Ok::<_, String>(i) },
            &BatchConfig::new(0),
        )
        .await;
        assert_eq!(outcome.succeeded, 2);
    }

    #[test]
    fn outcome_serializes_results_in_order() {
        let outcome = BatchOutcome::from_results(
            vec![
                ItemResult::Success(1),
                failure(1, "bad".into(), FailureKind::Failed),
            ],
            Duration::from_millis(1500),
        );
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["total"], 2);
        assert_eq!(json["results"][0]["success"], 1);
        assert_eq!(json["results"][1]["failure"]["kind"], "failed");
        assert_eq!(json["elapsed_secs"], 1.5);
    }
}
