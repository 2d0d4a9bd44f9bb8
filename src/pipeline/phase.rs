//! Bulk-synchronous phase execution
//!
//! A phase fans one action out per item, at most `max_parallel` at a time, and
//! returns once every item has finished. Item failures are values; a failing or
//! panicking item never affects its siblings.

use crate::types::{ItemOutcome, PhaseReport};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

/// Run `action` for every item with bounded parallelism
///
/// Outcomes are returned in input order.
pub async fn run_phase<T, F, Fut>(
    name: &str,
    items: Vec<T>,
    max_parallel: usize,
    action: F,
) -> Vec<ItemOutcome>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ItemOutcome> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let action = Arc::new(action);
    let started = Instant::now();
    tracing::info!(phase = name, items = items.len(), max_parallel, "phase started");

    let mut handles = Vec::with_capacity(items.len());
    for item in items {
        // the semaphore is never closed
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let action = Arc::clone(&action);
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            action(item).await
        }));
    }

    let outcomes: Vec<ItemOutcome> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(phase = name, error = %e, "phase item panicked");
                ItemOutcome::Failed {
                    exit_code: None,
                    reason: format!("task failed: {e}"),
                }
            }
        })
        .collect();

    let report = PhaseReport::from_outcomes(name, &outcomes);
    tracing::info!(
        phase = name,
        succeeded = report.succeeded,
        failed = report.failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "phase finished"
    );
    outcomes
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Gauge {
        running: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
    }

    async fn measured(gauge: Arc<Gauge>, delay_ms: u64) -> ItemOutcome {
        let now = gauge.running.fetch_add(1, Ordering::SeqCst) + 1;
        gauge.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        gauge.running.fetch_sub(1, Ordering::SeqCst);
        gauge.finished.fetch_add(1, Ordering::SeqCst);
        ItemOutcome::Succeeded
    }

    #[tokio::test]
    async fn failures_are_local_and_ordered() {
        let outcomes = run_phase("test", vec![0, 1, 2, 3], 2, |i: i32| async move {
            if i == 1 {
                ItemOutcome::from_exit_code(9)
            } else {
                ItemOutcome::Succeeded
            }
        })
        .await;

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes[0].is_success());
        assert_eq!(outcomes[1], ItemOutcome::from_exit_code(9));
        assert!(outcomes[2].is_success());
        assert!(outcomes[3].is_success());
    }

    #[tokio::test]
    async fn panicking_item_becomes_failure() {
        let outcomes = run_phase("test", vec![true, false], 1, |boom: bool| async move {
            if boom {
                panic!("boom");
            }
            ItemOutcome::Succeeded
        })
        .await;
        assert!(!outcomes[0].is_success());
        assert!(outcomes[1].is_success());
    }

    #[tokio::test]
    async fn empty_phase_returns_immediately() {
        let outcomes = run_phase("empty", Vec::<u8>::new(), 4, |_| async {
            ItemOutcome::Succeeded
        })
        .await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn join_barrier_waits_for_every_item() {
        let gauge = Arc::new(Gauge::default());
        let g = Arc::clone(&gauge);
        run_phase("barrier", (0..10).collect(), 3, move |i: u64| {
            measured(Arc::clone(&g), i % 4 * 5)
        })
        .await;
        assert_eq!(gauge.finished.load(Ordering::SeqCst), 10);
        assert_eq!(gauge.running.load(Ordering::SeqCst), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn never_exceeds_parallelism(items in 0usize..40, bound in 1usize..6) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_time()
                .build()
                .unwrap();
            let gauge = Arc::new(Gauge::default());
            let g = Arc::clone(&gauge);
            let outcomes = rt.block_on(run_phase("bounded", (0..items).collect(), bound, move |i: usize| {
                measured(Arc::clone(&g), (i % 3) as u64)
            }));

            prop_assert_eq!(outcomes.len(), items);
            prop_assert!(gauge.peak.load(Ordering::SeqCst) <= bound);
            prop_assert_eq!(gauge.finished.load(Ordering::SeqCst), items);
        }
    }
}
