use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Run `f` over every item with at most `concurrency` futures in flight.
///
/// Results come back in completion order, not item order.
pub async fn run_bounded<I, F, Fut, T>(items: I, concurrency: usize, f: F) -> Result<Vec<T>>
where
    I: IntoIterator,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();
    let mut results = Vec::new();

    let mut items = items.into_iter();
    loop {
        // Reap finished tasks as we go so long runs do not pile up completed handles.
        while let Some(joined) = set.try_join_next() {
            results.push(joined.context("worker task panicked")?);
        }

        // Take the permit before pulling the next item, so a lazy iterator
        // observes the moment a slot actually frees up.
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .context("worker pool semaphore closed")?;
        let Some(item) = items.next() else {
            break;
        };
        let fut = f(item);
        set.spawn(async move {
            let out = fut.await;
            drop(permit);
            out
        });
    }

    while let Some(joined) = set.join_next().await {
        results.push(joined.context("worker task panicked")?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_bound_is_respected_and_every_item_runs() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = run_bounded(0..50u64, 4, |i| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10 + i % 7)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                i
            }
        })
        .await
        .unwrap();

        assert_eq!(results.len(), 50);
        let mut sorted = results.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_run_keeps_every_result_once() {
        let results = run_bounded(0..5_000u64, 3, |i| async move {
            tokio::time::sleep(Duration::from_millis(1 + i % 3)).await;
            i
        })
        .await
        .unwrap();

        assert_eq!(results.len(), 5_000);
        assert_eq!(results.iter().sum::<u64>(), (0..5_000u64).sum::<u64>());
    }

    #[tokio::test]
    async fn test_zero_concurrency_still_progresses() {
        let results = run_bounded(vec![1, 2, 3], 0, |i| async move { i * 2 })
            .await
            .unwrap();
        assert_eq!(results.iter().sum::<i32>(), 12);
    }
}
