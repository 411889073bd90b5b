//! Bounded parallel execution over a list of items.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tokio::task::JoinSet;
use tracing::error;

/// Result of a [`parallelize`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParallelOutcome {
    /// Number of chunks the items were split into.
    pub chunks: usize,
    /// Indices of chunks whose function panicked, ascending.
    pub panicked: Vec<usize>,
}

impl ParallelOutcome {
    /// True if every chunk ran to completion.
    pub const fn is_clean(&self) -> bool {
        self.panicked.is_empty()
    }
}

/// Split `items` into at most `max_workers` contiguous chunks of
/// `ceil(len / max_workers)` items and run `f` on each chunk in its own
/// task.
///
/// A panic inside `f` is caught and logged. It ends processing of that
/// chunk only; sibling chunks and the caller are unaffected. Resolves once
/// every chunk has finished.
///
/// A `max_workers` of zero is treated as one.
pub async fn parallelize<T, F>(max_workers: usize, items: Vec<T>, f: F) -> ParallelOutcome
where
    T: Send + 'static,
    F: Fn(Vec<T>) + Send + Sync + 'static,
{
    if items.is_empty() {
        return ParallelOutcome::default();
    }

    let chunk_size = items.len().div_ceil(max_workers.max(1));
    let f = Arc::new(f);
    let mut tasks = JoinSet::new();
    let mut chunks = 0;

    let mut items = items.into_iter();
    loop {
        let chunk: Vec<T> = items.by_ref().take(chunk_size).collect();
        if chunk.is_empty() {
            break;
        }
        let index = chunks;
        chunks += 1;

        let f = Arc::clone(&f);
        tasks.spawn(async move {
            let len = chunk.len();
            catch_unwind(AssertUnwindSafe(|| f(chunk))).map_err(|payload| {
                error!(chunk = index, len, reason = panic_reason(&*payload), "parallel worker panicked");
                index
            })
        });
    }

    let mut panicked = Vec::new();
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(index)) => panicked.push(index),
            Err(err) => error!(%err, "parallel worker failed to complete"),
        }
    }
    panicked.sort_unstable();

    ParallelOutcome { chunks, panicked }
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    #[tokio::test]
    async fn empty_input_spawns_nothing() {
        let outcome = parallelize(16, Vec::<u32>::new(), |_| unreachable!()).await;
        assert_eq!(outcome, ParallelOutcome::default());
    }

    #[tokio::test]
    async fn partitions_into_contiguous_chunks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let outcome = parallelize(3, (0..10).collect(), move |chunk: Vec<u32>| {
            sink.lock().unwrap().push(chunk);
        })
        .await;
        assert_eq!(outcome.chunks, 3);
        assert!(outcome.is_clean());

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
    }

    #[tokio::test]
    async fn fewer_items_than_workers() {
        let outcome = parallelize(16, vec![1, 2, 3], |_| {}).await;
        assert_eq!(outcome.chunks, 3);

        let outcome = parallelize(0, vec![1, 2, 3], |_| {}).await;
        assert_eq!(outcome.chunks, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn panic_is_isolated_to_its_chunk() {
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&processed);

        let outcome = parallelize(4, (0..40).collect(), move |chunk: Vec<u32>| {
            for item in chunk {
                if item == 15 {
                    panic!("bad item {item}");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(outcome.chunks, 4);
        assert_eq!(outcome.panicked, vec![1]);
        // Chunk 1 (10..20) stopped at 15; every other item was processed.
        assert_eq!(processed.load(Ordering::SeqCst), 35);
    }
}
