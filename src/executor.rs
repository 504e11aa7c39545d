//! Bounded parallel execution with phase barriers.
//!
//! A phase is a set of independent tasks. [`ParallelExecutor::run_phase`]
//! returns only after every task of the phase finished, so the next phase
//! can read what this one produced. The first failing task aborts the rest
//! of the phase and its error is returned.
//!
//! ```text
//! run_fan_out (top-level permits)          run_phase (leaf permits)
//!   party A ──▶ run_phase ──▶ shard 0..n      shard 0 ─┐
//!   party B ──▶ run_phase ──▶ shard 0..n      shard 1 ─┼─▶ barrier ─▶ Vec<T>
//!                                             shard n ─┘
//! ```
//!
//! Top-level tasks draw from their own permit pool, so a top-level task
//! waiting on its children never holds a slot those children need.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, Instrument};

use crate::error::PipelineError;

/// Smallest pool that supports nested fan-out.
pub const MIN_NESTED_WORKERS: usize = 4;

/// A labelled unit of work.
pub struct Task<F> {
    /// Label used in logs and for fan-in grouping.
    pub label: String,
    /// The work itself.
    pub future: F,
}

impl<F> Task<F> {
    /// Create a task.
    pub fn new(label: impl Into<String>, future: F) -> Self {
        Self { label: label.into(), future }
    }
}

/// Completion counter per category.
///
/// Emits exactly once per category, when its count reaches the expected number of tasks.
#[derive(Debug, Clone, Default)]
pub struct CategoryCounter {
    expected: BTreeMap<String, usize>,
    done: BTreeMap<String, usize>,
}

impl CategoryCounter {
    /// Create a counter from the expected task count per category.
    pub fn new(expected: impl IntoIterator<Item = (String, usize)>) -> Self {
        Self {
            expected: expected.into_iter().collect(),
            done: BTreeMap::new(),
        }
    }

    /// Record one completion. Returns `true` when this completes the category.
    pub fn record(&mut self, category: &str) -> bool {
        let done = self.done.entry(category.to_string()).or_insert(0);
        *done += 1;
        self.expected.get(category).map_or(false, |expected| *done == *expected)
    }

    /// Whether every category has completed.
    pub fn is_complete(&self) -> bool {
        self.expected
            .iter()
            .all(|(c, expected)| self.done.get(c).copied().unwrap_or(0) >= *expected)
    }
}

/// Worker pool for shard and party fan-out.
#[derive(Debug, Clone)]
pub struct ParallelExecutor {
    leaf: Arc<Semaphore>,
    top: Arc<Semaphore>,
    max_workers: usize,
}

impl ParallelExecutor {
    /// Pool with `max_workers` leaf slots.
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            leaf: Arc::new(Semaphore::new(max_workers)),
            top: Arc::new(Semaphore::new((max_workers / MIN_NESTED_WORKERS).max(1))),
            max_workers,
        }
    }

    /// Pool for nested fan-out, at least [`MIN_NESTED_WORKERS`] wide.
    pub fn nested(max_workers: usize) -> Self {
        Self::new(max_workers.max(MIN_NESTED_WORKERS))
    }

    /// Leaf pool size.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run leaf tasks as one phase; results come back in task order.
    pub async fn run_phase<T, F>(&self, phase: &str, tasks: Vec<Task<F>>) -> Result<Vec<T>, PipelineError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let mut results = Vec::with_capacity(tasks.len());
        self.run_with(&self.leaf, phase, tasks, |_, r| results.push(r)).await?;
        results.sort_by_key(|(idx, _)| *idx);
        Ok(results.into_iter().map(|(_, r)| r).collect())
    }

    /// Run top-level tasks that may themselves call [`run_phase`](Self::run_phase).
    pub async fn run_fan_out<T, F>(&self, phase: &str, tasks: Vec<Task<F>>) -> Result<Vec<T>, PipelineError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let mut results = Vec::with_capacity(tasks.len());
        self.run_with(&self.top, phase, tasks, |_, r| results.push(r)).await?;
        results.sort_by_key(|(idx, _)| *idx);
        Ok(results.into_iter().map(|(_, r)| r).collect())
    }

    /// Run leaf tasks grouped by label and hand each group over as soon as all its tasks finished.
    ///
    /// `on_complete` is called once per label, in completion order, with that
    /// label's results in task order.
    pub async fn run_phase_counted<T, F>(
        &self,
        phase: &str,
        tasks: Vec<Task<F>>,
        mut on_complete: impl FnMut(&str, Vec<T>) -> Result<(), PipelineError> + Send,
    ) -> Result<(), PipelineError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let mut expected: BTreeMap<String, usize> = BTreeMap::new();
        for task in &tasks {
            *expected.entry(task.label.clone()).or_insert(0) += 1;
        }
        let mut counter = CategoryCounter::new(expected);
        let mut pending: BTreeMap<String, Vec<(usize, T)>> = BTreeMap::new();
        let mut callback_error = None;

        self.run_with(&self.leaf, phase, tasks, |label, (idx, value)| {
            pending.entry(label.to_string()).or_default().push((idx, value));
            if counter.record(label) {
                let mut group = pending.remove(label).unwrap_or_default();
                group.sort_by_key(|(i, _)| *i);
                debug!(phase, category = label, tasks = group.len(), "Category complete");
                if callback_error.is_none() {
                    if let Err(e) = on_complete(label, group.into_iter().map(|(_, v)| v).collect()) {
                        callback_error = Some(e);
                    }
                }
            }
        })
        .await?;

        match callback_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_with<T, F>(
        &self,
        permits: &Arc<Semaphore>,
        phase: &str,
        tasks: Vec<Task<F>>,
        mut on_result: impl FnMut(&str, (usize, T)) + Send,
    ) -> Result<(), PipelineError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let start = Instant::now();
        let span = info_span!("phase", name = phase);
        let total = tasks.len();
        let mut labels = Vec::with_capacity(total);
        let mut set = JoinSet::new();

        for (idx, task) in tasks.into_iter().enumerate() {
            labels.push(task.label.clone());
            let permits = Arc::clone(permits);
            let task_span = info_span!(parent: &span, "task", label = %task.label);
            let future = task.future;
            set.spawn(
                async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|e| PipelineError::TaskFailed(e.to_string()))?;
                    future.await.map(|value| (idx, value))
                }
                .instrument(task_span),
            );
        }

        while let Some(joined) = set.join_next().await {
            let outcome = joined.map_err(PipelineError::from).and_then(|r| r);
            match outcome {
                Ok((idx, value)) => on_result(&labels[idx], (idx, value)),
                Err(e) => {
                    set.abort_all();
                    tracing::error!(parent: &span, phase, error = %e, "Phase failed, aborting remaining tasks");
                    // Drain so no task outlives the phase.
                    while set.join_next().await.is_some() {}
                    return Err(e);
                }
            }
        }

        info!(
            parent: &span,
            phase,
            tasks = total,
            latency_ms = start.elapsed().as_millis() as u64,
            "Phase complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_keep_task_order() {
        let executor = ParallelExecutor::new(3);
        let tasks: Vec<_> = (0..10u64)
            .map(|i| {
                Task::new(format!("t{i}"), async move {
                    tokio::time::sleep(Duration::from_millis(10 - i)).await;
                    Ok::<_, PipelineError>(i)
                })
            })
            .collect();
        let results = executor.run_phase("order", tasks).await.unwrap();
        assert_eq!(results, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let executor = ParallelExecutor::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                Task::new(format!("t{i}"), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, PipelineError>(())
                })
            })
            .collect();
        executor.run_phase("bounded", tasks).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_first_failure_aborts_phase() {
        let executor = ParallelExecutor::new(4);
        let finished = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let finished = Arc::clone(&finished);
                Task::new(format!("t{i}"), async move {
                    if i == 0 {
                        return Err(PipelineError::Store("shard 0 failed".to_string()));
                    }
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        let err = executor.run_phase("failing", tasks).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(_)));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_counted_fan_in_emits_once_per_category() {
        let executor = ParallelExecutor::new(4);
        let tasks: Vec<_> = ["a", "b", "a", "b", "a"]
            .iter()
            .enumerate()
            .map(|(i, c)| Task::new(*c, async move { Ok::<_, PipelineError>(i) }))
            .collect();

        let mut emitted = Vec::new();
        executor
            .run_phase_counted("counted", tasks, |category, values| {
                emitted.push((category.to_string(), values));
                Ok(())
            })
            .await
            .unwrap();

        emitted.sort();
        assert_eq!(
            emitted,
            vec![("a".to_string(), vec![0, 2, 4]), ("b".to_string(), vec![1, 3])]
        );
    }

    #[tokio::test]
    async fn test_nested_fan_out_does_not_starve() {
        let executor = ParallelExecutor::nested(1);
        assert_eq!(executor.max_workers(), MIN_NESTED_WORKERS);

        let outer: Vec<_> = (0..3)
            .map(|p| {
                let inner_exec = executor.clone();
                Task::new(format!("party{p}"), async move {
                    let inner: Vec<_> = (0..6).map(|s| Task::new(format!("shard{s}"), async move { Ok::<_, PipelineError>(s) })).collect();
                    let values = inner_exec.run_phase("shards", inner).await?;
                    Ok::<_, PipelineError>(values.into_iter().sum::<i32>())
                })
            })
            .collect();

        let sums = tokio::time::timeout(Duration::from_secs(5), executor.run_fan_out("parties", outer))
            .await
            .expect("nested fan-out deadlocked")
            .unwrap();
        assert_eq!(sums, vec![15, 15, 15]);
    }

    #[test]
    fn test_category_counter() {
        let mut counter = CategoryCounter::new([("x".to_string(), 2), ("y".to_string(), 1)]);
        assert!(!counter.record("x"));
        assert!(counter.record("y"));
        assert!(!counter.is_complete());
        assert!(counter.record("x"));
        assert!(counter.is_complete());
    }
}
