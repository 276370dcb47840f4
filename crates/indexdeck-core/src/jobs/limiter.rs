//! Bounded-parallelism task runner.

use std::future::Future;

use tokio::task::{JoinError, JoinSet};

/// Default number of simultaneous per-item calls.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// A task that did not produce a value.
#[derive(Debug, Clone, thiserror::Error)]
#[error("task aborted: {0}")]
pub struct TaskAborted(String);

impl From<JoinError> for TaskAborted {
    fn from(err: JoinError) -> Self {
        TaskAborted(err.to_string())
    }
}

/// Outcome of one task. The task's own `T` carries success or failure.
pub type TaskOutcome<T> = Result<T, TaskAborted>;

/// Runs tasks with at most `limit` in flight.
///
/// A new task starts as soon as a slot frees up. Outcomes are collected in
/// completion order; a failing or panicking task never stops its siblings.
/// No retries.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimiter {
    limit: usize,
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn run<T, Fut>(&self, tasks: Vec<Fut>) -> Vec<TaskOutcome<T>>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.run_with(tasks, |_| {}).await
    }

    /// Like [`run`](Self::run), calling `on_settle` as each task finishes.
    pub async fn run_with<T, Fut>(
        &self,
        tasks: Vec<Fut>,
        mut on_settle: impl FnMut(&TaskOutcome<T>),
    ) -> Vec<TaskOutcome<T>>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut outcomes = Vec::with_capacity(tasks.len());
        let mut in_flight = JoinSet::new();

        for task in tasks {
            while in_flight.len() >= self.limit {
                if let Some(joined) = in_flight.join_next().await {
                    let outcome = joined.map_err(TaskAborted::from);
                    on_settle(&outcome);
                    outcomes.push(outcome);
                }
            }
            in_flight.spawn(task);
        }

        while let Some(joined) = in_flight.join_next().await {
            let outcome = joined.map_err(TaskAborted::from);
            on_settle(&outcome);
            outcomes.push(outcome);
        }

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn gauged_tasks(
        count: usize,
        gauge: &Arc<Gauge>,
    ) -> Vec<impl Future<Output = usize> + Send + 'static> {
        (0..count)
            .map(|i| {
                let gauge = gauge.clone();
                async move {
                    gauge.enter();
                    tokio::time::sleep(Duration::from_millis(10 + (i as u64 % 4) * 5)).await;
                    gauge.exit();
                    i
                }
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_limit() {
        for count in [0, 1, 2, 3, 4, 10, 25] {
            let gauge = Gauge::new();
            let limiter = ConcurrencyLimiter::new(3);

            let outcomes = limiter.run(gauged_tasks(count, &gauge)).await;

            assert_eq!(outcomes.len(), count);
            assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
            if count >= 3 {
                assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
            }
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_siblings() {
        let limiter = ConcurrencyLimiter::new(2);
        let tasks: Vec<_> = (0..6)
            .map(|i| async move {
                if i % 2 == 0 {
                    Err(format!("item {} failed", i))
                } else {
                    Ok(i)
                }
            })
            .collect();

        let outcomes = limiter.run(tasks).await;
        let ok = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(Ok(_))))
            .count();
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(Err(_))))
            .count();

        assert_eq!(ok, 3);
        assert_eq!(failed, 3);
    }

    #[tokio::test]
    async fn test_panicking_task_is_isolated() {
        let limiter = ConcurrencyLimiter::new(2);
        let tasks: Vec<std::pin::Pin<Box<dyn Future<Output = u32> + Send>>> = vec![
            Box::pin(async { 1 }),
            Box::pin(async { panic!("boom") }),
            Box::pin(async { 3 }),
        ];

        let mut settled = 0;
        let outcomes = limiter.run_with(tasks, |_| settled += 1).await;

        assert_eq!(settled, 3);
        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 2);
        assert_eq!(outcomes.iter().filter(|o| o.is_err()).count(), 1);
    }

    #[test]
    fn test_zero_limit_is_clamped() {
        assert_eq!(ConcurrencyLimiter::new(0).limit(), 1);
        assert_eq!(ConcurrencyLimiter::default().limit(), DEFAULT_CONCURRENCY);
    }
}
