//! Sequential registration runner
//!
//! Per-domain setup work (certificate issuance, renewal) goes through a
//! single worker that runs one job at a time in submission order. This
//! serializes every call into the Certificate Authority process-wide, keeps
//! the external rate limits predictable, and lets one failing domain fail
//! on its own without holding up the rest.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runner errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunnerError {
    #[error("runner worker has shut down")]
    Closed,

    #[error("runner job was dropped before completing")]
    Aborted,
}

/// Run `op` over `items` one at a time, in order.
///
/// Every outcome is collected in input order. A failure is recorded and
/// processing moves on to the next item, unless `stop_on_error` is set, in
/// which case the returned list ends with the first error.
pub async fn each_series<T, R, E, F, Fut>(
    items: impl IntoIterator<Item = T>,
    mut op: F,
    stop_on_error: bool,
) -> Vec<Result<R, E>>
where
    F: FnMut(T, usize) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let mut results = Vec::new();

    for (index, item) in items.into_iter().enumerate() {
        let outcome = op(item, index).await;
        let failed = outcome.is_err();
        results.push(outcome);

        if failed && stop_on_error {
            debug!(index, "Stopping series on first error");
            break;
        }
    }

    results
}

/// Handle to the single-worker job queue
///
/// Cloning the handle shares the same worker.
#[derive(Debug, Clone)]
pub struct SequentialRunner {
    tx: mpsc::UnboundedSender<Job>,
    queued: Arc<AtomicUsize>,
    stop_on_error: bool,
}

impl SequentialRunner {
    /// Spawn the worker on the current Tokio runtime
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let queued = Arc::new(AtomicUsize::new(0));
        let worker_queued = Arc::clone(&queued);

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                // Run on its own task so a panicking job cannot take the worker down
                if let Err(e) = tokio::spawn(job).await {
                    error!(error = %e, "Runner job panicked");
                }
                let remaining = worker_queued.fetch_sub(1, Ordering::AcqRel) - 1;
                trace!(remaining, "Runner job finished");
            }
            debug!("Runner worker stopped");
        });

        Self {
            tx,
            queued,
            stop_on_error: false,
        }
    }

    /// Stop a series at its first failing item
    pub fn with_stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    /// Jobs queued or running
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Enqueue a job behind everything already submitted
    pub fn submit<F>(&self, job: F) -> Result<(), RunnerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.queued.fetch_add(1, Ordering::AcqRel);
        self.tx.send(Box::pin(job)).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            RunnerError::Closed
        })
    }

    /// Run `op` over `items` as one job and wait for all results.
    ///
    /// See [`each_series`] for ordering and error semantics.
    pub async fn run_series<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        op: F,
    ) -> Result<Vec<Result<R, E>>, RunnerError>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: FnMut(T, usize) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let stop_on_error = self.stop_on_error;

        self.submit(async move {
            let results = each_series(items, op, stop_on_error).await;
            let _ = tx.send(results);
        })?;

        rx.await.map_err(|_| RunnerError::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_each_series_isolates_errors() {
        let results = each_series(
            vec![1, 2, 3, 4],
            |n, _| async move { if n == 3 { Err(format!("bad {n}")) } else { Ok(n * 10) } },
            false,
        )
        .await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0], Ok(10));
        assert_eq!(results[1], Ok(20));
        assert_eq!(results[2], Err("bad 3".to_string()));
        assert_eq!(results[3], Ok(40));
    }

    #[tokio::test]
    async fn test_each_series_stop_on_error() {
        let results = each_series(
            vec![1, 2, 3, 4],
            |n, _| async move { if n == 2 { Err(n) } else { Ok(n) } },
            true,
        )
        .await;

        assert_eq!(results, vec![Ok(1), Err(2)]);
    }

    #[tokio::test]
    async fn test_each_series_passes_index() {
        let results: Vec<Result<usize, ()>> =
            each_series(vec!["a", "b", "c"], |_, i| async move { Ok(i) }, false).await;
        assert_eq!(results, vec![Ok(0), Ok(1), Ok(2)]);
    }

    #[tokio::test]
    async fn test_run_series_preserves_order_and_length() {
        let runner = SequentialRunner::spawn();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_op = Arc::clone(&seen);

        let items: Vec<u64> = (0..6).collect();
        let results = runner
            .run_series(items, move |n, _| {
                let seen = Arc::clone(&seen_op);
                async move {
                    // Later items finish faster; order must still hold
                    tokio::time::sleep(Duration::from_millis(12 - n * 2)).await;
                    seen.lock().unwrap().push(n);
                    if n == 4 {
                        Err("issuance failed")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 6);
        for (k, result) in results.iter().enumerate() {
            if k == 4 {
                assert_eq!(*result, Err("issuance failed"));
            } else {
                assert_eq!(*result, Ok(k as u64));
            }
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_jobs_never_overlap() {
        let runner = SequentialRunner::spawn();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut waiters = Vec::new();
        for _ in 0..5 {
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            let (done_tx, done_rx) = oneshot::channel();
            runner
                .submit(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    let _ = done_tx.send(());
                })
                .unwrap();
            waiters.push(done_rx);
        }

        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queued_counts_waiting_and_running_jobs() {
        let runner = SequentialRunner::spawn();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        assert_eq!(runner.queued(), 0);

        for _ in 0..3 {
            let gate = Arc::clone(&gate);
            runner
                .submit(async move {
                    let _ = gate.acquire().await;
                })
                .unwrap();
        }
        assert_eq!(runner.queued(), 3);

        gate.add_permits(1);
        while runner.queued() > 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_worker() {
        let runner = SequentialRunner::spawn();
        let fail = true;
        runner
            .submit(async move {
                if fail {
                    panic!("boom");
                }
            })
            .unwrap();

        let results: Vec<Result<u8, ()>> = runner
            .run_series(vec![7u8], |n, _| async move { Ok(n) })
            .await
            .unwrap();
        assert_eq!(results, vec![Ok(7)]);
    }

    #[tokio::test]
    async fn test_runner_stop_on_error_flag() {
        let runner = SequentialRunner::spawn().with_stop_on_error(true);
        let results = runner
            .run_series(vec![1, 2, 3], |n, _| async move { if n == 1 { Err(n) } else { Ok(n) } })
            .await
            .unwrap();
        assert_eq!(results, vec![Err(1)]);
    }
}
