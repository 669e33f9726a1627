//! Bounded-concurrency task execution.
//!
//! A [`WorkerPool`] gates how many submitted futures are *running* at once
//! with a counting semaphore. Submission never blocks; queued tasks wait for
//! a permit inside their own spawned task.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A bounded pool of async tasks producing values of type `T`.
///
/// Each task's output is returned by [`WorkerPool::wait`], so callers can
/// reduce results sequentially instead of sharing a lock across tasks.
pub struct WorkerPool<T> {
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    tasks: JoinSet<Option<T>>,
    limit: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create a pool running at most `limit` tasks at once. Zero is clamped to one.
    pub fn new(limit: usize) -> Self {
        Self::with_cancellation(limit, CancellationToken::new())
    }

    /// Create a pool whose queued tasks are dropped once `cancel` fires.
    ///
    /// Tasks already holding a permit run to completion.
    pub fn with_cancellation(limit: usize, cancel: CancellationToken) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            cancel,
            tasks: JoinSet::new(),
            limit,
        }
    }

    /// The concurrency ceiling.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of submitted tasks not yet collected.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Schedule a task. Returns immediately.
    pub fn submit<F>(&mut self, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            if cancel.is_cancelled() {
                return None;
            }
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                permit = semaphore.acquire_owned() => permit.ok()?,
            };
            Some(task.await)
        });
    }

    /// Wait for every submitted task and return the outputs of those that ran.
    ///
    /// Output order follows completion order.
    pub async fn wait(mut self) -> Vec<T> {
        let mut outputs = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Some(output)) => outputs.push(output),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "worker task did not complete"),
            }
        }
        outputs
    }
}

type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Runs a function over a batch of items on a [`WorkerPool`].
#[derive(Clone)]
pub struct BatchProcessor {
    limit: usize,
    cancel: CancellationToken,
    progress: Option<ProgressFn>,
}

impl BatchProcessor {
    /// Create a processor with the given concurrency ceiling.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Drop items not yet started once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Report `(processed, total)` after each item completes.
    pub fn with_progress(mut self, progress: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Process every item. The result has one slot per input item, in input
    /// order; `None` marks an item dropped by cancellation.
    pub async fn process<I, F, Fut, T>(&self, items: Vec<I>, f: F) -> Vec<Option<T>>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let total = items.len();
        let done = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::with_cancellation(self.limit, self.cancel.clone());

        for (idx, item) in items.into_iter().enumerate() {
            let fut = f(item);
            let done = Arc::clone(&done);
            let progress = self.progress.clone();
            pool.submit(async move {
                let output = fut.await;
                let processed = done.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(progress) = progress {
                    progress(processed, total);
                }
                (idx, output)
            });
        }

        let mut slots: Vec<Option<T>> = (0..total).map(|_| None).collect();
        for (idx, output) in pool.wait().await {
            slots[idx] = Some(output);
        }
        slots
    }
}
