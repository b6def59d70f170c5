// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Pool
//!
//! Registry of the worker tasks started by the consumer layer, each of which owns
//! its own channel. During shutdown the pool offers a bounded join: every worker
//! gets up to the same timeout once its join starts. The pool never cancels a
//! worker on its own; what to do with stragglers is the caller's decision.

use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    task::Poll,
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Identifies a worker tracked by a [`WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

struct Worker {
    name: String,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct WorkerPool {
    next_id: AtomicU64,
    workers: Mutex<BTreeMap<WorkerId, Worker>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `task` on the tokio runtime and tracks it.
    pub fn spawn<F>(&self, name: &str, task: F) -> WorkerId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.register(name, tokio::spawn(task))
    }

    /// Tracks an already running task.
    ///
    /// # Parameters
    /// - `name`: label used in the pool's log lines
    /// - `handle`: join handle of the task, owned by the pool from now on
    ///
    /// # Returns
    /// The id the worker is tracked under, also the key of its broker channel.
    pub fn register(&self, name: &str, handle: JoinHandle<()>) -> WorkerId {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(worker = %id, name, "tracking worker");

        self.lock().insert(
            id,
            Worker {
                name: name.to_owned(),
                handle,
            },
        );
        id
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.lock().keys().copied().collect()
    }

    /// Joins every tracked worker, each within `timeout`, in registration order.
    ///
    /// Returns `true` when all of them finished. Stops at the first worker that
    /// does not finish in time and returns `false`; that worker and the ones not
    /// yet joined stay tracked. Workers stay registered while being joined, so
    /// dropping the returned future before it completes leaves every unfinished
    /// worker tracked.
    pub async fn wait_on_threads(&self, timeout: Duration) -> bool {
        for id in self.ids() {
            let joined = std::future::poll_fn(|cx| match self.lock().get_mut(&id) {
                Some(worker) => Pin::new(&mut worker.handle).poll(cx).map(Some),
                None => Poll::Ready(None),
            });

            match tokio::time::timeout(timeout, joined).await {
                // aborted by someone else meanwhile
                Ok(None) => {}
                Ok(Some(result)) => {
                    let name = self.untrack(id);
                    match result {
                        Ok(()) => debug!(worker = %id, name = %name, "worker finished"),
                        Err(err) => warn!(
                            worker = %id,
                            name = %name,
                            error = err.to_string(),
                            "worker terminated abnormally"
                        ),
                    }
                }
                Err(_) => {
                    let name = self
                        .lock()
                        .get(&id)
                        .map(|worker| worker.name.clone())
                        .unwrap_or_default();
                    warn!(
                        worker = %id,
                        name = %name,
                        timeout_ms = timeout.as_millis() as u64,
                        "worker did not finish in time"
                    );
                    return false;
                }
            }
        }

        true
    }

    fn untrack(&self, id: WorkerId) -> String {
        self.lock()
            .remove(&id)
            .map(|worker| worker.name)
            .unwrap_or_default()
    }

    /// Cancels every tracked worker and stops tracking them.
    pub fn abort_all(&self) -> usize {
        let workers = std::mem::take(&mut *self.lock());
        for (id, worker) in &workers {
            debug!(worker = %id, name = %worker.name, "aborting worker");
            worker.handle.abort();
        }
        workers.len()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<WorkerId, Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_workers_joining_in_time() {
        let pool = WorkerPool::new();
        pool.spawn("first", async {});
        pool.spawn("second", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        });

        assert!(pool.wait_on_threads(Duration::from_secs(1)).await);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn a_worker_that_never_finishes() {
        let pool = WorkerPool::new();
        pool.spawn("stuck", std::future::pending());

        assert!(!pool.wait_on_threads(Duration::from_millis(20)).await);
        assert_eq!(pool.len(), 1);

        assert_eq!(pool.abort_all(), 1);
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn each_worker_gets_its_own_timeout() {
        let pool = WorkerPool::new();
        pool.spawn("slow", async {
            tokio::time::sleep(Duration::from_millis(80)).await;
        });
        pool.spawn("slower", async {
            tokio::time::sleep(Duration::from_millis(150)).await;
        });

        assert!(pool.wait_on_threads(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn stops_at_the_first_straggler() {
        let pool = WorkerPool::new();
        let stuck = pool.spawn("stuck", std::future::pending());
        let quick = pool.spawn("quick", async {});

        assert!(!pool.wait_on_threads(Duration::from_millis(20)).await);
        assert_eq!(pool.ids(), vec![stuck, quick]);

        pool.abort_all();
    }

    #[tokio::test]
    async fn an_interrupted_wait_keeps_workers_tracked() {
        let pool = WorkerPool::new();
        pool.spawn("first", std::future::pending());
        pool.spawn("second", std::future::pending());

        let interrupted = tokio::time::timeout(
            Duration::from_millis(10),
            pool.wait_on_threads(Duration::from_secs(5)),
        )
        .await;

        assert!(interrupted.is_err());
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.abort_all(), 2);
    }

    #[tokio::test]
    async fn panicking_workers_count_as_finished() {
        let pool = WorkerPool::new();
        pool.spawn("boom", async { panic!("worker failure") });

        assert!(pool.wait_on_threads(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn registers_external_handles() {
        let pool = WorkerPool::new();
        let id = pool.register("external", tokio::spawn(async {}));

        assert_eq!(id.to_string(), "worker-0");
        assert!(pool.wait_on_threads(Duration::from_secs(1)).await);
    }
}
