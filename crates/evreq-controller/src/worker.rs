//! Fixed-size worker pool draining one work queue into a [Reconcile] implementation.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use evreq_api::EvictionRequest;
use evreq_kernel::Reconcile;

use crate::queue::{ObjectKey, WorkQueue};
use crate::rate_limiter::{default_controller_rate_limiter, RateLimiter};

static REPORTED_ERRORS: AtomicU64 = AtomicU64::new(0);

/// Non-fatal error sink: log and count, never abort.
pub fn report_error(context: &str, err: &dyn fmt::Display) {
    REPORTED_ERRORS.fetch_add(1, Ordering::Relaxed);
    error!(context, error = %err, "unhandled error");
}

/// Errors reported through [report_error] since process start.
pub fn reported_errors() -> u64 {
    REPORTED_ERRORS.load(Ordering::Relaxed)
}

#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub queue_name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: crate::config::DEFAULT_WORKERS,
            queue_name: "evictionrequest".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: WorkQueue<ObjectKey>,
    snapshots: Arc<Mutex<HashMap<ObjectKey, EvictionRequest>>>,
    reconciler: Arc<dyn Reconcile>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, reconciler: Arc<dyn Reconcile>) -> Self {
        Self::with_rate_limiter(config, reconciler, default_controller_rate_limiter())
    }

    pub fn with_rate_limiter(
        config: WorkerPoolConfig,
        reconciler: Arc<dyn Reconcile>,
        limiter: impl RateLimiter<ObjectKey> + 'static,
    ) -> Self {
        let queue = WorkQueue::new(config.queue_name.clone(), limiter);
        Self {
            config,
            queue,
            snapshots: Arc::new(Mutex::new(HashMap::new())),
            reconciler,
        }
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Store a copy of `request` under its key and queue the key. The latest
    /// snapshot wins.
    pub fn enqueue(&self, request: &EvictionRequest) {
        let Some(key) = ObjectKey::for_request(request) else {
            report_error(
                "enqueue",
                &format!(
                    "eviction request without name or namespace: {:?}/{:?}",
                    request.metadata.namespace, request.metadata.name
                ),
            );
            return;
        };
        match self.snapshots.lock() {
            Ok(mut snapshots) => {
                snapshots.insert(key.clone(), request.clone());
            }
            Err(e) => {
                report_error("enqueue", &e);
                return;
            }
        }
        self.queue.add(key);
    }

    /// Drop the snapshot and retry history of a deleted request. A retry already
    /// scheduled for its key finds no snapshot and is dropped.
    pub fn forget_request(&self, request: &EvictionRequest) {
        let Some(key) = ObjectKey::for_request(request) else {
            return;
        };
        match self.snapshots.lock() {
            Ok(mut snapshots) => {
                snapshots.remove(&key);
            }
            Err(e) => report_error("forget", &e),
        }
        self.queue.forget(&key);
        debug!(key = %key, "forgot eviction request");
    }

    #[cfg(test)]
    pub(crate) fn tracked_requests(&self) -> usize {
        self.snapshots.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Run the workers until `shutdown` resolves, then drain in-flight items and
    /// wait for every worker to exit.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let workers = self.config.workers.max(1);
        info!(queue = %self.queue.name(), workers, "starting workers");
        let mut tasks = JoinSet::new();
        for worker_id in 0..workers {
            let pool = self.clone();
            tasks.spawn(async move {
                while pool.process_next(worker_id).await {}
                debug!(worker_id, "worker stopped");
            });
        }

        shutdown.await;
        info!(queue = %self.queue.name(), "shutting down workers");
        self.queue.shut_down_with_drain().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "worker task failed");
            }
        }
        info!(queue = %self.queue.name(), "workers stopped");
    }

    /// Process one item. Returns false once the queue is shut down.
    pub async fn process_next(&self, worker_id: usize) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let snapshot = self
            .snapshots
            .lock()
            .ok()
            .and_then(|snapshots| snapshots.get(&key).cloned());
        match snapshot {
            None => {
                report_error(
                    "worker",
                    &format!("no eviction request stored for key {}, dropping", key),
                );
                self.queue.forget(&key);
            }
            Some(request) => match self.reconciler.reconcile(request).await {
                Ok(()) => {
                    debug!(worker_id, key = %key, "reconciled");
                    self.queue.forget(&key);
                }
                Err(err) => {
                    self.queue.add_rate_limited(key.clone());
                    report_error(
                        "reconcile",
                        &format!("error syncing eviction request {}: {}", key, err),
                    );
                }
            },
        }
        self.queue.done(&key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use evreq_api::EvictionRequestSpec;
    use evreq_kernel::ReconcileError;
    use tokio::sync::oneshot;

    use crate::rate_limiter::ItemExponentialBackoff;

    /// Records every reconcile and fails the first `failures` calls.
    #[derive(Default)]
    struct RecordingReconciler {
        seen: Mutex<Vec<EvictionRequest>>,
        failures: Mutex<u32>,
    }

    #[async_trait]
    impl Reconcile for RecordingReconciler {
        async fn reconcile(&self, request: EvictionRequest) -> Result<(), ReconcileError> {
            self.seen.lock().expect("seen lock").push(request);
            let mut failures = self.failures.lock().expect("failures lock");
            if *failures > 0 {
                *failures -= 1;
                return Err(ReconcileError::Conflict("stale".into()));
            }
            Ok(())
        }
    }

    fn request(name: &str, message: &str) -> EvictionRequest {
        let mut request = EvictionRequest::new(name, EvictionRequestSpec::default());
        request.metadata.namespace = Some("shop".into());
        request.status_mut().message = message.into();
        request
    }

    fn pool(reconciler: Arc<RecordingReconciler>) -> WorkerPool {
        WorkerPool::with_rate_limiter(
            WorkerPoolConfig {
                workers: 1,
                queue_name: "test".into(),
            },
            reconciler,
            ItemExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn latest_snapshot_wins() {
        let reconciler = Arc::new(RecordingReconciler::default());
        let pool = pool(reconciler.clone());
        pool.enqueue(&request("evict-web-0", "first"));
        pool.enqueue(&request("evict-web-0", "second"));
        assert_eq!(pool.queue().len(), 1);

        assert!(pool.process_next(0).await);

        let seen = reconciler.seen.lock().expect("seen lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status_or_default().message, "second");
    }

    #[tokio::test]
    async fn nameless_object_is_reported_not_queued() {
        let reconciler = Arc::new(RecordingReconciler::default());
        let pool = pool(reconciler);
        let before = reported_errors();
        let mut orphan = request("evict-web-0", "");
        orphan.metadata.namespace = None;

        pool.enqueue(&orphan);

        assert!(pool.queue().is_empty());
        assert!(reported_errors() > before);
    }

    #[tokio::test]
    async fn missing_snapshot_is_dropped() {
        let reconciler = Arc::new(RecordingReconciler::default());
        let pool = pool(reconciler.clone());
        pool.queue().add(ObjectKey::new("shop", "ghost"));
        let before = reported_errors();

        assert!(pool.process_next(0).await);

        assert!(pool.queue().is_empty());
        assert!(reconciler.seen.lock().expect("seen lock").is_empty());
        assert!(reported_errors() > before);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_requeues_with_backoff_and_success_forgets() {
        let reconciler = Arc::new(RecordingReconciler::default());
        *reconciler.failures.lock().expect("failures lock") = 2;
        let pool = pool(reconciler.clone());
        let key = ObjectKey::new("shop", "evict-web-0");
        pool.enqueue(&request("evict-web-0", ""));

        assert!(pool.process_next(0).await);
        assert_eq!(pool.queue().num_requeues(&key), 1);
        assert!(pool.process_next(0).await);
        assert_eq!(pool.queue().num_requeues(&key), 2);
        assert!(pool.process_next(0).await);

        assert_eq!(pool.queue().num_requeues(&key), 0);
        assert_eq!(reconciler.seen.lock().expect("seen lock").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_request_is_not_reconciled_by_pending_retry() {
        let reconciler = Arc::new(RecordingReconciler::default());
        *reconciler.failures.lock().expect("failures lock") = 1;
        let pool = pool(reconciler.clone());
        let key = ObjectKey::new("shop", "evict-web-0");
        let deleted = request("evict-web-0", "");
        pool.enqueue(&deleted);

        assert!(pool.process_next(0).await);
        assert_eq!(pool.queue().num_requeues(&key), 1);

        pool.forget_request(&deleted);
        assert_eq!(pool.tracked_requests(), 0);
        assert_eq!(pool.queue().num_requeues(&key), 0);

        // The backoff timer fires and re-adds the key.
        assert!(pool.process_next(0).await);

        assert_eq!(reconciler.seen.lock().expect("seen lock").len(), 1);
        assert!(pool.queue().is_empty());
        assert_eq!(pool.tracked_requests(), 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let reconciler = Arc::new(RecordingReconciler::default());
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                workers: 3,
                queue_name: "test".into(),
            },
            reconciler.clone(),
        );
        for i in 0..5 {
            pool.enqueue(&request(&format!("evict-web-{}", i), ""));
        }
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.run(async {
                    let _ = stop_rx.await;
                })
                .await
            })
        };

        while reconciler.seen.lock().expect("seen lock").len() < 5 {
            tokio::task::yield_now().await;
        }
        let _ = stop_tx.send(());
        runner.await.expect("join");

        assert!(pool.queue().is_shutting_down());
        assert_eq!(reconciler.seen.lock().expect("seen lock").len(), 5);
    }
}
