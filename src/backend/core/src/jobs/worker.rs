//! Worker pool: concurrent executors bound to named queues.
//!
//! Each worker pulls from its queues, runs the registered handler with
//! soft and hard execution deadlines, and hands the outcome to the
//! retry coordinator. A worker never crashes the pool: handler panics
//! are caught at the task join and settled as permanent failures.

use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Broker, Job, JobRegistry, Outcome, RetryCoordinator};

/// Default soft execution deadline (25 minutes).
pub const DEFAULT_SOFT_DEADLINE: Duration = Duration::from_secs(25 * 60);

/// Default hard execution deadline (30 minutes).
pub const DEFAULT_HARD_DEADLINE: Duration = Duration::from_secs(30 * 60);

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for one worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Pool name, used in logs and metrics
    pub name: String,
    /// Queues this pool consumes, in the order passed to the broker
    pub queues: Vec<String>,
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Soft execution deadline; exceeding it logs and counts, the
    /// handler keeps running
    pub soft_deadline: Duration,
    /// Hard execution deadline; exceeding it aborts the handler
    pub hard_deadline: Duration,
    /// How long each dequeue blocks before re-checking shutdown
    pub dequeue_timeout: Duration,
}

impl WorkerPoolConfig {
    pub fn new(name: impl Into<String>, queues: Vec<String>) -> Self {
        Self {
            name: name.into(),
            queues,
            concurrency: 2,
            soft_deadline: DEFAULT_SOFT_DEADLINE,
            hard_deadline: DEFAULT_HARD_DEADLINE,
            dequeue_timeout: Duration::from_secs(1),
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn deadlines(mut self, soft: Duration, hard: Duration) -> Self {
        self.soft_deadline = soft;
        self.hard_deadline = hard.max(soft);
        self
    }

    pub fn dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stats
// ═══════════════════════════════════════════════════════════════════════════════

/// Live counters for a pool, shared across its workers.
#[derive(Default)]
pub struct PoolStats {
    pub jobs_started: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_retried: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub deadline_hits: AtomicU64,
}

/// Point-in-time snapshot of [`PoolStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub deadline_hits: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            deadline_hits: self.deadline_hits.load(Ordering::Relaxed),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Pool
// ═══════════════════════════════════════════════════════════════════════════════

/// A pool of workers consuming a fixed set of queues.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    broker: Arc<dyn Broker>,
    registry: Arc<JobRegistry>,
    coordinator: Arc<RetryCoordinator>,
    stats: Arc<PoolStats>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        broker: Arc<dyn Broker>,
        registry: Arc<JobRegistry>,
        coordinator: Arc<RetryCoordinator>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            broker,
            registry,
            coordinator,
            stats: Arc::new(PoolStats::default()),
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        self.stats.clone()
    }

    /// Spawn the pool's workers.
    pub fn start(&mut self) {
        tracing::info!(
            pool = %self.config.name,
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            "Starting worker pool"
        );

        for worker_idx in 0..self.config.concurrency {
            let config = self.config.clone();
            let broker = self.broker.clone();
            let registry = self.registry.clone();
            let coordinator = self.coordinator.clone();
            let stats = self.stats.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();

            self.handles.push(tokio::spawn(async move {
                worker_loop(
                    worker_idx,
                    config,
                    broker,
                    registry,
                    coordinator,
                    stats,
                    shutdown_rx,
                )
                .await;
            }));
        }
    }

    /// Graceful shutdown: workers stop pulling new jobs, finish any
    /// in-flight execution, and exit.
    pub async fn shutdown(mut self) {
        tracing::info!(pool = %self.config.name, "Shutting down worker pool");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        tracing::info!(pool = %self.config.name, "Worker pool stopped");
    }
}

async fn worker_loop(
    worker_idx: usize,
    config: WorkerPoolConfig,
    broker: Arc<dyn Broker>,
    registry: Arc<JobRegistry>,
    coordinator: Arc<RetryCoordinator>,
    stats: Arc<PoolStats>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tracing::debug!(pool = %config.name, worker = worker_idx, "Worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let dequeued = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    // Sender dropped; treat as shutdown.
                    break;
                }
                continue;
            }
            result = broker.dequeue(&config.queues, config.dequeue_timeout) => result,
        };

        let job = match dequeued {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(pool = %config.name, worker = worker_idx, error = %e, "Dequeue failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        stats.jobs_started.fetch_add(1, Ordering::Relaxed);
        counter!("talentum_jobs_started_total", "pool" => config.name.clone()).increment(1);

        let outcome = execute(&config, &registry, &stats, &job).await;

        match coordinator.settle(&job, outcome).await {
            Ok(super::Disposition::Completed) => {
                stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(super::Disposition::Retried { .. }) => {
                stats.jobs_retried.fetch_add(1, Ordering::Relaxed);
            }
            Ok(super::Disposition::FailedPermanently) => {
                stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Settlement failed (broker or store unavailable). The
                // lease will expire and the job will be re-delivered.
                tracing::error!(
                    pool = %config.name,
                    job_id = %job.id,
                    error = %e,
                    "Failed to settle job outcome"
                );
            }
        }
    }

    tracing::debug!(pool = %config.name, worker = worker_idx, "Worker stopped");
}

/// Run the handler under the pool's deadlines.
///
/// At the soft deadline the handler's cancellation token fires so it
/// can checkpoint and return during the grace period; at the hard
/// deadline the task is aborted and the execution settles as a
/// transient failure (retryable unless the retry budget is spent). A
/// panicking handler settles as a permanent failure rather than being
/// blindly retried.
async fn execute(
    config: &WorkerPoolConfig,
    registry: &JobRegistry,
    stats: &PoolStats,
    job: &Job,
) -> Outcome {
    let registered = match registry.resolve(&job.name) {
        Ok(r) => r,
        Err(_) => {
            return Outcome::PermanentFailure(format!("no handler registered for '{}'", job.name));
        }
    };

    tracing::info!(
        job_id = %job.id,
        job = %job.name,
        queue = %job.queue,
        attempt = job.attempt,
        "Executing job"
    );

    let handler = registered.handler.clone();
    let job_id = job.id;
    let args = job.args.clone();
    let cancel = CancellationToken::new();
    let handler_cancel = cancel.clone();
    let mut task = tokio::spawn(async move { handler.run(job_id, &args, handler_cancel).await });

    match tokio::time::timeout(config.soft_deadline, &mut task).await {
        Ok(result) => join_outcome(result),
        Err(_) => {
            stats.deadline_hits.fetch_add(1, Ordering::Relaxed);
            counter!("talentum_deadline_soft_total", "job" => job.name.clone()).increment(1);
            tracing::warn!(
                job_id = %job.id,
                job = %job.name,
                soft_secs = config.soft_deadline.as_secs(),
                "Soft deadline exceeded, signalling cancellation"
            );
            cancel.cancel();

            let grace = config.hard_deadline.saturating_sub(config.soft_deadline);
            match tokio::time::timeout(grace, &mut task).await {
                Ok(result) => join_outcome(result),
                Err(_) => {
                    counter!("talentum_deadline_hard_total", "job" => job.name.clone())
                        .increment(1);
                    tracing::error!(
                        job_id = %job.id,
                        job = %job.name,
                        hard_secs = config.hard_deadline.as_secs(),
                        "Hard deadline exceeded, aborting"
                    );
                    task.abort();
                    let _ = task.await;
                    Outcome::TransientFailure(format!(
                        "hard deadline of {}s exceeded",
                        config.hard_deadline.as_secs()
                    ))
                }
            }
        }
    }
}

fn join_outcome(result: std::result::Result<Outcome, tokio::task::JoinError>) -> Outcome {
    match result {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            Outcome::PermanentFailure(format!("handler panicked: {}", e))
        }
        Err(e) => Outcome::TransientFailure(format!("handler task cancelled: {}", e)),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{
        FnHandler, InMemoryBroker, InMemoryResultStore, JobSpec, JobStatus, Lookup, ResultStore,
        RetryPolicy,
    };
    use std::sync::atomic::AtomicU32;

    struct Harness {
        broker: Arc<InMemoryBroker>,
        store: Arc<InMemoryResultStore>,
        pool: WorkerPool,
    }

    fn harness(registry: JobRegistry, config: WorkerPoolConfig) -> Harness {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(InMemoryResultStore::new());
        let registry = Arc::new(registry);
        let coordinator = Arc::new(RetryCoordinator::new(
            broker.clone(),
            store.clone(),
            registry.clone(),
        ));
        let pool = WorkerPool::new(config, broker.clone(), registry, coordinator);
        Harness {
            broker,
            store,
            pool,
        }
    }

    fn fast_config(queues: &[&str]) -> WorkerPoolConfig {
        WorkerPoolConfig::new("test", queues.iter().map(|s| s.to_string()).collect())
            .concurrency(1)
            .dequeue_timeout(Duration::from_millis(50))
    }

    async fn wait_for_result(
        store: &InMemoryResultStore,
        job_id: crate::jobs::JobId,
    ) -> crate::jobs::JobResult {
        for _ in 0..100 {
            if let Lookup::Found(result) = store.get(job_id).await.unwrap() {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} never reached a terminal state", job_id);
    }

    #[tokio::test]
    async fn test_pool_executes_job() {
        let mut registry = JobRegistry::new();
        registry
            .register(
                JobSpec::new("echo"),
                Arc::new(FnHandler(|_id, args: Vec<serde_json::Value>, _cancel| async move {
                    Outcome::Success(serde_json::json!({ "args": args.len() }))
                })),
            )
            .unwrap();

        let mut h = harness(registry, fast_config(&["q"]));
        h.pool.start();

        let job = Job::new("echo", vec![serde_json::json!(42)], "q");
        let id = job.id;
        h.broker.enqueue(job, Duration::ZERO).await.unwrap();

        let result = wait_for_result(&h.store, id).await;
        assert_eq!(result.status, JobStatus::Succeeded);
        assert_eq!(result.payload, Some(serde_json::json!({ "args": 1 })));

        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_handler = calls.clone();

        let mut registry = JobRegistry::new();
        registry
            .register(
                JobSpec::new("flaky").retry(RetryPolicy {
                    max_attempts: 3,
                    backoff: crate::jobs::Backoff::fixed(0),
                }),
                Arc::new(FnHandler(move |_id, _args, _cancel| {
                    let calls = calls_handler.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Outcome::TransientFailure("first try fails".into())
                        } else {
                            Outcome::ok()
                        }
                    }
                })),
            )
            .unwrap();

        let mut h = harness(registry, fast_config(&["q"]));
        h.pool.start();

        let job = Job::new("flaky", vec![], "q").with_max_attempts(3);
        let id = job.id;
        h.broker.enqueue(job, Duration::ZERO).await.unwrap();

        let result = wait_for_result(&h.store, id).await;
        assert_eq!(result.status, JobStatus::Succeeded);
        assert_eq!(result.executions, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_hard_deadline_aborts_handler() {
        let mut registry = JobRegistry::new();
        registry
            .register(
                JobSpec::new("stuck").retry(RetryPolicy::no_retry()),
                Arc::new(FnHandler(|_id, _args, _cancel| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Outcome::ok()
                })),
            )
            .unwrap();

        let config = fast_config(&["q"])
            .deadlines(Duration::from_millis(50), Duration::from_millis(100));
        let mut h = harness(registry, config);
        h.pool.start();

        let job = Job::new("stuck", vec![], "q").with_max_attempts(1);
        let id = job.id;
        h.broker.enqueue(job, Duration::ZERO).await.unwrap();

        let result = wait_for_result(&h.store, id).await;
        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("hard deadline"));
        assert_eq!(h.pool.stats().snapshot().deadline_hits, 1);

        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_soft_deadline_signals_cancellation() {
        let mut registry = JobRegistry::new();
        registry
            .register(
                JobSpec::new("cooperative").retry(RetryPolicy::no_retry()),
                Arc::new(FnHandler(|_id, _args, cancel: CancellationToken| async move {
                    // Runs until told to stop, then returns within the
                    // grace period.
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            Outcome::TransientFailure("stopped at soft deadline".into())
                        }
                        _ = tokio::time::sleep(Duration::from_secs(3600)) => Outcome::ok(),
                    }
                })),
            )
            .unwrap();

        // Long grace period: a cooperative handler must settle via the
        // token, not the hard abort.
        let config = fast_config(&["q"])
            .deadlines(Duration::from_millis(50), Duration::from_secs(30));
        let mut h = harness(registry, config);
        h.pool.start();

        let job = Job::new("cooperative", vec![], "q").with_max_attempts(1);
        let id = job.id;
        h.broker.enqueue(job, Duration::ZERO).await.unwrap();

        let result = wait_for_result(&h.store, id).await;
        assert_eq!(result.status, JobStatus::Failed);
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .contains("stopped at soft deadline"));
        assert!(!result.error.as_deref().unwrap().contains("hard deadline"));
        assert_eq!(h.pool.stats().snapshot().deadline_hits, 1);

        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_permanently() {
        let mut registry = JobRegistry::new();
        registry
            .register(
                JobSpec::new("panicky").retry(RetryPolicy::with_attempts(3)),
                Arc::new(FnHandler(|_id, _args, _cancel| async {
                    panic!("boom");
                })),
            )
            .unwrap();

        let mut h = harness(registry, fast_config(&["q"]));
        h.pool.start();

        let job = Job::new("panicky", vec![], "q").with_max_attempts(3);
        let id = job.id;
        h.broker.enqueue(job, Duration::ZERO).await.unwrap();

        // Permanent despite the retry budget: panics are not retried.
        let result = wait_for_result(&h.store, id).await;
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.executions, 1);

        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregistered_job_fails_permanently() {
        let mut h = harness(JobRegistry::new(), fast_config(&["q"]));
        h.pool.start();

        let job = Job::new("not_registered", vec![], "q");
        let id = job.id;
        h.broker.enqueue(job, Duration::ZERO).await.unwrap();

        let result = wait_for_result(&h.store, id).await;
        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("no handler"));

        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_pulling() {
        let mut registry = JobRegistry::new();
        registry
            .register(
                JobSpec::new("later"),
                Arc::new(FnHandler(|_id, _args, _cancel| async { Outcome::ok() })),
            )
            .unwrap();

        let mut h = harness(registry, fast_config(&["q"]));
        h.pool.start();
        let stats = h.pool.stats();
        h.pool.shutdown().await;

        h.broker
            .enqueue(Job::new("later", vec![], "q"), Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(stats.snapshot().jobs_started, 0);
        assert_eq!(h.broker.depth("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_pool_stops_workers() {
        let mut registry = JobRegistry::new();
        registry
            .register(
                JobSpec::new("later"),
                Arc::new(FnHandler(|_id, _args, _cancel| async { Outcome::ok() })),
            )
            .unwrap();

        let mut h = harness(registry, fast_config(&["q"]));
        h.pool.start();
        let stats = h.pool.stats();
        let broker = h.broker.clone();

        // Dropping the pool drops the shutdown sender without ever
        // sending; workers must exit instead of spinning.
        drop(h);
        tokio::time::sleep(Duration::from_millis(100)).await;

        broker
            .enqueue(Job::new("later", vec![], "q"), Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(stats.snapshot().jobs_started, 0);
        assert_eq!(broker.depth("q").await.unwrap(), 1);
    }
}
