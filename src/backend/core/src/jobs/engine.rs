//! Job engine: the submission and query surface.
//!
//! `submit` is the single entry point for both external callers and
//! the periodic scheduler: it resolves the job's registration, routes
//! it to a queue, and hands it to the broker.

use metrics::counter;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

use super::{
    Broker, Job, JobId, JobRegistry, Lookup, Priority, QueueRouter, ResultStore,
};

/// Orchestrates submission: registry lookup, queue routing, broker
/// enqueue, pending tracking.
pub struct JobEngine {
    registry: Arc<JobRegistry>,
    router: QueueRouter,
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
}

impl JobEngine {
    pub fn new(
        registry: Arc<JobRegistry>,
        router: QueueRouter,
        broker: Arc<dyn Broker>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            registry,
            router,
            broker,
            store,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Submit a job for execution.
    ///
    /// Queue resolution: the registration's explicit queue wins, then
    /// the route table, then the default queue. Fails with `UnknownJob`
    /// for unregistered names and `BrokerUnavailable` when the broker
    /// cannot accept the job (the caller decides whether to retry).
    pub async fn submit(
        &self,
        name: &str,
        args: Vec<serde_json::Value>,
        priority: Option<Priority>,
        delay: Duration,
    ) -> Result<JobId> {
        let registered = self.registry.resolve(name)?;

        let queue = registered
            .spec
            .queue
            .clone()
            .unwrap_or_else(|| self.router.route(name).to_string());
        let priority = priority.unwrap_or(registered.spec.default_priority);

        let job = Job::new(name, args, queue)
            .with_priority(priority)
            .with_max_attempts(registered.spec.retry_policy.max_attempts);
        let job_id = job.id;
        let queue_name = job.queue.clone();

        self.store.track_pending(job_id).await?;
        if let Err(e) = self.broker.enqueue(job, delay).await {
            // The submission failed outright; leave no pending marker
            // behind for a job that never existed.
            if let Err(cleanup) = self.store.untrack_pending(job_id).await {
                tracing::warn!(job_id = %job_id, error = %cleanup, "Failed to clear pending marker");
            }
            return Err(e);
        }

        counter!("talentum_jobs_submitted_total", "job" => name.to_string()).increment(1);
        tracing::info!(
            job_id = %job_id,
            job = %name,
            queue = %queue_name,
            priority = priority.value(),
            delay_secs = delay.as_secs(),
            "Job submitted"
        );

        Ok(job_id)
    }

    /// Look up a job's outcome.
    pub async fn get_result(&self, job_id: JobId) -> Result<Lookup> {
        self.store.get(job_id).await
    }

    /// Jobs waiting (ready or delayed) in a queue.
    pub async fn queue_depth(&self, queue: &str) -> Result<usize> {
        self.broker.depth(queue).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::{
        FnHandler, InMemoryBroker, InMemoryResultStore, JobSpec, Outcome, RetryPolicy,
    };

    fn engine_with(registry: JobRegistry) -> JobEngine {
        JobEngine::new(
            Arc::new(registry),
            QueueRouter::platform_default(),
            Arc::new(InMemoryBroker::new()),
            Arc::new(InMemoryResultStore::new()),
        )
    }

    fn noop() -> Arc<dyn crate::jobs::Handler> {
        Arc::new(FnHandler(|_id, _args, _cancel| async { Outcome::ok() }))
    }

    /// Broker whose transport is down; remembers the id it rejected.
    #[derive(Default)]
    struct DownBroker {
        seen: parking_lot::Mutex<Option<JobId>>,
    }

    #[async_trait::async_trait]
    impl Broker for DownBroker {
        async fn enqueue(&self, job: Job, _delay: Duration) -> crate::error::Result<()> {
            *self.seen.lock() = Some(job.id);
            Err(crate::error::TalentumError::broker_unavailable(
                "connection refused",
            ))
        }

        async fn dequeue(
            &self,
            _queues: &[String],
            _block_timeout: Duration,
        ) -> crate::error::Result<Option<Job>> {
            Ok(None)
        }

        async fn ack(&self, _job_id: JobId) -> crate::error::Result<()> {
            Ok(())
        }

        async fn nack(&self, _job_id: JobId, _delay: Duration) -> crate::error::Result<()> {
            Ok(())
        }

        async fn depth(&self, _queue: &str) -> crate::error::Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_submit_unknown_job_fails() {
        let engine = engine_with(JobRegistry::new());
        let err = engine
            .submit("mystery", vec![], None, Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownJob);
    }

    #[tokio::test]
    async fn test_submit_routes_by_name() {
        let mut registry = JobRegistry::new();
        registry.register(JobSpec::new("analyze_cv"), noop()).unwrap();
        let engine = engine_with(registry);

        engine
            .submit("analyze_cv", vec![serde_json::json!("cv-123")], None, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(engine.queue_depth("analysis").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_explicit_queue_beats_router() {
        let mut registry = JobRegistry::new();
        registry
            .register(JobSpec::new("analyze_cv").queue("priority-analysis"), noop())
            .unwrap();
        let engine = engine_with(registry);

        engine
            .submit("analyze_cv", vec![], None, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(engine.queue_depth("priority-analysis").await.unwrap(), 1);
        assert_eq!(engine.queue_depth("analysis").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_submitted_job_reports_pending() {
        let mut registry = JobRegistry::new();
        registry
            .register(JobSpec::new("extract_user_features"), noop())
            .unwrap();
        let engine = engine_with(registry);

        let id = engine
            .submit("extract_user_features", vec![], None, Duration::ZERO)
            .await
            .unwrap();

        assert!(engine.get_result(id).await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_delayed_submission_is_invisible() {
        let mut registry = JobRegistry::new();
        registry
            .register(JobSpec::new("generate_user_recommendations"), noop())
            .unwrap();
        let engine = engine_with(registry);

        engine
            .submit(
                "generate_user_recommendations",
                vec![],
                None,
                Duration::from_secs(300),
            )
            .await
            .unwrap();

        // Counted in depth but not deliverable yet.
        assert_eq!(engine.queue_depth("recommendations").await.unwrap(), 1);
        let delivered = engine
            .broker()
            .dequeue(&["recommendations".to_string()], Duration::from_millis(50))
            .await
            .unwrap();
        assert!(delivered.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_broker_fails_submit_cleanly() {
        let mut registry = JobRegistry::new();
        registry.register(JobSpec::new("analyze_cv"), noop()).unwrap();

        let broker = Arc::new(DownBroker::default());
        let store = Arc::new(InMemoryResultStore::new());
        let engine = JobEngine::new(
            Arc::new(registry),
            QueueRouter::platform_default(),
            broker.clone(),
            store.clone(),
        );

        let err = engine
            .submit("analyze_cv", vec![], None, Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BrokerUnavailable);

        // No job state survives the failed submission.
        let rejected = broker.seen.lock().expect("broker saw the job");
        assert!(matches!(store.get(rejected).await.unwrap(), Lookup::NotFound));
    }

    #[tokio::test]
    async fn test_max_attempts_comes_from_policy() {
        let mut registry = JobRegistry::new();
        registry
            .register(
                JobSpec::new("retrain_collaborative_model").retry(RetryPolicy::heavy()),
                noop(),
            )
            .unwrap();
        let engine = engine_with(registry);

        engine
            .submit("retrain_collaborative_model", vec![], None, Duration::ZERO)
            .await
            .unwrap();

        let job = engine
            .broker()
            .dequeue(&["training".to_string()], Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.max_attempts, 3);
    }
}
