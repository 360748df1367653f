//! Job registry: stable name → handler + static metadata.
//!
//! Registration happens once at process start; the registry is then
//! shared behind an `Arc` and is read-only, so concurrent lookup needs
//! no locking.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TalentumError};

use super::{JobId, Outcome, Priority, RetryPolicy};

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The contract implemented by external collaborators (recommendation
/// engine, training pipeline, CV analyzer).
///
/// Handlers classify failures via [`Outcome`] but never decide retry
/// timing; that is centralized in the retry coordinator. Handlers must
/// tolerate re-delivery: a lease timeout can cause the same job to run
/// twice.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Execute the job body.
    ///
    /// `cancel` fires at the soft execution deadline. A handler should
    /// checkpoint and return when it observes the token; whatever is
    /// still running at the hard deadline is aborted outright.
    async fn run(
        &self,
        job_id: JobId,
        args: &[serde_json::Value],
        cancel: CancellationToken,
    ) -> Outcome;
}

/// Blanket impl so plain async closures wrapped in a struct aren't
/// needed for simple handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(JobId, Vec<serde_json::Value>, CancellationToken) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Outcome> + Send,
{
    async fn run(
        &self,
        job_id: JobId,
        args: &[serde_json::Value],
        cancel: CancellationToken,
    ) -> Outcome {
        (self.0)(job_id, args.to_vec(), cancel).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Spec
// ═══════════════════════════════════════════════════════════════════════════════

/// Static metadata registered alongside a handler.
#[derive(Clone)]
pub struct JobSpec {
    /// Stable job name (submission key)
    pub name: String,
    /// Explicit target queue; when absent the queue router decides
    pub queue: Option<String>,
    /// Default priority for submissions that don't override it
    pub default_priority: Priority,
    /// Retry policy applied by the retry coordinator
    pub retry_policy: RetryPolicy,
}

impl JobSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: None,
            default_priority: Priority::default(),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Pin the job to an explicit queue, bypassing the router.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// A registered job: spec plus its handler.
#[derive(Clone)]
pub struct RegisteredJob {
    pub spec: JobSpec,
    pub handler: Arc<dyn Handler>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Maps stable job names to handlers and metadata.
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<String, RegisteredJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job.
    ///
    /// Fails with `DuplicateJob` if the name is already taken.
    pub fn register(&mut self, spec: JobSpec, handler: Arc<dyn Handler>) -> Result<()> {
        if self.jobs.contains_key(&spec.name) {
            return Err(TalentumError::duplicate_job(&spec.name));
        }
        tracing::debug!(job = %spec.name, queue = ?spec.queue, "Job registered");
        self.jobs.insert(spec.name.clone(), RegisteredJob { spec, handler });
        Ok(())
    }

    /// Resolve a job by name.
    ///
    /// Fails with `UnknownJob` if the name was never registered.
    pub fn resolve(&self, name: &str) -> Result<&RegisteredJob> {
        self.jobs
            .get(name)
            .ok_or_else(|| TalentumError::unknown_job(name))
    }

    /// Whether a name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Number of registered jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Iterate over registered job names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
