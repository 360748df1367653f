//! Retry coordination: turns handler outcomes into broker and result
//! store actions.
//!
//! Retry timing is centralized here. Handlers only classify their
//! failure as transient or permanent; the coordinator owns whether the
//! job runs again and after how long.

use metrics::counter;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

use super::{Broker, Job, JobRegistry, JobResult, Outcome, ResultStore, RetryPolicy};

/// What the coordinator did with a settled execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Success recorded and acked
    Completed,
    /// Transient failure, job returned to its queue
    Retried { delay: Duration },
    /// Terminal failure recorded and acked
    FailedPermanently,
}

/// Settles each finished execution: ack on terminal outcomes, nack
/// with a backoff delay on retryable ones.
pub struct RetryCoordinator {
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
    registry: Arc<JobRegistry>,
}

impl RetryCoordinator {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn ResultStore>,
        registry: Arc<JobRegistry>,
    ) -> Self {
        Self {
            broker,
            store,
            registry,
        }
    }

    /// Backoff shape for a job, falling back to the default policy for
    /// names no longer registered (a job can outlive a deploy).
    fn policy_for(&self, name: &str) -> RetryPolicy {
        self.registry
            .resolve(name)
            .map(|r| r.spec.retry_policy.clone())
            .unwrap_or_default()
    }

    /// Settle a finished execution.
    ///
    /// A job whose executions reached `max_attempts` is never
    /// re-enqueued; the only legal transition is to a failed result.
    pub async fn settle(&self, job: &Job, outcome: Outcome) -> Result<Disposition> {
        match outcome {
            Outcome::Success(payload) => {
                self.store
                    .record(JobResult::succeeded(
                        job.id,
                        &job.name,
                        payload,
                        job.executions(),
                    ))
                    .await?;
                self.broker.ack(job.id).await?;
                counter!("talentum_jobs_completed_total", "job" => job.name.clone())
                    .increment(1);
                tracing::info!(
                    job_id = %job.id,
                    job = %job.name,
                    executions = job.executions(),
                    "Job completed"
                );
                Ok(Disposition::Completed)
            }
            Outcome::TransientFailure(reason) if job.retries_remaining() => {
                let policy = self.policy_for(&job.name);
                let delay = policy.next_retry_delay(job.attempt);
                self.broker.nack(job.id, delay).await?;
                counter!("talentum_jobs_retried_total", "job" => job.name.clone())
                    .increment(1);
                tracing::warn!(
                    job_id = %job.id,
                    job = %job.name,
                    attempt = job.attempt,
                    max_attempts = job.max_attempts,
                    delay_secs = delay.as_secs(),
                    reason = %reason,
                    "Transient failure, retrying"
                );
                Ok(Disposition::Retried { delay })
            }
            Outcome::TransientFailure(reason) => {
                // Retry budget exhausted.
                self.fail(job, format!("retry budget exhausted: {}", reason))
                    .await?;
                Ok(Disposition::FailedPermanently)
            }
            Outcome::PermanentFailure(reason) => {
                self.fail(job, reason).await?;
                Ok(Disposition::FailedPermanently)
            }
        }
    }

    async fn fail(&self, job: &Job, reason: String) -> Result<()> {
        self.store
            .record(JobResult::failed(
                job.id,
                &job.name,
                reason.clone(),
                job.executions(),
            ))
            .await?;
        self.broker.ack(job.id).await?;
        counter!("talentum_jobs_failed_total", "job" => job.name.clone()).increment(1);
        tracing::error!(
            job_id = %job.id,
            job = %job.name,
            executions = job.executions(),
            reason = %reason,
            "Job permanently failed"
        );
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
