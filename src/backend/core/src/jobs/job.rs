//! Job definitions and retry policies.
//!
//! This module provides the core data model of the engine:
//!
//! - **Job**: A unit of work flowing through queues
//! - **Outcome**: The explicit result variant returned by handlers
//! - **RetryPolicy**: Configuration for retry behavior with backoff strategies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Queue priority, 0 (lowest) to 10 (highest).
///
/// Within a queue, higher priority is dequeued first; ties are broken
/// FIFO by enqueue order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(0);
    pub const MAX: Priority = Priority(10);

    /// Create a priority, clamping into the 0–10 range.
    pub fn new(value: u8) -> Self {
        Self(value.min(Self::MAX.0))
    }

    /// Priority for routine background work.
    pub fn low() -> Self {
        Self(2)
    }

    /// Default priority for most jobs.
    pub fn normal() -> Self {
        Self(5)
    }

    /// Priority for user-facing work.
    pub fn high() -> Self {
        Self(8)
    }

    /// Get the raw numeric value.
    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::normal()
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A unit of work submitted to the engine.
///
/// Identity is the `id`. `attempt` is bumped by the broker each time
/// the job is returned to its queue for a retry; every other field is
/// immutable after submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,
    /// Registered job name
    pub name: String,
    /// Opaque handler arguments
    pub args: Vec<serde_json::Value>,
    /// Queue the job was routed to
    pub queue: String,
    /// Queue priority
    pub priority: Priority,
    /// Zero-based execution attempt number
    pub attempt: u32,
    /// Maximum executions before the job is marked permanently failed
    pub max_attempts: u32,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be delivered to a worker
    pub not_before: DateTime<Utc>,
}

impl Job {
    /// Create a new job ready for immediate delivery.
    pub fn new(name: impl Into<String>, args: Vec<serde_json::Value>, queue: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            name: name.into(),
            args,
            queue: queue.into(),
            priority: Priority::default(),
            attempt: 0,
            max_attempts: 3,
            created_at: now,
            not_before: now,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the maximum attempts.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    /// Delay initial delivery by the given duration.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.not_before = self.created_at
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self
    }

    /// Executions performed so far, counting the one about to run.
    pub fn executions(&self) -> u32 {
        self.attempt + 1
    }

    /// Whether another retry is allowed after the current execution.
    pub fn retries_remaining(&self) -> bool {
        self.executions() < self.max_attempts
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// The explicit result variant a handler returns.
///
/// Handlers never decide retry timing; they only classify the failure.
/// The retry coordinator owns what happens next.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Outcome {
    /// The job finished; payload is recorded in the result store.
    Success(serde_json::Value),
    /// A recoverable failure; retried per the job's retry policy.
    TransientFailure(String),
    /// A non-recoverable failure; recorded immediately, never retried.
    PermanentFailure(String),
}

impl Outcome {
    /// Convenience success with no payload.
    pub fn ok() -> Self {
        Self::Success(serde_json::Value::Null)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Fixed delay between retries
    Fixed { delay_secs: u64 },
    /// Linear increase in delay (base + increment * attempt)
    Linear { base_secs: u64, increment_secs: u64 },
    /// Exponential increase in delay (base * multiplier^attempt), capped
    Exponential {
        base_secs: u64,
        max_secs: u64,
        multiplier: f64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        // 60s flat matches the platform's default retry spacing.
        Self::Fixed { delay_secs: 60 }
    }
}

impl Backoff {
    /// Calculate the delay before retrying, given the attempt number of
    /// the execution that just failed (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = match self {
            Self::Fixed { delay_secs } => *delay_secs,
            Self::Linear {
                base_secs,
                increment_secs,
            } => base_secs + increment_secs * attempt as u64,
            Self::Exponential {
                base_secs,
                max_secs,
                multiplier,
            } => {
                let delay = (*base_secs as f64) * multiplier.powi(attempt as i32);
                delay.min(*max_secs as f64) as u64
            }
        };

        Duration::from_secs(secs)
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay_secs: u64) -> Self {
        Self::Fixed { delay_secs }
    }

    /// Exponential backoff from 60s up to the 600s cap used for heavy
    /// training jobs.
    pub fn heavy() -> Self {
        Self::Exponential {
            base_secs: 60,
            max_secs: 600,
            multiplier: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for job retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum total executions (1 = no retries)
    pub max_attempts: u32,
    /// Backoff strategy for calculating delays
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with a specific number of total attempts.
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Policy for heavy jobs (model retraining): few attempts, long
    /// exponential spacing.
    pub fn heavy() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::heavy(),
        }
    }

    /// Get the delay before the next retry, given the attempt number of
    /// the execution that just failed.
    pub fn next_retry_delay(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);

        let uuid = Uuid::new_v4();
        let id = JobId::from_uuid(uuid);
        assert_eq!(id.0, uuid);
    }

    #[test]
    fn test_priority_clamps() {
        assert_eq!(Priority::new(15), Priority::MAX);
        assert_eq!(Priority::new(0), Priority::MIN);
        assert_eq!(Priority::default(), Priority::normal());
        assert!(Priority::high() > Priority::normal());
        assert!(Priority::normal() > Priority::low());
    }

    #[test]
    fn test_job_builder() {
        let job = Job::new("analyze_cv", vec![serde_json::json!(42)], "analysis")
            .with_priority(Priority::high())
            .with_max_attempts(5);

        assert_eq!(job.name, "analyze_cv");
        assert_eq!(job.queue, "analysis");
        assert_eq!(job.priority, Priority::high());
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.not_before, job.created_at);
    }

    #[test]
    fn test_job_delay_sets_not_before() {
        let job = Job::new("extract_user_features", vec![], "features")
            .with_delay(Duration::from_secs(90));
        assert_eq!(job.not_before - job.created_at, chrono::Duration::seconds(90));
    }

    #[test]
    fn test_retries_remaining() {
        let mut job = Job::new("retrain_collaborative_model", vec![], "training")
            .with_max_attempts(3);
        assert!(job.retries_remaining()); // attempt 0, 1st execution

        job.attempt = 1;
        assert!(job.retries_remaining()); // 2nd execution

        job.attempt = 2;
        assert!(!job.retries_remaining()); // 3rd and final execution
    }

    #[test]
    fn test_backoff_fixed() {
        let backoff = Backoff::fixed(60);
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_linear() {
        let backoff = Backoff::Linear {
            base_secs: 60,
            increment_secs: 30,
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(90));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(120));
    }

    #[test]
    fn test_backoff_exponential_caps_at_max() {
        let backoff = Backoff::heavy();
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(120));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(240));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(600));
    }

    #[test]
    fn test_retry_policy_minimum_one_attempt() {
        let policy = RetryPolicy::with_attempts(0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
    }

    #[test]
    fn test_outcome_variants() {
        assert!(Outcome::ok().is_success());
        assert!(!Outcome::TransientFailure("redis down".into()).is_success());
        assert!(!Outcome::PermanentFailure("bad args".into()).is_success());
    }
}
