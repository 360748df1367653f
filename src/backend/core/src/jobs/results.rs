//! Result store: terminal job outcomes with bounded retention.
//!
//! A result is written exactly once, at the terminal transition
//! (success or permanent failure). Jobs that are still queued,
//! running, or awaiting a retry report as `Pending`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Result;

use super::JobId;

/// Default retention window for terminal results.
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ═══════════════════════════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Terminal status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
}

/// The terminal record for a job: success payload or failure reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub job_name: String,
    pub status: JobStatus,
    /// Success payload; `None` on failure
    pub payload: Option<serde_json::Value>,
    /// Failure reason; `None` on success
    pub error: Option<String>,
    /// Total executions consumed (1 for first-try success)
    pub executions: u32,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn succeeded(
        job_id: JobId,
        job_name: impl Into<String>,
        payload: serde_json::Value,
        executions: u32,
    ) -> Self {
        Self {
            job_id,
            job_name: job_name.into(),
            status: JobStatus::Succeeded,
            payload: Some(payload),
            error: None,
            executions,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(
        job_id: JobId,
        job_name: impl Into<String>,
        error: impl Into<String>,
        executions: u32,
    ) -> Self {
        Self {
            job_id,
            job_name: job_name.into(),
            status: JobStatus::Failed,
            payload: None,
            error: Some(error.into()),
            executions,
            finished_at: Utc::now(),
        }
    }
}

/// Result of a lookup by job id.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Terminal outcome recorded and still within retention
    Found(JobResult),
    /// Submitted but not yet terminal (queued, running, or retrying)
    Pending,
    /// Never submitted, or evicted after retention
    NotFound,
}

impl Lookup {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Lookup::Pending)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Storage for terminal results, plus pending tracking from submission
/// to the terminal transition.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Mark a job as submitted (pending). Called by the engine before
    /// handing the job to the broker. The marker shares the store's
    /// retention window so an abandoned entry eventually evicts.
    async fn track_pending(&self, job_id: JobId) -> Result<()>;

    /// Drop a pending marker without a terminal record. Called when an
    /// accepted submission could not be handed to the broker.
    async fn untrack_pending(&self, job_id: JobId) -> Result<()>;

    /// Record the terminal outcome, clearing pending state. The record
    /// is retained for the store's TTL.
    async fn record(&self, result: JobResult) -> Result<()>;

    /// Look up a job's outcome.
    async fn get(&self, job_id: JobId) -> Result<Lookup>;

    /// Evict results past their retention window. Returns the number
    /// evicted; backends with native expiry may return 0.
    async fn purge_expired(&self) -> Result<usize>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct StoreInner {
    /// Pending markers, each stamped with its eviction deadline
    pending: HashMap<JobId, Instant>,
    completed: HashMap<JobId, (JobResult, Instant)>,
}

pub struct InMemoryResultStore {
    inner: Mutex<StoreInner>,
    ttl: Duration,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_RESULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            ttl,
        }
    }
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn track_pending(&self, job_id: JobId) -> Result<()> {
        let expires = Instant::now() + self.ttl;
        self.inner.lock().pending.insert(job_id, expires);
        Ok(())
    }

    async fn untrack_pending(&self, job_id: JobId) -> Result<()> {
        self.inner.lock().pending.remove(&job_id);
        Ok(())
    }

    async fn record(&self, result: JobResult) -> Result<()> {
        let expires = Instant::now() + self.ttl;
        let mut inner = self.inner.lock();
        inner.pending.remove(&result.job_id);
        inner.completed.insert(result.job_id, (result, expires));
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Lookup> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if let Some((result, expires)) = inner.completed.get(&job_id) {
            if *expires > now {
                return Ok(Lookup::Found(result.clone()));
            }
            inner.completed.remove(&job_id);
            return Ok(Lookup::NotFound);
        }
        if let Some(expires) = inner.pending.get(&job_id) {
            if *expires > now {
                return Ok(Lookup::Pending);
            }
            inner.pending.remove(&job_id);
        }
        Ok(Lookup::NotFound)
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.completed.len() + inner.pending.len();
        inner.completed.retain(|_, (_, expires)| *expires > now);
        inner.pending.retain(|_, expires| *expires > now);
        Ok(before - inner.completed.len() - inner.pending.len())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis-backed result store. Terminal records are plain keys with a
/// native `EX` expiry; pending markers share the same retention so
/// abandoned entries self-clean.
pub struct RedisResultStore {
    client: redis::Client,
    namespace: String,
    ttl: Duration,
}

impl RedisResultStore {
    pub fn new(client: redis::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            ttl: DEFAULT_RESULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                crate::error::TalentumError::broker_unavailable(format!(
                    "Redis connection failed: {}",
                    e
                ))
            })
    }

    fn result_key(&self, job_id: JobId) -> String {
        format!("{}:result:{}", self.namespace, job_id)
    }

    fn pending_key(&self, job_id: JobId) -> String {
        format!("{}:pending:{}", self.namespace, job_id)
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn track_pending(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("SET")
            .arg(self.pending_key(job_id))
            .arg(Utc::now().to_rfc3339())
            .arg("EX")
            .arg(self.ttl.as_secs())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn untrack_pending(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("DEL")
            .arg(self.pending_key(job_id))
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn record(&self, result: JobResult) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let payload = serde_json::to_string(&result)?;
        redis::cmd("SET")
            .arg(self.result_key(result.job_id))
            .arg(payload)
            .arg("EX")
            .arg(self.ttl.as_secs())
            .query_async::<_, ()>(&mut conn)
            .await?;
        redis::cmd("DEL")
            .arg(self.pending_key(result.job_id))
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Lookup> {
        let mut conn = self.get_conn().await?;
        let payload: Option<String> = redis::cmd("GET")
            .arg(self.result_key(job_id))
            .query_async(&mut conn)
            .await?;
        if let Some(p) = payload {
            return Ok(Lookup::Found(serde_json::from_str(&p)?));
        }
        let pending: i64 = redis::cmd("EXISTS")
            .arg(self.pending_key(job_id))
            .query_async(&mut conn)
            .await?;
        if pending > 0 {
            return Ok(Lookup::Pending);
        }
        Ok(Lookup::NotFound)
    }

    async fn purge_expired(&self) -> Result<usize> {
        // Redis expires result keys natively.
        Ok(0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_until_terminal() {
        let store = InMemoryResultStore::new();
        let id = JobId::new();

        assert!(matches!(store.get(id).await.unwrap(), Lookup::NotFound));

        store.track_pending(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_pending());

        store
            .record(JobResult::succeeded(
                id,
                "analyze_cv",
                serde_json::json!({"score": 0.92}),
                1,
            ))
            .await
            .unwrap();

        match store.get(id).await.unwrap() {
            Lookup::Found(result) => {
                assert_eq!(result.status, JobStatus::Succeeded);
                assert_eq!(result.executions, 1);
            }
            other => panic!("expected Found, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_records_reason() {
        let store = InMemoryResultStore::new();
        let id = JobId::new();
        store.track_pending(id).await.unwrap();
        store
            .record(JobResult::failed(id, "retrain_content_model", "dataset missing", 3))
            .await
            .unwrap();

        match store.get(id).await.unwrap() {
            Lookup::Found(result) => {
                assert_eq!(result.status, JobStatus::Failed);
                assert_eq!(result.error.as_deref(), Some("dataset missing"));
                assert_eq!(result.executions, 3);
            }
            other => panic!("expected Found, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_result_evicted() {
        let store = InMemoryResultStore::with_ttl(Duration::from_millis(30));
        let id = JobId::new();
        store
            .record(JobResult::succeeded(id, "extract_user_features", serde_json::json!(null), 1))
            .await
            .unwrap();

        assert!(store.get(id).await.unwrap().is_found());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(store.get(id).await.unwrap(), Lookup::NotFound));
    }

    #[tokio::test]
    async fn test_pending_marker_expires_with_ttl() {
        let store = InMemoryResultStore::with_ttl(Duration::from_millis(30));
        let id = JobId::new();
        store.track_pending(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_pending());

        // A job that never settles must not report Pending forever.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(store.get(id).await.unwrap(), Lookup::NotFound));
    }

    #[tokio::test]
    async fn test_untrack_pending_clears_marker() {
        let store = InMemoryResultStore::new();
        let id = JobId::new();
        store.track_pending(id).await.unwrap();
        store.untrack_pending(id).await.unwrap();
        assert!(matches!(store.get(id).await.unwrap(), Lookup::NotFound));
    }

    #[tokio::test]
    async fn test_purge_sweeps_pending_markers() {
        let store = InMemoryResultStore::with_ttl(Duration::from_millis(30));
        for _ in 0..2 {
            store.track_pending(JobId::new()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_purge_expired_counts() {
        let store = InMemoryResultStore::with_ttl(Duration::from_millis(30));
        for _ in 0..3 {
            store
                .record(JobResult::succeeded(
                    JobId::new(),
                    "cleanup_expired_results",
                    serde_json::json!(null),
                    1,
                ))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 3);
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }
}
