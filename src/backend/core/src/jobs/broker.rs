//! Broker interface and backends.
//!
//! The broker is the only shared mutable resource in the engine: it
//! stores enqueued jobs, orders them (priority first, FIFO among equal
//! priority), hides delayed jobs until `not_before`, and leases
//! dequeued jobs to workers. A job invisible under a lease becomes
//! visible again when the lease expires, which is the at-least-once
//! delivery window.
//!
//! Two backends are provided: an in-memory broker (tests, development,
//! single-process deployments) and a Redis broker for production.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{ErrorCode, Result, TalentumError};

use super::{Job, JobId, Priority};

/// Default ack-lease duration; a crashed worker's job becomes visible
/// again after this long.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(1860);

// ═══════════════════════════════════════════════════════════════════════════════
// Broker Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Abstract transport that stores enqueued jobs and delivers them to
/// workers.
///
/// Attempt bookkeeping: `nack` bumps the stored job's `attempt` before
/// redelivery, so a delivered job always carries the attempt number of
/// the execution it is about to begin. Lease-expiry redelivery does
/// NOT bump `attempt`; it re-delivers the same execution.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Persist a job. With `delay > 0` the job stays invisible to
    /// consumers until `now + delay`. Fails with `BrokerUnavailable`
    /// on transport failure; the caller decides whether to retry.
    async fn enqueue(&self, job: Job, delay: Duration) -> Result<()>;

    /// Return the highest-priority, earliest-eligible job across the
    /// given queues, blocking up to `block_timeout` for availability.
    /// The returned job is leased: invisible to other consumers until
    /// acked, nacked, or the lease expires.
    async fn dequeue(&self, queues: &[String], block_timeout: Duration) -> Result<Option<Job>>;

    /// Mark delivery complete, removing the job permanently.
    async fn ack(&self, job_id: JobId) -> Result<()>;

    /// Return the job to its queue for another execution, visible
    /// again after `requeue_delay`. Bumps the attempt counter.
    async fn nack(&self, job_id: JobId, requeue_delay: Duration) -> Result<()>;

    /// Number of jobs waiting (ready or delayed) in a queue.
    async fn depth(&self, queue: &str) -> Result<usize>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Broker
// ═══════════════════════════════════════════════════════════════════════════════

struct ReadyMsg {
    priority: Priority,
    seq: u64,
    job: Job,
}

impl Eq for ReadyMsg {}

impl PartialEq for ReadyMsg {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl PartialOrd for ReadyMsg {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyMsg {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: highest priority first, then lowest seq (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct DelayedMsg {
    visible_at: Instant,
    seq: u64,
    job: Job,
}

impl Eq for DelayedMsg {}

impl PartialEq for DelayedMsg {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl PartialOrd for DelayedMsg {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedMsg {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.visible_at
            .cmp(&other.visible_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct QueueState {
    ready: BinaryHeap<ReadyMsg>,
    delayed: BinaryHeap<Reverse<DelayedMsg>>,
}

struct InFlight {
    job: Job,
    lease_expires: Instant,
}

#[derive(Default)]
struct Shared {
    queues: HashMap<String, QueueState>,
    in_flight: HashMap<JobId, InFlight>,
    seq: u64,
}

/// In-memory broker backend.
///
/// All mutation happens under a single mutex, which makes
/// enqueue/dequeue/ack/nack atomic with respect to concurrent callers.
pub struct InMemoryBroker {
    shared: Mutex<Shared>,
    notify: Notify,
    lease_timeout: Duration,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_lease_timeout(DEFAULT_LEASE_TIMEOUT)
    }

    pub fn with_lease_timeout(lease_timeout: Duration) -> Self {
        Self {
            shared: Mutex::new(Shared::default()),
            notify: Notify::new(),
            lease_timeout,
        }
    }

    /// Move expired leases back to their queues. Re-delivery, not a
    /// retry: the attempt counter is left untouched.
    fn reclaim_expired(shared: &mut Shared, now: Instant) {
        let expired: Vec<JobId> = shared
            .in_flight
            .iter()
            .filter(|(_, f)| f.lease_expires <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(flight) = shared.in_flight.remove(&id) {
                tracing::warn!(job_id = %id, queue = %flight.job.queue, "Lease expired, requeuing job");
                shared.seq += 1;
                let seq = shared.seq;
                let priority = flight.job.priority;
                shared
                    .queues
                    .entry(flight.job.queue.clone())
                    .or_default()
                    .ready
                    .push(ReadyMsg {
                        priority,
                        seq,
                        job: flight.job,
                    });
            }
        }
    }

    /// Move matured delayed messages into the ready heap.
    fn promote_due(state: &mut QueueState, now: Instant) {
        loop {
            match state.delayed.peek() {
                Some(Reverse(head)) if head.visible_at <= now => {}
                _ => break,
            }
            if let Some(Reverse(msg)) = state.delayed.pop() {
                state.ready.push(ReadyMsg {
                    priority: msg.job.priority,
                    seq: msg.seq,
                    job: msg.job,
                });
            }
        }
    }

    /// Attempt one non-blocking dequeue across the given queues.
    fn try_dequeue(&self, queues: &[String], now: Instant) -> Option<Job> {
        let mut shared = self.shared.lock();
        Self::reclaim_expired(&mut shared, now);

        for name in queues {
            if let Some(state) = shared.queues.get_mut(name) {
                Self::promote_due(state, now);
            }
        }

        // Highest priority across queues, FIFO (lowest seq) among ties.
        let best = queues
            .iter()
            .filter_map(|name| {
                shared
                    .queues
                    .get(name)
                    .and_then(|s| s.ready.peek())
                    .map(|m| (m.priority, Reverse(m.seq), name.clone()))
            })
            .max()?;

        let msg = shared.queues.get_mut(&best.2)?.ready.pop()?;
        let job = msg.job.clone();
        shared.in_flight.insert(
            job.id,
            InFlight {
                job: msg.job,
                lease_expires: now + self.lease_timeout,
            },
        );
        Some(job)
    }

    /// Earliest instant at which new work could appear without an
    /// external event: the next delayed message or lease expiry.
    fn next_wake(&self, queues: &[String]) -> Option<Instant> {
        let shared = self.shared.lock();
        let next_delayed = queues
            .iter()
            .filter_map(|name| shared.queues.get(name))
            .filter_map(|s| s.delayed.peek().map(|Reverse(m)| m.visible_at))
            .min();
        let next_lease = shared.in_flight.values().map(|f| f.lease_expires).min();
        match (next_delayed, next_lease) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, mut job: Job, delay: Duration) -> Result<()> {
        let now = Instant::now();
        {
            let mut shared = self.shared.lock();
            shared.seq += 1;
            let seq = shared.seq;
            let state = shared.queues.entry(job.queue.clone()).or_default();

            if delay.is_zero() {
                state.ready.push(ReadyMsg {
                    priority: job.priority,
                    seq,
                    job,
                });
            } else {
                job.not_before = chrono::Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                state.delayed.push(Reverse(DelayedMsg {
                    visible_at: now + delay,
                    seq,
                    job,
                }));
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, queues: &[String], block_timeout: Duration) -> Result<Option<Job>> {
        let deadline = Instant::now() + block_timeout;
        loop {
            let now = Instant::now();
            if let Some(job) = self.try_dequeue(queues, now) {
                return Ok(Some(job));
            }
            if now >= deadline {
                return Ok(None);
            }

            // Bounded wait so delayed maturation and lease expiry are
            // observed even if a notification is missed.
            let wake = self
                .next_wake(queues)
                .unwrap_or(deadline)
                .min(deadline)
                .min(now + Duration::from_millis(100));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn ack(&self, job_id: JobId) -> Result<()> {
        let removed = self.shared.lock().in_flight.remove(&job_id);
        if removed.is_none() {
            // Lease may already have expired and the job been reclaimed.
            tracing::warn!(job_id = %job_id, "Ack for unknown lease");
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, job_id: JobId, requeue_delay: Duration) -> Result<()> {
        let now = Instant::now();
        {
            let mut shared = self.shared.lock();
            let flight = shared.in_flight.remove(&job_id).ok_or_else(|| {
                TalentumError::new(
                    ErrorCode::MessageNotFound,
                    format!("No leased job with id {}", job_id),
                )
            })?;

            let mut job = flight.job;
            job.attempt += 1;
            job.not_before = chrono::Utc::now()
                + chrono::Duration::from_std(requeue_delay)
                    .unwrap_or_else(|_| chrono::Duration::zero());

            shared.seq += 1;
            let seq = shared.seq;
            let state = shared.queues.entry(job.queue.clone()).or_default();
            if requeue_delay.is_zero() {
                state.ready.push(ReadyMsg {
                    priority: job.priority,
                    seq,
                    job,
                });
            } else {
                state.delayed.push(Reverse(DelayedMsg {
                    visible_at: now + requeue_delay,
                    seq,
                    job,
                }));
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<usize> {
        let shared = self.shared.lock();
        Ok(shared
            .queues
            .get(queue)
            .map(|s| s.ready.len() + s.delayed.len())
            .unwrap_or(0))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Broker
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis-backed broker for production use.
///
/// Layout per queue: a `ready` sorted set whose score encodes
/// (priority, enqueue time) so `ZRANGE` pops highest priority FIFO, and
/// a `delayed` sorted set scored by visibility time. Job payloads live
/// in a single hash; leases in a sorted set scored by expiry.
///
/// The promote/reclaim steps are not transactional with the pop; a
/// crash between them widens the at-least-once window but never loses
/// a job.
pub struct RedisBroker {
    client: redis::Client,
    namespace: String,
    lease_timeout: Duration,
}

impl RedisBroker {
    pub fn new(client: redis::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                TalentumError::broker_unavailable(format!("Redis connection failed: {}", e))
            })
    }

    fn ready_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:ready", self.namespace, queue)
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:delayed", self.namespace, queue)
    }

    fn jobs_key(&self) -> String {
        format!("{}:jobs", self.namespace)
    }

    fn leases_key(&self) -> String {
        format!("{}:leases", self.namespace)
    }

    /// Score for the ready zset: higher priority sorts lower (popped
    /// first), FIFO within a priority band.
    fn ready_score(priority: Priority, enqueued_ms: i64) -> f64 {
        let band = (Priority::MAX.value() - priority.value()) as f64;
        band * 1e13 + enqueued_ms as f64
    }

    async fn store_job(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job: &Job,
    ) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        redis::cmd("HSET")
            .arg(self.jobs_key())
            .arg(job.id.to_string())
            .arg(payload)
            .query_async::<_, i64>(conn)
            .await?;
        Ok(())
    }

    async fn load_job(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job_id: &str,
    ) -> Result<Option<Job>> {
        let payload: Option<String> = redis::cmd("HGET")
            .arg(self.jobs_key())
            .arg(job_id)
            .query_async(conn)
            .await?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }

    /// Move matured delayed jobs into the ready zset.
    async fn promote_due(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        queue: &str,
        now_ms: i64,
    ) -> Result<()> {
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.delayed_key(queue))
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(64)
            .query_async(conn)
            .await?;

        for id in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(self.delayed_key(queue))
                .arg(&id)
                .query_async(conn)
                .await?;
            if removed == 0 {
                continue; // another consumer promoted it
            }
            if let Some(job) = self.load_job(conn, &id).await? {
                redis::cmd("ZADD")
                    .arg(self.ready_key(queue))
                    .arg(Self::ready_score(job.priority, now_ms))
                    .arg(&id)
                    .query_async::<_, i64>(conn)
                    .await?;
            }
        }
        Ok(())
    }

    /// Requeue jobs whose lease has expired.
    async fn reclaim_expired(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        now_ms: i64,
    ) -> Result<()> {
        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.leases_key())
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(32)
            .query_async(conn)
            .await?;

        for id in expired {
            let removed: i64 = redis::cmd("ZREM")
                .arg(self.leases_key())
                .arg(&id)
                .query_async(conn)
                .await?;
            if removed == 0 {
                continue;
            }
            if let Some(job) = self.load_job(conn, &id).await? {
                tracing::warn!(job_id = %id, queue = %job.queue, "Lease expired, requeuing job");
                redis::cmd("ZADD")
                    .arg(self.ready_key(&job.queue))
                    .arg(Self::ready_score(job.priority, now_ms))
                    .arg(&id)
                    .query_async::<_, i64>(conn)
                    .await?;
            }
        }
        Ok(())
    }

    /// Pop the best ready job across the given queues, if any.
    async fn try_pop(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        queues: &[String],
        now_ms: i64,
    ) -> Result<Option<Job>> {
        // Peek the head of each queue and take the globally lowest score
        // (= highest priority, earliest enqueue).
        let mut best: Option<(f64, String, String)> = None;
        for queue in queues {
            let head: Vec<(String, f64)> = redis::cmd("ZRANGE")
                .arg(self.ready_key(queue))
                .arg(0)
                .arg(0)
                .arg("WITHSCORES")
                .query_async(conn)
                .await?;
            if let Some((id, score)) = head.into_iter().next() {
                if best.as_ref().map(|(s, _, _)| score < *s).unwrap_or(true) {
                    best = Some((score, queue.clone(), id));
                }
            }
        }

        let Some((_, queue, id)) = best else {
            return Ok(None);
        };

        let removed: i64 = redis::cmd("ZREM")
            .arg(self.ready_key(&queue))
            .arg(&id)
            .query_async(conn)
            .await?;
        if removed == 0 {
            return Ok(None); // lost the race, caller loops
        }

        let lease_deadline = now_ms + self.lease_timeout.as_millis() as i64;
        redis::cmd("ZADD")
            .arg(self.leases_key())
            .arg(lease_deadline)
            .arg(&id)
            .query_async::<_, i64>(conn)
            .await?;

        self.load_job(conn, &id).await
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, mut job: Job, delay: Duration) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let now_ms = chrono::Utc::now().timestamp_millis();

        if !delay.is_zero() {
            job.not_before = chrono::Utc::now()
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::zero());
        }
        self.store_job(&mut conn, &job).await?;

        if delay.is_zero() {
            redis::cmd("ZADD")
                .arg(self.ready_key(&job.queue))
                .arg(Self::ready_score(job.priority, now_ms))
                .arg(job.id.to_string())
                .query_async::<_, i64>(&mut conn)
                .await?;
        } else {
            redis::cmd("ZADD")
                .arg(self.delayed_key(&job.queue))
                .arg(now_ms + delay.as_millis() as i64)
                .arg(job.id.to_string())
                .query_async::<_, i64>(&mut conn)
                .await?;
        }

        tracing::debug!(job_id = %job.id, queue = %job.queue, "Job enqueued");
        Ok(())
    }

    async fn dequeue(&self, queues: &[String], block_timeout: Duration) -> Result<Option<Job>> {
        let mut conn = self.get_conn().await?;
        let deadline = Instant::now() + block_timeout;

        loop {
            let now_ms = chrono::Utc::now().timestamp_millis();
            self.reclaim_expired(&mut conn, now_ms).await?;
            for queue in queues {
                self.promote_due(&mut conn, queue, now_ms).await?;
            }
            if let Some(job) = self.try_pop(&mut conn, queues, now_ms).await? {
                tracing::debug!(job_id = %job.id, queue = %job.queue, "Job dequeued");
                return Ok(Some(job));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn ack(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("ZREM")
            .arg(self.leases_key())
            .arg(job_id.to_string())
            .query_async::<_, i64>(&mut conn)
            .await?;
        redis::cmd("HDEL")
            .arg(self.jobs_key())
            .arg(job_id.to_string())
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, job_id: JobId, requeue_delay: Duration) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let id = job_id.to_string();

        let mut job = self.load_job(&mut conn, &id).await?.ok_or_else(|| {
            TalentumError::new(
                ErrorCode::MessageNotFound,
                format!("No leased job with id {}", job_id),
            )
        })?;

        job.attempt += 1;
        job.not_before = chrono::Utc::now()
            + chrono::Duration::from_std(requeue_delay)
                .unwrap_or_else(|_| chrono::Duration::zero());
        self.store_job(&mut conn, &job).await?;

        redis::cmd("ZREM")
            .arg(self.leases_key())
            .arg(&id)
            .query_async::<_, i64>(&mut conn)
            .await?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        if requeue_delay.is_zero() {
            redis::cmd("ZADD")
                .arg(self.ready_key(&job.queue))
                .arg(Self::ready_score(job.priority, now_ms))
                .arg(&id)
                .query_async::<_, i64>(&mut conn)
                .await?;
        } else {
            redis::cmd("ZADD")
                .arg(self.delayed_key(&job.queue))
                .arg(now_ms + requeue_delay.as_millis() as i64)
                .arg(&id)
                .query_async::<_, i64>(&mut conn)
                .await?;
        }

        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let ready: i64 = redis::cmd("ZCARD")
            .arg(self.ready_key(queue))
            .query_async(&mut conn)
            .await?;
        let delayed: i64 = redis::cmd("ZCARD")
            .arg(self.delayed_key(queue))
            .query_async(&mut conn)
            .await?;
        Ok((ready + delayed) as usize)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
