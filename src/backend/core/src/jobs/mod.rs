//! Background job scheduling and execution.
//!
//! The engine moves every deferred unit of work in the platform:
//! recommendation generation, model retraining, CV analysis, feature
//! extraction, and maintenance sweeps.
//!
//! Flow: the periodic scheduler and external callers submit jobs → the
//! queue router assigns a queue → the broker persists and delivers →
//! worker pools execute handlers under deadlines → the retry
//! coordinator decides resubmission vs. terminal failure → the result
//! store records the terminal state.
//!
//! Delivery is at-least-once: a worker crash mid-execution surrenders
//! its lease and the job is re-delivered, so handlers must tolerate
//! duplicate runs.

pub mod broker;
pub mod builtin;
pub mod engine;
pub mod job;
pub mod registry;
pub mod results;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod worker;

pub use broker::{Broker, InMemoryBroker, RedisBroker, DEFAULT_LEASE_TIMEOUT};
pub use builtin::register_builtin_jobs;
pub use engine::JobEngine;
pub use job::{Backoff, Job, JobId, Outcome, Priority, RetryPolicy};
pub use registry::{FnHandler, Handler, JobRegistry, JobSpec, RegisteredJob};
pub use results::{
    InMemoryResultStore, JobResult, JobStatus, Lookup, RedisResultStore, ResultStore,
    DEFAULT_RESULT_TTL,
};
pub use retry::{Disposition, RetryCoordinator};
pub use router::{QueueRouter, Route};
pub use scheduler::{platform_schedule, CalendarRule, PeriodicScheduler, ScheduleEntry};
pub use worker::{
    PoolStats, StatsSnapshot, WorkerPool, WorkerPoolConfig, DEFAULT_HARD_DEADLINE,
    DEFAULT_SOFT_DEADLINE,
};
