//! # Talentum Core
//!
//! Background job scheduling and execution for the Talentum platform.
//!
//! ## Architecture
//!
//! - **Job Registry**: stable job names mapped to handlers, retry
//!   policies, and default priorities
//! - **Queue Router**: pattern-based job-name → queue resolution
//! - **Broker**: at-least-once delivery with priority ordering,
//!   delayed visibility, and leases (in-memory and Redis backends)
//! - **Worker Pools**: concurrent executors with soft/hard deadlines
//! - **Retry Coordinator**: centralized transient-failure backoff and
//!   retry-budget enforcement
//! - **Periodic Scheduler**: calendar-rule table evaluated on a tick
//!   loop, one fire per due instant
//! - **Result Store**: terminal outcomes with bounded retention
//! - **Observability**: structured tracing and metrics throughout

pub mod config;
pub mod error;
pub mod jobs;
pub mod observability;

pub use error::{ErrorCode, ErrorSeverity, Result, TalentumError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorSeverity, Result, TalentumError};
    pub use crate::jobs::{
        Backoff, Broker, CalendarRule, Handler, InMemoryBroker, InMemoryResultStore, Job,
        JobEngine, JobId, JobRegistry, JobResult, JobSpec, JobStatus, Lookup, Outcome,
        PeriodicScheduler, Priority, QueueRouter, RedisBroker, RedisResultStore, ResultStore,
        RetryCoordinator, RetryPolicy, Route, ScheduleEntry, WorkerPool, WorkerPoolConfig,
    };
}
