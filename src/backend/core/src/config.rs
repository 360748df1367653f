//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

use crate::jobs::{
    platform_schedule, QueueRouter, Route, ScheduleEntry, WorkerPoolConfig,
};

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Redis configuration; no URL means the in-memory broker
    #[serde(default)]
    pub redis: RedisConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Worker pool table; empty means the platform defaults
    #[serde(default)]
    pub pools: Vec<PoolConfig>,

    /// Route table; empty means the platform defaults
    #[serde(default)]
    pub routes: Vec<Route>,

    /// Periodic schedule table; empty means the platform defaults
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL; `None` selects the in-memory broker
    pub url: Option<String>,

    /// Key namespace prefix
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            namespace: default_namespace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Queue for jobs no route matches
    #[serde(default = "default_queue")]
    pub default_queue: String,

    /// Broker lease duration in seconds
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: u64,

    /// Soft execution deadline in seconds
    #[serde(default = "default_soft_deadline")]
    pub soft_deadline_secs: u64,

    /// Hard execution deadline in seconds
    #[serde(default = "default_hard_deadline")]
    pub hard_deadline_secs: u64,

    /// Scheduler tick interval in seconds (capped at 60)
    #[serde(default = "default_scheduler_tick")]
    pub scheduler_tick_secs: u64,

    /// Result retention in seconds
    #[serde(default = "default_result_ttl")]
    pub result_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_queue: default_queue(),
            lease_timeout_secs: default_lease_timeout(),
            soft_deadline_secs: default_soft_deadline(),
            hard_deadline_secs: default_hard_deadline(),
            scheduler_tick_secs: default_scheduler_tick(),
            result_ttl_secs: default_result_ttl(),
        }
    }
}

impl EngineConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn soft_deadline(&self) -> Duration {
        Duration::from_secs(self.soft_deadline_secs)
    }

    pub fn hard_deadline(&self) -> Duration {
        Duration::from_secs(self.hard_deadline_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

/// One worker pool: a name, the queues it consumes, its concurrency.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub queues: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

// Default value functions
fn default_namespace() -> String { "talentum".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_queue() -> String { "default".to_string() }
fn default_lease_timeout() -> u64 { 1860 }
fn default_soft_deadline() -> u64 { 25 * 60 }
fn default_hard_deadline() -> u64 { 30 * 60 }
fn default_scheduler_tick() -> u64 { 30 }
fn default_result_ttl() -> u64 { 24 * 60 * 60 }
fn default_concurrency() -> usize { 2 }

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("TALENTUM").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TALENTUM").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Build the queue router from the configured routes, falling back
    /// to the platform route table.
    pub fn router(&self) -> QueueRouter {
        if self.routes.is_empty() {
            QueueRouter::platform_default()
        } else {
            QueueRouter::new(self.routes.clone(), self.engine.default_queue.clone())
        }
    }

    /// The periodic schedule, falling back to the platform calendar.
    pub fn schedule_entries(&self) -> Vec<ScheduleEntry> {
        if self.schedule.is_empty() {
            platform_schedule()
        } else {
            self.schedule.clone()
        }
    }

    /// Worker pool configurations, falling back to the platform's
    /// dedicated pools.
    pub fn pool_configs(&self) -> Vec<WorkerPoolConfig> {
        let pools: Vec<PoolConfig> = if self.pools.is_empty() {
            vec![
                PoolConfig {
                    name: "recommendations".into(),
                    queues: vec!["recommendations".into()],
                    concurrency: 4,
                },
                PoolConfig {
                    name: "training".into(),
                    queues: vec!["training".into()],
                    concurrency: 1,
                },
                PoolConfig {
                    name: "analysis".into(),
                    queues: vec!["analysis".into()],
                    concurrency: 2,
                },
                PoolConfig {
                    name: "general".into(),
                    queues: vec!["features".into(), "maintenance".into(), "default".into()],
                    concurrency: 2,
                },
            ]
        } else {
            self.pools.clone()
        };

        pools
            .into_iter()
            .map(|p| {
                WorkerPoolConfig::new(p.name, p.queues)
                    .concurrency(p.concurrency)
                    .deadlines(self.engine.soft_deadline(), self.engine.hard_deadline())
            })
            .collect()
    }
}
