//! Talentum job engine - main entry point.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use talentum_core::{
    config::Config,
    jobs::{
        register_builtin_jobs, Broker, InMemoryBroker, InMemoryResultStore, JobEngine,
        JobRegistry, PeriodicScheduler, RedisBroker, RedisResultStore, ResultStore,
        RetryCoordinator, WorkerPool,
    },
    observability,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    // Initialize observability
    observability::init(
        "talentum-jobs",
        config.observability.otlp_endpoint.as_deref(),
    )?;
    observability::metrics::register_metrics();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Talentum job engine"
    );

    // Broker and result store: Redis when configured, in-memory otherwise
    let (broker, store): (Arc<dyn Broker>, Arc<dyn ResultStore>) = match &config.redis.url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())
                .map_err(|e| anyhow::anyhow!("Failed to create Redis client: {}", e))?;
            tracing::info!(url = %url, "Using Redis broker");
            (
                Arc::new(
                    RedisBroker::new(client.clone(), config.redis.namespace.clone())
                        .with_lease_timeout(config.engine.lease_timeout()),
                ),
                Arc::new(
                    RedisResultStore::new(client, config.redis.namespace.clone())
                        .with_ttl(config.engine.result_ttl()),
                ),
            )
        }
        None => {
            tracing::info!("Using in-memory broker");
            (
                Arc::new(InMemoryBroker::with_lease_timeout(
                    config.engine.lease_timeout(),
                )),
                Arc::new(InMemoryResultStore::with_ttl(config.engine.result_ttl())),
            )
        }
    };

    // Register the built-in job catalogue
    let mut registry = JobRegistry::new();
    register_builtin_jobs(&mut registry, store.clone())?;
    let registry = Arc::new(registry);
    tracing::info!(jobs = registry.len(), "Job registry initialized");

    let engine = Arc::new(JobEngine::new(
        registry.clone(),
        config.router(),
        broker.clone(),
        store.clone(),
    ));
    let coordinator = Arc::new(RetryCoordinator::new(
        broker.clone(),
        store.clone(),
        registry.clone(),
    ));

    // Worker pools
    let mut pools = Vec::new();
    for pool_config in config.pool_configs() {
        let mut pool = WorkerPool::new(
            pool_config,
            broker.clone(),
            registry.clone(),
            coordinator.clone(),
        );
        pool.start();
        pools.push(pool);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Periodic scheduler
    let scheduler = PeriodicScheduler::new(config.schedule_entries());
    let scheduler_handle = tokio::spawn(scheduler.run(
        engine.clone(),
        config.engine.scheduler_tick(),
        shutdown_rx.clone(),
    ));

    // Queue depth gauge
    let mut depth_queues: Vec<String> = config
        .pool_configs()
        .into_iter()
        .flat_map(|p| p.queues)
        .collect();
    depth_queues.sort();
    depth_queues.dedup();
    let depth_broker = broker.clone();
    let mut depth_shutdown = shutdown_rx.clone();
    let depth_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                changed = depth_shutdown.changed() => {
                    if changed.is_err() || *depth_shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    for queue in &depth_queues {
                        match depth_broker.depth(queue).await {
                            Ok(depth) => observability::metrics::record_queue_depth(queue, depth),
                            Err(e) => tracing::warn!(queue = %queue, error = %e, "Failed to read queue depth"),
                        }
                    }
                }
            }
        }
    });

    tracing::info!("Talentum job engine running");

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    for pool in pools {
        pool.shutdown().await;
    }
    let _ = scheduler_handle.await;
    let _ = depth_handle.await;

    observability::shutdown();
    tracing::info!("Talentum job engine stopped");
    Ok(())
}

/// Wait for ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
