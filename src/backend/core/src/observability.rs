//! Observability: tracing, metrics, and logging.

use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the observability stack.
///
/// With an OTLP endpoint configured, spans are exported via
/// OpenTelemetry in addition to local JSON logging.
pub fn init(service_name: &str, otlp_endpoint: Option<&str>) -> anyhow::Result<()> {
    if let Some(endpoint) = otlp_endpoint {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .with_trace_config(
                opentelemetry_sdk::trace::config()
                    .with_resource(opentelemetry_sdk::Resource::new(vec![
                        opentelemetry::KeyValue::new("service.name", service_name.to_string()),
                    ])),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;

        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(telemetry_layer)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }

    Ok(())
}

/// Shutdown OpenTelemetry, flushing any pending spans.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Metric descriptions for everything the engine emits.
pub mod metrics {
    use metrics::{describe_counter, describe_gauge, gauge};

    /// Register all metric descriptions.
    pub fn register_metrics() {
        describe_counter!(
            "talentum_jobs_submitted_total",
            "Jobs accepted by the engine"
        );
        describe_counter!(
            "talentum_jobs_started_total",
            "Job executions started by worker pools"
        );
        describe_counter!(
            "talentum_jobs_completed_total",
            "Jobs that finished successfully"
        );
        describe_counter!(
            "talentum_jobs_retried_total",
            "Executions that failed transiently and were requeued"
        );
        describe_counter!(
            "talentum_jobs_failed_total",
            "Jobs that reached permanent failure"
        );
        describe_counter!(
            "talentum_schedule_fired_total",
            "Periodic schedule entries that came due"
        );
        describe_counter!(
            "talentum_deadline_soft_total",
            "Executions that exceeded their soft deadline"
        );
        describe_counter!(
            "talentum_deadline_hard_total",
            "Executions aborted at their hard deadline"
        );
        describe_counter!("talentum_errors_total", "Errors by code and severity");
        describe_gauge!("talentum_queue_depth", "Jobs waiting per queue");
    }

    /// Record the current depth of a queue.
    pub fn record_queue_depth(queue: &str, depth: usize) {
        gauge!("talentum_queue_depth", "queue" => queue.to_string()).set(depth as f64);
    }
}
