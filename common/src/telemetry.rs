// Telemetry: structured logging, metrics, and optional trace export.

use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging with JSON formatting and trace context.
///
/// Log levels come from `RUST_LOG` when set, otherwise from configuration;
/// an OTLP endpoint adds a trace-export layer.
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", "cadence-scheduler"),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer("cadence-scheduler");

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");
    Ok(tracer)
}

/// Start the Prometheus scrape endpoint and register metric metadata.
pub fn init_metrics(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_metrics();
    tracing::info!(port, "Prometheus metrics endpoint started");
    Ok(())
}

fn describe_metrics() {
    describe_counter!(
        "scheduler_triggers_acquired_total",
        "Triggers claimed by the acquire pipeline"
    );
    describe_counter!(
        "scheduler_triggers_fired_total",
        "Triggers moved into execution"
    );
    describe_counter!(
        "scheduler_jobs_executed_total",
        "Job executions finished, success or failure"
    );
    describe_counter!(
        "scheduler_jobs_failed_total",
        "Job executions that returned an error"
    );
    describe_counter!(
        "scheduler_jobs_vetoed_total",
        "Job executions vetoed by a trigger listener"
    );
    describe_counter!(
        "scheduler_misfires_handled_total",
        "Misfired triggers remediated by the sweep"
    );
    describe_counter!(
        "scheduler_cluster_recoveries_total",
        "Failed cluster instances recovered"
    );
    describe_counter!(
        "scheduler_store_retries_total",
        "Transient store failures that triggered a backoff"
    );
    describe_gauge!(
        "scheduler_executing_jobs",
        "Job executions currently in flight"
    );
    describe_histogram!(
        "scheduler_job_duration_seconds",
        "Wall-clock duration of job executions"
    );
}
