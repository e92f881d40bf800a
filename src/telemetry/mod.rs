//! Logging, traces, and metrics for relay processes.
//!
//! Every process logs through `tracing`. With `OTEL_ENDPOINT` set, spans,
//! metrics and log records are also shipped over OTLP/gRPC; without it the
//! process only writes human-readable lines to stderr.

pub mod metrics;
pub mod work;

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::{Error, Result};

/// Directives appended to every filter: sqlx logs each statement at info.
const QUIET_DEPENDENCIES: &str = "sqlx=warn,tower_http=info";

pub struct TelemetryConfig {
    /// OTLP collector, e.g. `http://localhost:4317`.
    pub endpoint: Option<String>,
    /// Reported as `service.name`; workers and the API server use different names.
    pub service_name: String,
    /// Default filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl TelemetryConfig {
    pub fn from_config(config: &Config, service_name: &str) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: service_name.to_string(),
            log_level: config.log_level.clone(),
        }
    }

    /// For processes running without a [`Config`] (the in-memory server).
    pub fn from_env(service_name: &str) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            endpoint: var("OTEL_ENDPOINT"),
            service_name: service_name.to_string(),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{},{QUIET_DEPENDENCIES}", self.log_level)))
    }
}

/// Keeps the OTLP pipelines alive. Dropping it flushes and shuts them down.
#[derive(Default)]
pub struct TelemetryGuard {
    providers: Option<Providers>,
}

struct Providers {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl TelemetryGuard {
    /// Whether signals are being exported.
    pub fn exporting(&self) -> bool {
        self.providers.is_some()
    }

    /// Push out anything still buffered. Errors are ignored.
    pub fn force_flush(&self) {
        if let Some(p) = &self.providers {
            let _ = p.tracer.force_flush();
            let _ = p.meter.force_flush();
            let _ = p.logger.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Logs first: shutting down the tracer still emits log records.
        if let Some(p) = self.providers.take() {
            let _ = p.logger.shutdown();
            let _ = p.meter.shutdown();
            let _ = p.tracer.shutdown();
        }
    }
}

/// Install the global subscriber (and the OTLP pipelines, if configured).
///
/// Fails if an exporter cannot be built or a global subscriber is already set.
/// Hold the returned guard until the process exits.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = config.filter();
    let Some(endpoint) = config.endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;
        return Ok(TelemetryGuard::default());
    };

    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attribute(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ))
        .build();
    let providers = build_providers(endpoint, resource)?;
    opentelemetry::global::set_meter_provider(providers.meter.clone());

    let tracer = providers.tracer.tracer("runrelay");
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
            &providers.logger,
        ))
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard {
        providers: Some(providers),
    })
}

fn build_providers(endpoint: &str, resource: Resource) -> Result<Providers> {
    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("span", e))?;
    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("metric", e))?;
    let logs = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("log", e))?;

    Ok(Providers {
        tracer: SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build(),
        meter: SdkMeterProvider::builder()
            .with_periodic_exporter(metrics)
            .with_resource(resource.clone())
            .build(),
        logger: SdkLoggerProvider::builder()
            .with_batch_exporter(logs)
            .with_resource(resource)
            .build(),
    })
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}
