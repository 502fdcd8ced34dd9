//! Logging and trace export
//!
//! [`init_telemetry`] installs the process-wide `tracing` subscriber: an env
//! filter, a JSON (or plain) formatter and, when an OTLP endpoint is known,
//! span and metric export. The returned [`TelemetryGuard`] flushes pending
//! exports when dropped, so `main` keeps it alive until exit.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

/// Filter used when neither the config nor `RUST_LOG` sets one
pub const DEFAULT_LOG_FILTER: &str = "info,stratus=debug";

/// Environment variable naming the OTLP collector
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Telemetry setup failures
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("failed to build {signal} exporter for {endpoint}: {message}")]
    Exporter {
        /// "span" or "metric"
        signal: &'static str,
        /// Collector endpoint
        endpoint: String,
        /// Exporter error
        message: String,
    },

    /// The log filter directive is malformed
    #[error("invalid log filter {filter:?}: {message}")]
    Filter {
        /// Offending directive
        filter: String,
        /// Parser error
        message: String,
    },

    /// A global subscriber was already installed
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Telemetry settings
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` reported with every span and metric
    pub service_name: String,
    /// OTLP gRPC collector; no export when unset
    pub otlp_endpoint: Option<String>,
    /// JSON log lines instead of plain text
    pub json: bool,
    /// Filter directive overriding `RUST_LOG`
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "stratus".to_string(),
            otlp_endpoint: std::env::var(OTLP_ENDPOINT_ENV)
                .ok()
                .filter(|e| !e.is_empty()),
            json: true,
            log_filter: None,
        }
    }
}

/// Keeps exporters alive; flushes and shuts them down on drop
#[must_use = "dropping the guard stops trace and metric export"]
#[derive(Default)]
pub struct TelemetryGuard {
    tracer: Option<TracerProvider>,
    meter: Option<SdkMeterProvider>,
}

impl TelemetryGuard {
    /// Whether spans and metrics leave the process
    pub fn is_exporting(&self) -> bool {
        self.tracer.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(tracer) = self.tracer.take() {
            if let Err(e) = tracer.shutdown() {
                eprintln!("failed to flush spans: {e}");
            }
        }
        if let Some(meter) = self.meter.take() {
            if let Err(e) = meter.shutdown() {
                eprintln!("failed to flush metrics: {e}");
            }
        }
    }
}

/// Install the global subscriber and, if configured, OTLP export.
///
/// Call once from `main` inside the Tokio runtime, before spawning workers.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let filter = log_filter(config.log_filter.as_deref())?;
    let mut guard = TelemetryGuard::default();

    let export_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let resource = resource(&config.service_name);

            let meter = meter_provider(endpoint, resource.clone())?;
            global::set_meter_provider(meter.clone());
            guard.meter = Some(meter);

            let tracer = tracer_provider(endpoint, resource)?;
            global::set_tracer_provider(tracer.clone());
            let layer = tracing_opentelemetry::layer()
                .with_tracer(tracer.tracer(config.service_name.clone()));
            guard.tracer = Some(tracer);
            Some(layer)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(format_layer(config.json))
        .with(export_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))?;

    Ok(guard)
}

fn log_filter(directive: Option<&str>) -> Result<EnvFilter, TelemetryError> {
    match directive {
        Some(filter) => EnvFilter::try_new(filter).map_err(|e| TelemetryError::Filter {
            filter: filter.to_string(),
            message: e.to_string(),
        }),
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))),
    }
}

fn format_layer<S>(json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer().with_target(true);
    if json {
        layer.json().with_current_span(true).with_span_list(false).boxed()
    } else {
        layer.boxed()
    }
}

/// Service identity attached to exported telemetry
fn resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, service_name.to_string()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    if let Ok(instance) = std::env::var("STRATUS_INSTANCE") {
        attributes.push(KeyValue::new("stratus.instance", instance));
    }
    Resource::new(attributes)
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "span",
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "metric",
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;

    Ok(SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build())
}
