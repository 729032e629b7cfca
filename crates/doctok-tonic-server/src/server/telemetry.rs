//! # Logging and telemetry
//!
//! Logs always go to the console through a pretty `tracing-subscriber` fmt
//! layer filtered by `RUST_LOG` (default `info`). This includes the events of
//! the orchestrator's background workers.
//!
//! OpenTelemetry export is opt-in:
//!
//! - `tracing`: spans exported as traces
//! - `metrics`: request counters and histograms
//! - `honeycomb`: OTLP/gRPC exporter (`HONEYCOMB_API_KEY`,
//!   `HONEYCOMB_DATASET`, `HONEYCOMB_ENDPOINT`, `HONEYCOMB_COMPRESSION`)
//! - `stdout`: stdout exporter, useful locally
//!
//! Exporters need `tracing` or `metrics`; both exporters may be enabled at
//! once.
//!
//! ```bash
//! cargo run --features tracing,metrics,honeycomb
//! cargo run --features tracing,stdout
//! ```
//!
//! The metric helpers at the bottom compile to no-ops without `metrics`, so
//! handlers call them unconditionally.

#[cfg(all(
    feature = "honeycomb",
    not(any(feature = "tracing", feature = "metrics"))
))]
compile_error!(
    "The 'honeycomb' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::{propagation::TraceContextPropagator, trace as sdktrace};

#[cfg(any(feature = "metrics", feature = "tracing"))]
const SERVICE_NAME: &str = "doctok";

#[cfg(any(feature = "stdout", feature = "honeycomb"))]
const EXPORT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops the exporters. Errors go to stderr since the
    /// subscriber may already be gone.
    pub fn shutdown(&self) {
        #[cfg(feature = "tracing")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "tracing")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "tracing")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        init_metric_handles(opentelemetry::global::meter_with_scope(scope));
        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

/// Connection settings shared by the Honeycomb span and metric exporters.
#[cfg(feature = "honeycomb")]
struct Honeycomb {
    metadata: tonic::metadata::MetadataMap,
    endpoint: String,
    compression: opentelemetry_otlp::Compression,
}

#[cfg(feature = "honeycomb")]
impl Honeycomb {
    fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        use core::str::FromStr;

        let var = |name: &str| std::env::var(name).with_context(|| format!("missing `{name}`"));

        let mut metadata = tonic::metadata::MetadataMap::new();
        metadata.insert(
            "x-honeycomb-team",
            var("HONEYCOMB_API_KEY")?
                .parse()
                .context("invalid API key")?,
        );
        metadata.insert(
            "x-honeycomb-dataset",
            var("HONEYCOMB_DATASET")?
                .parse()
                .context("invalid dataset")?,
        );
        let compression = opentelemetry_otlp::Compression::from_str(
            &var("HONEYCOMB_COMPRESSION")?.to_ascii_lowercase(),
        )?;

        Ok(Self {
            metadata,
            endpoint: var("HONEYCOMB_ENDPOINT")?,
            compression,
        })
    }

    fn tonic_config<B>(self, builder: B) -> B
    where
        B: opentelemetry_otlp::WithTonicConfig + opentelemetry_otlp::WithExportConfig,
    {
        builder
            .with_tls_config(tonic::transport::ClientTlsConfig::new().with_native_roots())
            .with_metadata(self.metadata)
            .with_compression(self.compression)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_endpoint(self.endpoint)
            .with_protocol(opentelemetry_otlp::Protocol::Grpc)
    }
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_reader(
        sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(EXPORT_INTERVAL)
            .build(),
    );

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let exporter = Honeycomb::from_env()?
            .tonic_config(opentelemetry_otlp::MetricExporter::builder().with_tonic())
            .with_temporality(sdkmetrics::Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;
        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(all(feature = "tracing", any(feature = "stdout", feature = "honeycomb")))]
fn batch_processor<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: opentelemetry_sdk::trace::SpanExporter + 'static,
{
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(EXPORT_INTERVAL)
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

#[cfg(feature = "tracing")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder =
        builder.with_span_processor(batch_processor(opentelemetry_stdout::SpanExporter::default()));

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let exporter = Honeycomb::from_env()?
            .tonic_config(opentelemetry_otlp::SpanExporter::builder().with_tonic())
            .build()
            .context("failed to build tracer exporter")?;
        builder.with_span_processor(batch_processor(exporter))
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
static REQUESTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUEST_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUEST_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static RECORD_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = REQUESTS.set(
        meter
            .u64_counter("requests")
            .with_description("gRPC requests per method")
            .build(),
    );
    let _ = REQUEST_ERRORS.set(
        meter
            .u64_counter("request_errors")
            .with_description("gRPC requests answered with an error status")
            .build(),
    );
    let _ = REQUEST_DURATION_MS.set(
        meter
            .f64_histogram("request_duration")
            .with_unit("ms")
            .with_description("Time to answer a request; background work excluded")
            .build(),
    );
    let _ = RECORD_ERRORS.set(
        meter
            .u64_counter("record_errors")
            .with_description("Single-record tokenizations that failed")
            .build(),
    );
}

#[cfg(feature = "metrics")]
pub fn increment_requests(rpc: &'static str) {
    if let Some(counter) = REQUESTS.get() {
        counter.add(1, &[KeyValue::new("rpc", rpc)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests(_rpc: &'static str) {}

#[cfg(feature = "metrics")]
pub fn increment_request_errors(rpc: &'static str) {
    if let Some(counter) = REQUEST_ERRORS.get() {
        counter.add(1, &[KeyValue::new("rpc", rpc)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_request_errors(_rpc: &'static str) {}

#[cfg(feature = "metrics")]
pub fn record_request_duration(rpc: &'static str, duration_ms: f64) {
    if let Some(histogram) = REQUEST_DURATION_MS.get() {
        histogram.record(duration_ms, &[KeyValue::new("rpc", rpc)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_request_duration(_rpc: &'static str, _duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn increment_record_errors() {
    if let Some(counter) = RECORD_ERRORS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_record_errors() {}
