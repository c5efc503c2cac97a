use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::{trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Cli;

const SERVICE_NAME: &str = "lookout-hub";

/// Logging and export choices, taken from the command line before anything else starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Filter directives used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub otel_stdout: bool,
}

impl From<&Cli> for TelemetryConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            log_filter: cli.log_filter.clone(),
            otel_stdout: cli.otel_stdout,
        }
    }
}

/// Installed subscriber, span exporter and Prometheus recorder for the hub process.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init(config: &TelemetryConfig) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_hub_metrics();

        let tracer_provider = config.otel_stdout.then(span_stdout_provider);
        let span_layer = tracer_provider.as_ref().map(|provider| {
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        tracing_subscriber::registry()
            .with(log_filter(&config.log_filter)?)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(span_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!("exporting spans to stdout");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "span exporter did not flush on shutdown");
            }
        }
    }
}

/// Registers help text for everything the hub records, so `/metrics` is self-describing.
fn describe_hub_metrics() {
    describe_gauge!(
        "lookout_subscribers",
        Unit::Count,
        "Dashboards currently attached to the hub"
    );
    describe_counter!(
        "lookout_subscribers_connected_total",
        Unit::Count,
        "Websocket subscribers accepted"
    );
    describe_counter!(
        "lookout_upstream_sessions_total",
        Unit::Count,
        "Head stream sessions opened against the node"
    );
    describe_counter!(
        "lookout_upstream_parse_failures_total",
        Unit::Count,
        "Head stream records that could not be decoded"
    );
    describe_counter!(
        "lookout_blocks_broadcast_total",
        Unit::Count,
        "Blocks fanned out to subscribers"
    );
    describe_counter!(
        "lookout_subscriber_drops_total",
        Unit::Count,
        "Blocks dropped because a subscriber queue was full"
    );
}

fn span_stdout_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes([
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])
                .build(),
        )
        .build()
}

/// `RUST_LOG` wins; otherwise the configured directives, which must parse.
fn log_filter(fallback: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(fallback)
            .with_context(|| format!("invalid log filter {fallback:?}")),
    }
}
