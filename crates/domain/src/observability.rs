//! Tracing/OpenTelemetry wiring shared by every SerialAgent core binary
//! and integration test harness.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::ObservabilityConfig;

/// Install the global `tracing` subscriber: structured JSON logs to stdout,
/// plus an OTLP/gRPC trace exporter when `config.otlp_endpoint` is set.
///
/// Returns the `SdkTracerProvider` so the caller can `shutdown()` it on
/// exit and flush any buffered spans. `None` when OTel export is disabled.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<Option<SdkTracerProvider>, crate::error::Error> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().json();

    let Some(endpoint) = config.otlp_endpoint.as_ref() else {
        Registry::default().with(env_filter).with(fmt_layer).init();
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .build()
        .map_err(|e| crate::error::Error::Config(format!("failed to build OTLP exporter: {e}")))?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::TraceIdRatioBased(config.sample_rate))
        .with_resource(
            opentelemetry_sdk::Resource::builder()
                .with_attribute(KeyValue::new("service.name", config.service_name.clone()))
                .build(),
        )
        .build();

    let tracer = provider.tracer(config.service_name.clone());
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    Ok(Some(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_endpoint_is_a_no_op_variant() {
        let config = ObservabilityConfig::default();
        assert!(config.otlp_endpoint.is_none());
    }
}
