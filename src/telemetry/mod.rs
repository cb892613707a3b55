//! # Telemetry (tracing + OpenTelemetry)
//!
//! Installs the global `tracing` subscriber used by the binary and exposes
//! the attribute set recorded for every step.
//!
//! ## Environment:
//!
//! - `RUST_LOG`: log filter (defaults to the configured level)
//! - `OTEL_SERVICE_NAME`: service name on exported spans
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector (gRPC); console only when unset
//! - `OTEL_TRACES_SAMPLER_ARG`: sampling ratio (0.0-1.0)
//!
//! ## Example:
//!
//! ```ignore
//! init_telemetry(TelemetryConfig::from_env())?;
//! let session = agent.run(url, settings, token).await;
//! shutdown_telemetry();
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use tracing::Level;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::properties::keys;
use crate::session::TestStep;

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to exported spans.
    pub service_name: String,
    /// OTLP collector, e.g. "http://localhost:4317". `None` logs to console only.
    pub otlp_endpoint: Option<String>,
    /// Fraction of traces kept (0.0 - 1.0).
    pub sampling_ratio: f64,
    pub enable_console_logging: bool,
    /// Level used when `RUST_LOG` is not set.
    pub log_level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "webprobe".to_string(),
            otlp_endpoint: None,
            sampling_ratio: 1.0,
            enable_console_logging: true,
            log_level: Level::INFO,
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }

        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.otlp_endpoint = Some(endpoint);
        }

        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
            if let Ok(r) = ratio.parse::<f64>() {
                config.sampling_ratio = r.clamp(0.0, 1.0);
            }
        }

        config
    }
}

// ============================================================================
// INIT / SHUTDOWN
// ============================================================================

/// Installs the global subscriber. Returns the OTLP tracer when one was configured.
pub fn init_telemetry(config: TelemetryConfig) -> anyhow::Result<Option<Tracer>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(endpoint) = &config.otlp_endpoint {
        let tracer = init_otlp_tracer(&config.service_name, endpoint, config.sampling_ratio)?;
        let telemetry_layer = OpenTelemetryLayer::new(tracer.clone());

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(telemetry_layer);

        if config.enable_console_logging {
            subscriber
                .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        } else {
            subscriber.init();
        }

        tracing::info!(
            service_name = %config.service_name,
            endpoint = %endpoint,
            sampling_ratio = config.sampling_ratio,
            "OTEL telemetry initialised"
        );

        Ok(Some(tracer))
    } else {
        let subscriber = tracing_subscriber::registry().with(env_filter);

        if config.enable_console_logging {
            subscriber
                .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        } else {
            subscriber.init();
        }

        tracing::debug!("Telemetry initialised (console only)");
        Ok(None)
    }
}

fn init_otlp_tracer(
    service_name: &str,
    endpoint: &str,
    sampling_ratio: f64,
) -> anyhow::Result<Tracer> {
    let sampler = if sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(sampling_ratio)
    };

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .build_span_exporter()?,
            Tokio,
        )
        .with_config(
            sdktrace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .build();

    let tracer = tracer_provider.tracer(service_name.to_string());
    global::set_tracer_provider(tracer_provider);

    Ok(tracer)
}

/// Flushes pending spans. Call before the process exits.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

// ============================================================================
// STEP ATTRIBUTES
// ============================================================================

/// OTEL-style attributes describing a step.
pub fn step_attributes(step: &TestStep) -> Vec<(&'static str, String)> {
    let mut attrs = vec![
        ("step.name", step.name().to_string()),
        ("step.kind", step.kind().to_string()),
        ("step.index", step.component_index().to_string()),
        ("step.result", if step.succeeded() { "succeeded" } else { "failed" }.to_string()),
        ("step.duration_ms", step.duration_ms().to_string()),
    ];

    let properties = step.properties();
    if let Some(uri) = properties.get::<String>(keys::HTTP_REQUEST_URI) {
        attrs.push(("http.url", uri));
    }
    if let Some(method) = properties.get::<String>(keys::HTTP_REQUEST_METHOD) {
        attrs.push(("http.method", method));
    }
    if let Some(status) = properties.get::<u16>(keys::HTTP_RESPONSE_STATUS) {
        attrs.push(("http.status_code", status.to_string()));
    }
    if let Some(code) = step.error_code() {
        attrs.push(("error.code", code.to_string()));
    }

    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorCode, StructuredError};
    use crate::session::{StepKind, TestSessionBuilder};
    use chrono::Utc;

    #[test]
    fn test_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "webprobe");
        assert!(config.otlp_endpoint.is_none());
        assert_eq!(config.sampling_ratio, 1.0);
        assert!(config.enable_console_logging);
    }

    #[test]
    fn test_step_attributes() {
        let mut builder = TestSessionBuilder::new();
        builder.initiate("https://example.test/", Utc::now(), "unit");
        builder.begin_step("HttpRequest", StepKind::Action, 2);
        builder.build_property(keys::HTTP_REQUEST_URI, "https://example.test/");
        builder.build_property(keys::HTTP_REQUEST_METHOD, "GET");
        builder.build_property(keys::HTTP_RESPONSE_STATUS, 502u16);
        builder.fail_step(&StructuredError::new(ErrorCode::TRANSPORT_ERROR, "bad gateway"));
        let step = builder.build_step().unwrap();

        let attrs = step_attributes(&step);
        let get = |key: &str| attrs.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str());

        assert_eq!(get("step.kind"), Some("action"));
        assert_eq!(get("step.index"), Some("2"));
        assert_eq!(get("step.result"), Some("failed"));
        assert_eq!(get("http.method"), Some("GET"));
        assert_eq!(get("http.status_code"), Some("502"));
        assert_eq!(get("error.code"), Some("E2005"));
    }
}
