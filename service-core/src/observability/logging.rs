use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, runtime, trace as sdktrace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber: env filter, OTLP span export and JSON logs.
///
/// Falls back to JSON logs only when the OTLP pipeline cannot be built, so a
/// missing collector never prevents the service from starting.
pub fn init_tracing(service_name: &str, log_level: &str, otlp_endpoint: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .json()
        .flatten_event(true);

    let otlp_exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(otlp_endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(otlp_exporter)
        .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
        ])))
        .install_batch(runtime::Tokio);

    let (otel_layer, otlp_error) = match tracer {
        Ok(tracer) => (Some(tracing_opentelemetry::layer().with_tracer(tracer)), None),
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(fmt_layer)
        .init();

    if let Some(e) = otlp_error {
        tracing::warn!(
            service = service_name,
            endpoint = otlp_endpoint,
            error = %e,
            "OTLP exporter unavailable, continuing with log output only"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global subscriber can be installed once per process, so this is the only test here.
    #[tokio::test]
    async fn installs_global_subscriber_with_otlp_layer() {
        init_tracing("logging-test", "debug", "http://127.0.0.1:4317");

        assert!(tracing::dispatcher::has_been_set());
        tracing::info!(check = true, "subscriber installed");
    }
}
