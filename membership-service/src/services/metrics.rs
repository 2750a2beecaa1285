//! Metrics collection for membership-service.
//!
//! Everything goes through the `metrics` facade; calls are no-ops until
//! `init_metrics` installs the Prometheus recorder, so library users and
//! tests never need to initialize anything.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once.
pub fn init_metrics() {
    if METRICS_HANDLE.get().is_some() {
        return;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = METRICS_HANDLE.set(handle);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install Prometheus recorder");
        }
    }
}

/// Get metrics output in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

pub fn record_provider_call(provider: &str, operation: &str, status: &str, elapsed: Duration) {
    metrics::counter!(
        "membership_provider_calls_total",
        "provider" => provider.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(
        "membership_provider_call_duration_seconds",
        "provider" => provider.to_string(),
        "operation" => operation.to_string()
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_short_circuit(provider: &str, operation: &str) {
    metrics::counter!(
        "membership_circuit_short_circuits_total",
        "provider" => provider.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

pub fn record_circuit_transition(provider: &str, to_state: &str) {
    metrics::counter!(
        "membership_circuit_transitions_total",
        "provider" => provider.to_string(),
        "to" => to_state.to_string()
    )
    .increment(1);
}

pub fn record_membership_operation(action: &str, outcome: &str) {
    metrics::counter!(
        "membership_operations_total",
        "action" => action.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_retry_enqueued(provider: &str, action: &str) {
    metrics::counter!(
        "membership_retry_enqueued_total",
        "provider" => provider.to_string(),
        "action" => action.to_string()
    )
    .increment(1);
}

pub fn record_reconciliation_outcome(outcome: &str) {
    metrics::counter!(
        "membership_reconciliation_records_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
