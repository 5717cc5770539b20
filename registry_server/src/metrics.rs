//! Prometheus metrics for registry observability.

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a reconciliation by outcome (`ok`, `upstream_error`, `timeout`).
pub fn reconciled(outcome: &str) {
    counter!("registry_reconcile_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn reconcile_duration(duration_ms: u64) {
    histogram!("registry_reconcile_duration_ms").record(duration_ms as f64);
}

pub fn artifacts_expired() {
    counter!("registry_artifacts_expired_total").increment(1);
}

pub fn artifact_delete_failed() {
    counter!("registry_artifact_delete_failures_total").increment(1);
}

/// Record a completed upload of `files` files.
pub fn upload_received(files: usize) {
    counter!("registry_uploads_total").increment(1);
    counter!("registry_uploaded_files_total").increment(files as u64);
}

pub fn auth_failed(reason: &str) {
    counter!("registry_auth_failures_total", "reason" => reason.to_string()).increment(1);
}

/// Set current known repository count.
pub fn repositories(count: usize) {
    gauge!("registry_repositories").set(count as f64);
}
