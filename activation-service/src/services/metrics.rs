//! Metrics for activation-service, exported in Prometheus text format.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use crate::models::{AuditEventType, FailureReason};

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Call once at startup.
pub fn init_metrics() -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    METRICS_HANDLE
        .set(handle)
        .map_err(|_| anyhow::anyhow!("Metrics handle already initialized"))
}

/// Get metrics output in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

/// `outcome` is `success` or a failure reason.
pub fn record_validation(reason: Option<FailureReason>) {
    let outcome = reason.map_or("success", |r| r.as_str());
    counter!("activation_validations_total", "outcome" => outcome).increment(1);
}

pub fn record_code_generated() {
    counter!("activation_codes_generated_total").increment(1);
}

pub fn record_code_locked() {
    counter!("activation_codes_locked_total").increment(1);
}

pub fn record_codes_expired(count: u64) {
    counter!("activation_codes_expired_total").increment(count);
}

pub fn record_audit_write_failure(event_type: AuditEventType) {
    counter!("activation_audit_write_failures_total", "event_type" => event_type.as_str())
        .increment(1);
}

/// Records `activation_db_query_duration_seconds{operation}` when dropped.
pub struct QueryTimer {
    operation: &'static str,
    start: Instant,
}

impl QueryTimer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for QueryTimer {
    fn drop(&mut self) {
        histogram!("activation_db_query_duration_seconds", "operation" => self.operation)
            .record(self.start.elapsed().as_secs_f64());
    }
}
