//! Prometheus metrics module
//!
//! Recording goes through the `metrics` facade and is a no-op until
//! [`install`] registers the Prometheus recorder, so library code and tests
//! never depend on a global exporter.

use crate::error::ErrorKind;
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and register metric descriptions
pub fn install() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(handle)
}

/// Register metric descriptions
fn register_metrics() {
    describe_counter!(
        "gateway_admissions_total",
        Unit::Count,
        "Sessions admitted by a concurrency bucket"
    );
    describe_counter!(
        "gateway_admission_requeues_total",
        Unit::Count,
        "Connect nodes re-queued after a failed run"
    );
    describe_counter!(
        "gateway_discovery_attempts_total",
        Unit::Count,
        "Requests sent to the gateway discovery endpoint"
    );
    describe_counter!(
        "gateway_errors_total",
        Unit::Count,
        "Orchestrator errors by type"
    );
    describe_gauge!(
        "gateway_pending_shards",
        Unit::Count,
        "Shard ids waiting for a session to be built"
    );
    describe_gauge!(
        "gateway_active_shards",
        Unit::Count,
        "Shards with a live session handle"
    );
    describe_gauge!(
        "gateway_shards_ready",
        Unit::Count,
        "Number of shards in ready state"
    );
}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Auth => "auth",
        ErrorKind::Config => "config",
        ErrorKind::TransientNetwork => "transient_network",
        ErrorKind::RateLimited => "rate_limited",
        ErrorKind::Interrupted => "interrupted",
        ErrorKind::Other => "other",
    }
}

/// Record a successful bucket admission
pub fn record_admission(bucket: u32) {
    counter!("gateway_admissions_total", "bucket" => bucket.to_string()).increment(1);
}

/// Record a connect node put back into its bucket
pub fn record_requeue(bucket: u32, kind: ErrorKind) {
    counter!(
        "gateway_admission_requeues_total",
        "bucket" => bucket.to_string(),
        "kind" => kind_label(kind)
    )
    .increment(1);
}

pub fn record_discovery_attempt() {
    counter!("gateway_discovery_attempts_total").increment(1);
}

/// Record an orchestrator error
pub fn record_error(error_type: &'static str) {
    counter!("gateway_errors_total", "error_type" => error_type).increment(1);
}

pub fn set_pending_shards(count: usize) {
    gauge!("gateway_pending_shards").set(count as f64);
}

pub fn set_active_shards(count: usize) {
    gauge!("gateway_active_shards").set(count as f64);
}

pub fn set_shards_ready(count: usize) {
    gauge!("gateway_shards_ready").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_noop() {
        record_admission(0);
        record_requeue(1, ErrorKind::TransientNetwork);
        record_discovery_attempt();
        record_error("config");
        set_pending_shards(3);
    }

    #[test]
    fn kind_labels_are_distinct() {
        let mut labels: Vec<_> = [
            ErrorKind::Auth,
            ErrorKind::Config,
            ErrorKind::TransientNetwork,
            ErrorKind::RateLimited,
            ErrorKind::Interrupted,
            ErrorKind::Other,
        ]
        .into_iter()
        .map(kind_label)
        .collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), 6);
    }
}
