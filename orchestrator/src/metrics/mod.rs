//! Prometheus metrics export
//!
//! Counters for slot claims, session renewals and container convergence.
//! Without an installed recorder every call below is a no-op.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

use crate::config::MetricsConfig;

/// Install the Prometheus recorder and its HTTP listener
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Invalid metrics listen address")?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("raftainer_pass_duration_seconds".to_string()),
            &[0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0],
        )
        .context("Invalid histogram buckets")?
        .install()
        .context("Failed to install Prometheus exporter")?;

    Ok(())
}

/// Record a slot claim attempt for a pod
pub fn record_slot_claim(pod: &str, acquired: bool) {
    let result = if acquired { "acquired" } else { "contended" };
    counter!("raftainer_slot_claims_total", "pod" => pod.to_string(), "result" => result).increment(1);
}

/// Record the outcome of one session renewal
pub fn record_session_renewal(success: bool) {
    let result = if success { "ok" } else { "failed" };
    counter!("raftainer_session_renewals_total", "result" => result).increment(1);
}

/// Record a container converged by the reconciler
pub fn record_container_reconciled(pod: &str, action: &'static str) {
    counter!("raftainer_containers_reconciled_total", "pod" => pod.to_string(), "action" => action).increment(1);
}

/// Record a container the reconciler failed to converge
pub fn record_container_failure(pod: &str) {
    counter!("raftainer_container_failures_total", "pod" => pod.to_string()).increment(1);
}

/// Record a finished orchestration pass
pub fn record_pass(duration_secs: f64, slots_held: usize) {
    histogram!("raftainer_pass_duration_seconds").record(duration_secs);
    gauge!("raftainer_slots_held").set(slots_held as f64);
}
