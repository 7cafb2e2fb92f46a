//! Prometheus metrics for reconfiguration and rebuild

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_int_gauge, CounterVec, Encoder, IntGauge, Opts, TextEncoder,
};

lazy_static! {
    pub static ref RECONFIGURATIONS_TOTAL: CounterVec = register_counter_vec!(
        Opts::new("ruvector_failover_reconfigurations_total", "Reconfigurations started"),
        &["kind"]
    ).unwrap();

    pub static ref QUORUM_LOSS_TOTAL: CounterVec = register_counter_vec!(
        Opts::new("ruvector_failover_quorum_loss_total", "Quorum loss transitions"),
        &["event"]
    ).unwrap();

    pub static ref DATA_LOSS_TOTAL: CounterVec = register_counter_vec!(
        Opts::new("ruvector_failover_data_loss_total", "Data loss epochs observed"),
        &["partition_kind"]
    ).unwrap();

    pub static ref REBUILD_RESTARTS_TOTAL: CounterVec = register_counter_vec!(
        Opts::new("ruvector_rebuild_restarts_total", "Rebuild restarts from proposing"),
        &["role", "reason"]
    ).unwrap();

    pub static ref GENERATION_REJECTS_TOTAL: CounterVec = register_counter_vec!(
        Opts::new("ruvector_generation_rejects_total", "Generation messages rejected as stale"),
        &["message"]
    ).unwrap();

    pub static ref REBUILD_PENDING_NODES: IntGauge = register_int_gauge!(
        Opts::new("ruvector_rebuild_pending_nodes", "Nodes whose failover unit upload is outstanding")
    ).unwrap();
}

/// Helper struct for recording metrics
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Record a reconfiguration of the given kind
    pub fn record_reconfiguration(kind: &str) {
        RECONFIGURATIONS_TOTAL.with_label_values(&[kind]).inc();
    }

    /// Record entering (`true`) or leaving (`false`) quorum loss
    pub fn record_quorum_loss(entered: bool) {
        let event = if entered { "lost" } else { "restored" };
        QUORUM_LOSS_TOTAL.with_label_values(&[event]).inc();
    }

    pub fn record_data_loss(is_bootstrap: bool) {
        let kind = if is_bootstrap { "bootstrap" } else { "user" };
        DATA_LOSS_TOTAL.with_label_values(&[kind]).inc();
    }

    pub fn record_rebuild_restart(role: &str, reason: &str) {
        REBUILD_RESTARTS_TOTAL.with_label_values(&[role, reason]).inc();
    }

    pub fn record_generation_reject(message: &str) {
        GENERATION_REJECTS_TOTAL.with_label_values(&[message]).inc();
    }

    pub fn set_rebuild_pending_nodes(count: usize) {
        REBUILD_PENDING_NODES.set(count as i64);
    }
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
