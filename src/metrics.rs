//! Prometheus metrics for the coordination layer
//!
//! Collectors live in the default registry and are exported at `GET /metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Encoder, Gauge,
    GaugeVec, TextEncoder,
};

lazy_static! {
    /// Gauge: tasks per agent list (`queued`, `processing`)
    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "agentmesh_queue_depth",
        "Tasks in an agent's queue or processing buffer",
        &["agent_id", "list"]
    )
    .expect("Failed to create queue_depth metric");

    /// Gauge: urgent lane depth
    pub static ref URGENT_QUEUE_DEPTH: Gauge = register_gauge!(
        "agentmesh_urgent_queue_depth",
        "Tasks waiting in the urgent queue"
    )
    .expect("Failed to create urgent_queue_depth metric");

    /// Counter: queue operations by outcome
    pub static ref QUEUE_OPERATIONS: CounterVec = register_counter_vec!(
        "agentmesh_queue_operations_total",
        "Queue operations by kind",
        &["operation"]
    )
    .expect("Failed to create queue_operations metric");

    /// Counter: deliveries by path and outcome
    pub static ref DELIVERIES: CounterVec = register_counter_vec!(
        "agentmesh_deliveries_total",
        "Message deliveries by path (pubsub, stream) and outcome",
        &["path", "outcome"]
    )
    .expect("Failed to create deliveries metric");

    /// Gauge: breaker state (0 = closed, 1 = half-open, 2 = open)
    pub static ref BREAKER_STATE: GaugeVec = register_gauge_vec!(
        "agentmesh_breaker_state",
        "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)",
        &["name"]
    )
    .expect("Failed to create breaker_state metric");

    /// Counter: breaker-wrapped calls by outcome
    pub static ref BREAKER_CALLS: CounterVec = register_counter_vec!(
        "agentmesh_breaker_calls_total",
        "Circuit breaker calls by outcome",
        &["name", "outcome"]
    )
    .expect("Failed to create breaker_calls metric");

    /// Counter: rate limit rejections
    pub static ref RATE_LIMIT_REJECTIONS: CounterVec = register_counter_vec!(
        "agentmesh_rate_limit_rejections_total",
        "Requests rejected by a fixed-window limit",
        &["limiter"]
    )
    .expect("Failed to create rate_limit_rejections metric");

    /// Counter: lock acquisition attempts that found the lock held
    pub static ref LOCK_CONTENTION: CounterVec = register_counter_vec!(
        "agentmesh_lock_contention_total",
        "Lock acquisitions that found the key already held",
        &["kind"]
    )
    .expect("Failed to create lock_contention metric");

    /// Counter: decisions resolved by tier and outcome
    pub static ref DECISIONS_RESOLVED: CounterVec = register_counter_vec!(
        "agentmesh_decisions_resolved_total",
        "Decisions leaving pending, by tier and resulting status",
        &["tier", "status"]
    )
    .expect("Failed to create decisions_resolved metric");

    /// Counter: escalation transitions
    pub static ref ESCALATIONS: CounterVec = register_counter_vec!(
        "agentmesh_escalations_total",
        "Escalations by status reached",
        &["status"]
    )
    .expect("Failed to create escalations metric");

    /// Counter: sweep cycles by status
    pub static ref SWEEP_CYCLES: CounterVec = register_counter_vec!(
        "agentmesh_sweep_cycles_total",
        "Decision timeout sweeps by status",
        &["status"]
    )
    .expect("Failed to create sweep_cycles metric");
}

pub fn set_queue_depth(agent_id: &str, queued: i64, processing: i64) {
    QUEUE_DEPTH
        .with_label_values(&[agent_id, "queued"])
        .set(queued as f64);
    QUEUE_DEPTH
        .with_label_values(&[agent_id, "processing"])
        .set(processing as f64);
}

pub fn set_urgent_depth(depth: i64) {
    URGENT_QUEUE_DEPTH.set(depth as f64);
}

pub fn record_queue_operation(operation: &str, count: u64) {
    QUEUE_OPERATIONS
        .with_label_values(&[operation])
        .inc_by(count as f64);
}

pub fn record_delivery(path: &str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    DELIVERIES.with_label_values(&[path, outcome]).inc();
}

pub fn set_breaker_state(name: &str, level: u8) {
    BREAKER_STATE.with_label_values(&[name]).set(f64::from(level));
}

pub fn record_breaker_call(name: &str, outcome: &str) {
    BREAKER_CALLS.with_label_values(&[name, outcome]).inc();
}

pub fn record_rate_limit_rejection(limiter: &str) {
    RATE_LIMIT_REJECTIONS.with_label_values(&[limiter]).inc();
}

pub fn record_lock_contention(kind: &str) {
    LOCK_CONTENTION.with_label_values(&[kind]).inc();
}

pub fn record_decision_resolved(tier: &str, status: &str) {
    DECISIONS_RESOLVED.with_label_values(&[tier, status]).inc();
}

pub fn record_escalation(status: &str) {
    ESCALATIONS.with_label_values(&[status]).inc();
}

pub fn record_sweep(status: &str) {
    SWEEP_CYCLES.with_label_values(&[status]).inc();
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_exported() {
        set_queue_depth("metrics-test", 3, 1);
        record_breaker_call("metrics-test", "success");
        record_delivery("stream", true);

        let output = encode_metrics();
        assert!(output.contains("agentmesh_queue_depth"));
        assert!(output.contains("agent_id=\"metrics-test\""));
        assert!(output.contains("agentmesh_breaker_calls_total"));
        assert!(output.contains("agentmesh_deliveries_total"));
    }
}
