use lazy_static::lazy_static;
use prometheus::{IntCounterVec, Opts, Registry};

lazy_static! {
    pub static ref PROMETHEUS_REGISTRY: Registry = Registry::new();
    pub static ref RECONCILES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "maintenance_reconciles_total",
            "Total number of NodeMaintenance reconciles, by resulting phase"
        ),
        &["phase"]
    )
    .unwrap();
    pub static ref PODS_EVICTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pods_evicted_total", "Total number of pods drained from nodes"),
        &["node"]
    )
    .unwrap();
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("maintenance_errors_total", "Total number of errors"),
        &["kind", "reason"]
    )
    .unwrap();
}

/// Initialize Prometheus metrics
pub fn init_metrics() {
    PROMETHEUS_REGISTRY
        .register(Box::new(RECONCILES_TOTAL.clone()))
        .ok();
    PROMETHEUS_REGISTRY
        .register(Box::new(PODS_EVICTED_TOTAL.clone()))
        .ok();
    PROMETHEUS_REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .ok();
}
