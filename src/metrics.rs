use prometheus::{IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Protocol metrics, registered on a per-instance registry so several
/// in-process participants never collide.
pub struct EtherealMetrics {
    pub registry: Registry,

    /// Units accepted into a DAG, local and remote.
    pub units_added: IntCounter,
    /// Pre-units rejected as structurally invalid.
    pub units_rejected: IntCounter,
    /// Pre-units waiting for absent parents.
    pub units_pending: IntGauge,
    /// Forks detected across all epochs.
    pub forks_detected: IntCounter,
    /// Pre-blocks emitted through the sink.
    pub preblocks_emitted: IntCounter,
    /// The epoch this process currently creates units in.
    pub current_epoch: IntGauge,
    /// Maximum DAG level of the current epoch.
    pub dag_level: IntGauge,
}

impl EtherealMetrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();

        let units_added =
            IntCounter::new("ethereal_units_added_total", "Units accepted into the DAG").unwrap();
        let units_rejected = IntCounter::new(
            "ethereal_units_rejected_total",
            "Structurally invalid pre-units",
        )
        .unwrap();
        let units_pending = IntGauge::new(
            "ethereal_units_pending",
            "Pre-units buffered for absent parents",
        )
        .unwrap();
        let forks_detected =
            IntCounter::new("ethereal_forks_detected_total", "Forking creators detected").unwrap();
        let preblocks_emitted =
            IntCounter::new("ethereal_preblocks_emitted_total", "Pre-blocks emitted").unwrap();
        let current_epoch =
            IntGauge::new("ethereal_current_epoch", "Epoch of unit production").unwrap();
        let dag_level =
            IntGauge::new("ethereal_dag_level", "Maximum level of the current DAG").unwrap();

        registry.register(Box::new(units_added.clone())).unwrap();
        registry.register(Box::new(units_rejected.clone())).unwrap();
        registry.register(Box::new(units_pending.clone())).unwrap();
        registry.register(Box::new(forks_detected.clone())).unwrap();
        registry
            .register(Box::new(preblocks_emitted.clone()))
            .unwrap();
        registry.register(Box::new(current_epoch.clone())).unwrap();
        registry.register(Box::new(dag_level.clone())).unwrap();

        Arc::new(Self {
            registry,
            units_added,
            units_rejected,
            units_pending,
            forks_detected,
            preblocks_emitted,
            current_epoch,
            dag_level,
        })
    }

    /// Encode all metrics into Prometheus text format.
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or(());
        String::from_utf8(buffer).unwrap_or_default()
    }
}
