//! Metrics collection for observability
//!
//! The registry is owned by [`PipelineMetrics`] and injected into the
//! pipeline; nothing registers into the process-global default registry.
//!
//! # Metrics
//!
//! - `pipeline_events_total{family,outcome}` - Terminal outcomes
//! - `pipeline_retries_total{dependency}` - Attempts beyond the first
//! - `pipeline_dead_letters_total{family,emergency_level}` - Dead-lettered events
//! - `pipeline_sla_breaches_total{family}` - SLA breaches escalated
//! - `pipeline_circuit_state{dependency}` - 0 closed, 1 half-open, 2 open
//! - `pipeline_processing_duration_seconds{family}` - End-to-end latency
//! - `pipeline_ledger_entries` - Keys held by the idempotency ledger

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use resilience::CircuitState;
use std::sync::Arc;

/// Pipeline metrics
#[derive(Clone)]
pub struct PipelineMetrics {
    /// Terminal outcomes per family
    pub events_total: IntCounterVec,

    /// Retries per dependency
    pub retries_total: IntCounterVec,

    /// Dead letters per family and urgency
    pub dead_letters_total: IntCounterVec,

    /// SLA breaches per family
    pub sla_breaches_total: IntCounterVec,

    /// Circuit state per dependency
    pub circuit_state: IntGaugeVec,

    /// Processing latency per family
    pub processing_duration: HistogramVec,

    /// Ledger size
    pub ledger_entries: IntGauge,

    registry: Arc<Registry>,
}

impl PipelineMetrics {
    /// Create metrics registered into a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create metrics registered into `registry`
    pub fn with_registry(registry: Arc<Registry>) -> prometheus::Result<Self> {
        let events_total = IntCounterVec::new(
            Opts::new("pipeline_events_total", "Events reaching a terminal outcome"),
            &["family", "outcome"],
        )?;
        registry.register(Box::new(events_total.clone()))?;

        let retries_total = IntCounterVec::new(
            Opts::new("pipeline_retries_total", "Retry attempts beyond the first"),
            &["dependency"],
        )?;
        registry.register(Box::new(retries_total.clone()))?;

        let dead_letters_total = IntCounterVec::new(
            Opts::new("pipeline_dead_letters_total", "Events dead-lettered"),
            &["family", "emergency_level"],
        )?;
        registry.register(Box::new(dead_letters_total.clone()))?;

        let sla_breaches_total = IntCounterVec::new(
            Opts::new("pipeline_sla_breaches_total", "SLA breaches escalated"),
            &["family"],
        )?;
        registry.register(Box::new(sla_breaches_total.clone()))?;

        let circuit_state = IntGaugeVec::new(
            Opts::new(
                "pipeline_circuit_state",
                "Circuit breaker state (0 closed, 1 half-open, 2 open)",
            ),
            &["dependency"],
        )?;
        registry.register(Box::new(circuit_state.clone()))?;

        let processing_duration = HistogramVec::new(
            HistogramOpts::new(
                "pipeline_processing_duration_seconds",
                "End-to-end event processing latency",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0, 30.0]),
            &["family"],
        )?;
        registry.register(Box::new(processing_duration.clone()))?;

        let ledger_entries = IntGauge::new(
            "pipeline_ledger_entries",
            "Keys held by the idempotency ledger",
        )?;
        registry.register(Box::new(ledger_entries.clone()))?;

        Ok(Self {
            events_total,
            retries_total,
            dead_letters_total,
            sla_breaches_total,
            circuit_state,
            processing_duration,
            ledger_entries,
            registry,
        })
    }

    /// Record a terminal outcome
    pub fn record_outcome(&self, family: &str, outcome: &str, duration_seconds: f64) {
        self.events_total
            .with_label_values(&[family, outcome])
            .inc();
        self.processing_duration
            .with_label_values(&[family])
            .observe(duration_seconds);
    }

    /// Record retries made against a dependency
    pub fn record_retries(&self, dependency: &str, attempts: u32) {
        if attempts > 1 {
            self.retries_total
                .with_label_values(&[dependency])
                .inc_by(u64::from(attempts - 1));
        }
    }

    /// Record a dead letter
    pub fn record_dead_letter(&self, family: &str, emergency_level: &str) {
        self.dead_letters_total
            .with_label_values(&[family, emergency_level])
            .inc();
    }

    /// Record an SLA breach
    pub fn record_sla_breach(&self, family: &str) {
        self.sla_breaches_total.with_label_values(&[family]).inc();
    }

    /// Update circuit state gauge
    pub fn set_circuit_state(&self, dependency: &str, state: CircuitState) {
        self.circuit_state
            .with_label_values(&[dependency])
            .set(state.as_gauge());
    }

    /// Update ledger size gauge
    pub fn set_ledger_entries(&self, entries: usize) {
        self.ledger_entries.set(entries as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every metric
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Unregister every collector, so the registry can be reused
    pub fn teardown(&self) -> prometheus::Result<()> {
        self.registry.unregister(Box::new(self.events_total.clone()))?;
        self.registry.unregister(Box::new(self.retries_total.clone()))?;
        self.registry
            .unregister(Box::new(self.dead_letters_total.clone()))?;
        self.registry
            .unregister(Box::new(self.sla_breaches_total.clone()))?;
        self.registry.unregister(Box::new(self.circuit_state.clone()))?;
        self.registry
            .unregister(Box::new(self.processing_duration.clone()))?;
        self.registry.unregister(Box::new(self.ledger_entries.clone()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.record_outcome("alert", "processed", 0.02);
        metrics.record_retries("alert-service", 3);
        metrics.set_circuit_state("alert-service", CircuitState::Open);

        assert_eq!(
            metrics
                .events_total
                .with_label_values(&["alert", "processed"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .retries_total
                .with_label_values(&["alert-service"])
                .get(),
            2
        );

        let text = metrics.render().unwrap();
        assert!(text.contains("pipeline_events_total"));
        assert!(text.contains("pipeline_circuit_state{dependency=\"alert-service\"} 2"));
    }

    #[test]
    fn test_teardown_allows_reregistration() {
        let registry = Arc::new(Registry::new());
        let first = PipelineMetrics::with_registry(registry.clone()).unwrap();
        assert!(PipelineMetrics::with_registry(registry.clone()).is_err());

        first.teardown().unwrap();
        assert!(PipelineMetrics::with_registry(registry).is_ok());
    }
}
