//! Observability infrastructure for the live predictor
//!
//! Provides:
//! - Prometheus metrics (prediction counters, last-value gauges, latency, sink errors)
//! - Structured JSON logging with tracing

use crate::error::Stage;
use crate::models::PredictionResult;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Histogram buckets for cycle latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

struct PredictorMetricsInner {
    registry: Registry,
    predictions_emitted: IntCounter,
    last_rul_value: Gauge,
    last_failure_probability: Gauge,
    last_health_score: Gauge,
    prediction_latency_seconds: Histogram,
    db_query_errors: IntCounter,
    broker_publish_errors: IntCounter,
    cycle_failures: IntCounterVec,
    feature_substitutions: IntCounter,
    scheduler_ticks: IntCounter,
}

impl PredictorMetricsInner {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let predictions_emitted = IntCounter::new(
            "predictions_emitted_total",
            "Total number of predictions emitted",
        )?;
        let last_rul_value = Gauge::new("last_rul_value", "Latest RUL prediction value")?;
        let last_failure_probability = Gauge::new(
            "last_failure_probability",
            "Latest failure probability prediction",
        )?;
        let last_health_score = Gauge::new(
            "last_health_score",
            "Latest composite health score (0-100)",
        )?;
        let prediction_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "prediction_latency_seconds",
                "Time from reading telemetry to a scored prediction",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        let db_query_errors = IntCounter::new(
            "db_query_errors_total",
            "Total telemetry source query and write-back errors",
        )?;
        let broker_publish_errors = IntCounter::new(
            "broker_publish_errors_total",
            "Total publish/subscribe publish errors",
        )?;
        let cycle_failures = IntCounterVec::new(
            Opts::new("cycle_failures_total", "Failed inference cycles by stage"),
            &["stage"],
        )?;
        let feature_substitutions = IntCounter::new(
            "feature_substitutions_total",
            "Missing or out-of-range sensor values replaced by a default",
        )?;
        let scheduler_ticks =
            IntCounter::new("scheduler_ticks_total", "Total scheduler ticks executed")?;

        registry.register(Box::new(predictions_emitted.clone()))?;
        registry.register(Box::new(last_rul_value.clone()))?;
        registry.register(Box::new(last_failure_probability.clone()))?;
        registry.register(Box::new(last_health_score.clone()))?;
        registry.register(Box::new(prediction_latency_seconds.clone()))?;
        registry.register(Box::new(db_query_errors.clone()))?;
        registry.register(Box::new(broker_publish_errors.clone()))?;
        registry.register(Box::new(cycle_failures.clone()))?;
        registry.register(Box::new(feature_substitutions.clone()))?;
        registry.register(Box::new(scheduler_ticks.clone()))?;

        // Pre-create every stage so the series exist before the first failure
        for stage in Stage::ALL {
            cycle_failures.with_label_values(&[stage.as_str()]);
        }

        Ok(Self {
            registry,
            predictions_emitted,
            last_rul_value,
            last_failure_probability,
            last_health_score,
            prediction_latency_seconds,
            db_query_errors,
            broker_publish_errors,
            cycle_failures,
            feature_substitutions,
            scheduler_ticks,
        })
    }
}

/// Predictor metrics for Prometheus exposition
///
/// Each instance owns its registry. Clones share the same underlying metrics.
#[derive(Clone)]
pub struct PredictorMetrics {
    inner: Arc<PredictorMetricsInner>,
}

impl PredictorMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            inner: Arc::new(PredictorMetricsInner::new()?),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.inner.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Record an emitted prediction: counter, last-value gauges and latency
    pub fn record_prediction(&self, result: &PredictionResult) {
        self.inner.predictions_emitted.inc();
        self.inner.last_rul_value.set(result.rul);
        self.inner
            .last_failure_probability
            .set(result.failure_probability);
        self.inner.last_health_score.set(result.health_score);
        self.inner
            .prediction_latency_seconds
            .observe(result.latency_seconds);
    }

    pub fn inc_db_errors(&self) {
        self.inner.db_query_errors.inc();
    }

    pub fn inc_broker_errors(&self) {
        self.inner.broker_publish_errors.inc();
    }

    pub fn inc_cycle_failure(&self, stage: Stage) {
        self.inner
            .cycle_failures
            .with_label_values(&[stage.as_str()])
            .inc();
    }

    pub fn add_feature_substitutions(&self, count: u64) {
        self.inner.feature_substitutions.inc_by(count);
    }

    pub fn inc_ticks(&self) {
        self.inner.scheduler_ticks.inc();
    }

    pub fn predictions_emitted(&self) -> u64 {
        self.inner.predictions_emitted.get()
    }

    pub fn last_rul_value(&self) -> f64 {
        self.inner.last_rul_value.get()
    }

    pub fn last_failure_probability(&self) -> f64 {
        self.inner.last_failure_probability.get()
    }

    pub fn db_query_errors(&self) -> u64 {
        self.inner.db_query_errors.get()
    }

    pub fn broker_publish_errors(&self) -> u64 {
        self.inner.broker_publish_errors.get()
    }

    pub fn cycle_failures(&self, stage: Stage) -> u64 {
        self.inner
            .cycle_failures
            .with_label_values(&[stage.as_str()])
            .get()
    }

    pub fn feature_substitutions(&self) -> u64 {
        self.inner.feature_substitutions.get()
    }

    pub fn latency_samples(&self) -> u64 {
        self.inner.prediction_latency_seconds.get_sample_count()
    }

    pub fn ticks(&self) -> u64 {
        self.inner.scheduler_ticks.get()
    }
}

/// Structured logger for predictor events
///
/// Provides consistent JSON-formatted logging for predictions, cycle
/// failures and lifecycle events.
#[derive(Clone)]
pub struct StructuredLogger {
    device: String,
}

impl StructuredLogger {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }

    pub fn log_prediction(&self, result: &PredictionResult) {
        info!(
            event = "prediction_generated",
            device = %self.device,
            ts = %result.ts,
            rul = result.rul,
            failure_probability = result.failure_probability,
            health_score = result.health_score,
            risk = %result.risk_category,
            latency_ms = result.latency_seconds * 1000.0,
            "Predictions - RUL: {:.1} cycles, failure probability: {:.3}",
            result.rul,
            result.failure_probability
        );
    }

    pub fn log_cycle_failure(&self, stage: Stage, error: &dyn std::error::Error) {
        warn!(
            event = "cycle_failed",
            device = %self.device,
            stage = %stage,
            error = %error,
            "Inference cycle failed"
        );
    }

    pub fn log_sink_failure(&self, sink: &str, error: &dyn std::error::Error) {
        warn!(
            event = "sink_failed",
            device = %self.device,
            sink = %sink,
            error = %error,
            "Result sink failed, continuing with remaining sinks"
        );
    }

    pub fn log_models_loaded(&self, rul_checksum: &str, failure_checksum: &str) {
        info!(
            event = "models_loaded",
            device = %self.device,
            rul_checksum = %rul_checksum,
            failure_checksum = %failure_checksum,
            "Models loaded"
        );
    }

    pub fn log_startup(&self, version: &str, interval_secs: f64, write_back: bool) {
        info!(
            event = "predictor_started",
            device = %self.device,
            version = %version,
            interval_secs = interval_secs,
            write_back = write_back,
            "Live predictor started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "predictor_shutdown",
            device = %self.device,
            reason = %reason,
            "Live predictor shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RiskCategory;
    use chrono::Utc;

    fn result(rul: f64, p: f64) -> PredictionResult {
        PredictionResult {
            ts: Utc::now(),
            rul,
            failure_probability: p,
            health_score: 80.0,
            risk_category: RiskCategory::Low,
            latency_seconds: 0.02,
        }
    }

    #[test]
    fn test_fresh_registry_per_instance() {
        let a = PredictorMetrics::new().unwrap();
        let b = PredictorMetrics::new().unwrap();
        a.inc_db_errors();
        assert_eq!(a.db_query_errors(), 1);
        assert_eq!(b.db_query_errors(), 0);
    }

    #[test]
    fn test_gauges_are_last_write_wins() {
        let metrics = PredictorMetrics::new().unwrap();
        metrics.record_prediction(&result(650.0, 0.05));
        metrics.record_prediction(&result(420.0, 0.30));
        assert_eq!(metrics.predictions_emitted(), 2);
        assert_eq!(metrics.last_rul_value(), 420.0);
        assert_eq!(metrics.last_failure_probability(), 0.30);
        assert_eq!(metrics.latency_samples(), 2);
    }

    #[test]
    fn test_exposition_contains_required_series() {
        let metrics = PredictorMetrics::new().unwrap();
        metrics.record_prediction(&result(650.0, 0.05));
        metrics.inc_cycle_failure(Stage::Read);
        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        for name in [
            "predictions_emitted_total",
            "last_rul_value",
            "last_failure_probability",
            "prediction_latency_seconds",
            "db_query_errors_total",
            "broker_publish_errors_total",
            "cycle_failures_total{stage=\"read\"} 1",
        ] {
            assert!(text.contains(name), "missing {} in\n{}", name, text);
        }
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("ev-001");
        assert_eq!(logger.device, "ev-001");
    }
}
