//! Inference cycle scheduling
//!
//! One tick runs read → extract → predict → score → publish as a single
//! unit of work. Failures are classified by stage, counted and logged, and
//! the loop moves on to the next tick after the configured interval. Only a
//! dimension mismatch between extractor and model stops the loop.

use super::{FeatureExtractor, HealthScorer, ModelArtifact, ModelRegistry, ScoringConfig};
use crate::error::{CycleError, PredictError, Stage};
use crate::health::{components, HealthRegistry};
use crate::models::{FeatureVector, ModelOutputs, PredictionResult};
use crate::observability::{PredictorMetrics, StructuredLogger};
use crate::publish::{PublishOutcome, ResultPublisher};
use crate::source::SourceReader;
use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Default pause between ticks
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Default bound on one model evaluation
pub const DEFAULT_PREDICT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between the end of one cycle and the start of the next
    pub interval: Duration,
    pub predict_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            predict_timeout: DEFAULT_PREDICT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Constructed, no tick run yet
    Idle,
    Running,
    Sleeping,
    Stopping,
}

/// Result of one tick
#[derive(Debug)]
pub enum CycleOutcome {
    Success {
        result: PredictionResult,
        publish: PublishOutcome,
    },
    Failure(CycleError),
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Success { .. })
    }

    /// Stage that failed, if any
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            CycleOutcome::Success { .. } => None,
            CycleOutcome::Failure(e) => Some(e.stage()),
        }
    }
}

pub struct Scheduler {
    reader: Arc<SourceReader>,
    extractor: FeatureExtractor,
    models: ModelRegistry,
    scorer: HealthScorer,
    publisher: ResultPublisher,
    metrics: PredictorMetrics,
    health: HealthRegistry,
    logger: StructuredLogger,
    config: SchedulerConfig,
    state: watch::Sender<SchedulerState>,
    ticks: AtomicU64,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Ticks executed so far
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run ticks until `shutdown` fires. A cycle in progress always finishes.
    ///
    /// Returns an error only for a fatal cycle failure.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), CycleError> {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            write_back = self.publisher.write_back_enabled(),
            "Starting inference scheduler"
        );

        loop {
            if shutdown_requested(&mut shutdown) {
                break;
            }

            self.state.send_replace(SchedulerState::Running);
            if let CycleOutcome::Failure(e) = self.tick().await {
                if e.is_fatal() {
                    error!(stage = %e.stage(), error = %e, "Fatal cycle failure, stopping scheduler");
                    self.health
                        .set_unhealthy(components::SCHEDULER, e.to_string())
                        .await;
                    self.state.send_replace(SchedulerState::Stopping);
                    return Err(e);
                }
            }

            self.state.send_replace(SchedulerState::Sleeping);
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.recv() => break,
            }
        }

        info!(ticks = self.ticks(), "Stopping inference scheduler");
        self.state.send_replace(SchedulerState::Stopping);
        Ok(())
    }

    /// Execute one tick and account for it
    pub async fn tick(&self) -> CycleOutcome {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        self.metrics.inc_ticks();
        let outcome = self.run_cycle().await;
        if let CycleOutcome::Failure(e) = &outcome {
            self.record_failure(e);
        }
        outcome
    }

    /// The read → extract → predict → score → publish pipeline
    pub async fn run_cycle(&self) -> CycleOutcome {
        match self.compute().await {
            Ok(result) => {
                self.logger.log_prediction(&result);
                let publish = self.publisher.publish(&result).await;
                if !publish.all_ok() {
                    debug!(?publish, "Prediction published with sink failures");
                }
                self.health.record_success(components::SCHEDULER).await;
                CycleOutcome::Success { result, publish }
            }
            Err(e) => CycleOutcome::Failure(e),
        }
    }

    async fn compute(&self) -> Result<PredictionResult, CycleError> {
        let start = Instant::now();

        let record = self.reader.fetch_latest().await?;

        let rul_model = self.models.rul();
        let failure_model = self.models.failure();
        let rul_features = self.extractor.build(&record, rul_model.schema())?;
        let failure_features = self.extractor.build(&record, failure_model.schema())?;
        self.report_substitutions(&rul_features, &failure_features);

        let (rul, failure_probability) = tokio::join!(
            self.predict(rul_model.clone(), rul_features),
            self.predict(failure_model.clone(), failure_features),
        );
        let outputs = ModelOutputs {
            rul: rul.map_err(|source| CycleError::Predict {
                model: "rul",
                source,
            })?,
            failure_probability: failure_probability.map_err(|source| CycleError::Predict {
                model: "failure",
                source,
            })?,
        };

        let assessment = self.scorer.score(&record, &outputs);

        Ok(PredictionResult {
            ts: record.ts,
            rul: outputs.rul,
            failure_probability: outputs.failure_probability,
            health_score: assessment.health_score,
            risk_category: assessment.risk_category,
            latency_seconds: start.elapsed().as_secs_f64(),
        })
    }

    /// Evaluate one model off the async workers, bounded by the predict timeout
    async fn predict(
        &self,
        model: Arc<ModelArtifact>,
        features: FeatureVector,
    ) -> Result<f64, PredictError> {
        let limit = self.config.predict_timeout;
        let task = tokio::task::spawn_blocking(move || model.predict(&features));
        match timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(PredictError::Inference(join_error.to_string())),
            Err(_) => Err(PredictError::Timeout(limit)),
        }
    }

    fn report_substitutions(&self, rul: &FeatureVector, failure: &FeatureVector) {
        let fields: BTreeSet<&str> = rul
            .substituted
            .iter()
            .chain(&failure.substituted)
            .map(String::as_str)
            .collect();
        if fields.is_empty() {
            return;
        }
        self.metrics.add_feature_substitutions(fields.len() as u64);
        warn!(
            fields = ?fields,
            "Substituted defaults for missing or out-of-range telemetry"
        );
    }

    fn record_failure(&self, error: &CycleError) {
        if error.is_silent() {
            debug!("No telemetry available, skipping cycle");
            return;
        }
        let stage = error.stage();
        self.metrics.inc_cycle_failure(stage);
        self.logger.log_cycle_failure(stage, error);
    }
}

fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    !matches!(
        shutdown.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    )
}

/// Builder for the scheduler
pub struct SchedulerBuilder {
    reader: Option<Arc<SourceReader>>,
    models: Option<ModelRegistry>,
    publisher: Option<ResultPublisher>,
    metrics: Option<PredictorMetrics>,
    health: Option<HealthRegistry>,
    logger: Option<StructuredLogger>,
    extractor: FeatureExtractor,
    scoring: ScoringConfig,
    config: SchedulerConfig,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            reader: None,
            models: None,
            publisher: None,
            metrics: None,
            health: None,
            logger: None,
            extractor: FeatureExtractor::default(),
            scoring: ScoringConfig::default(),
            config: SchedulerConfig::default(),
        }
    }

    pub fn reader(mut self, reader: Arc<SourceReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn models(mut self, models: ModelRegistry) -> Self {
        self.models = Some(models);
        self
    }

    pub fn publisher(mut self, publisher: ResultPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn metrics(mut self, metrics: PredictorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn extractor(mut self, extractor: FeatureExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn scoring(mut self, scoring: ScoringConfig) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn predict_timeout(mut self, predict_timeout: Duration) -> Self {
        self.config.predict_timeout = predict_timeout;
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        let reader = self
            .reader
            .ok_or_else(|| anyhow::anyhow!("Source reader is required"))?;
        let models = self
            .models
            .ok_or_else(|| anyhow::anyhow!("Model registry is required"))?;
        let publisher = self
            .publisher
            .ok_or_else(|| anyhow::anyhow!("Result publisher is required"))?;
        let metrics = self
            .metrics
            .ok_or_else(|| anyhow::anyhow!("Metrics are required"))?;
        if self.config.interval.is_zero() {
            anyhow::bail!("Scheduler interval must be positive");
        }

        // Scoring falls back to the same per-field defaults the failure model uses
        let scorer = HealthScorer::new(
            self.scoring,
            models.failure().schema().defaults().clone(),
        )
        .with_ranges(self.extractor.ranges().clone());
        let (state, _) = watch::channel(SchedulerState::Idle);

        Ok(Scheduler {
            reader,
            extractor: self.extractor,
            models,
            scorer,
            publisher,
            metrics,
            health: self.health.unwrap_or_default(),
            logger: self
                .logger
                .unwrap_or_else(|| StructuredLogger::new("default")),
            config: self.config,
            state,
            ticks: AtomicU64::new(0),
        })
    }
}
