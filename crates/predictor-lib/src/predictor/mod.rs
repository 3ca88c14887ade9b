//! Inference engine: feature extraction, model evaluation, health scoring
//! and the periodic cycle driving them

mod features;
mod inference;
mod scheduler;
mod scoring;

pub use features::{
    default_ranges, FeatureConfig, FeatureExtractor, FeatureSchema, FieldDefaults, ValidRange,
    FALLBACK_DEFAULT,
};
pub use inference::{
    LinearModel, LinkFunction, ModelArtifact, ModelMetadata, ModelRegistry, ModelSlot, OnnxModel,
};
pub use scheduler::{
    CycleOutcome, Scheduler, SchedulerBuilder, SchedulerConfig, SchedulerState, DEFAULT_INTERVAL,
    DEFAULT_PREDICT_TIMEOUT,
};
pub use scoring::{
    HealthAssessment, HealthScorer, RiskThresholds, ScoreWeights, ScoringConfig,
    MAX_HEALTH_SCORE,
};

use crate::error::PredictError;

/// A trained model evaluated on one ordered feature vector
pub trait Predictor: Send + Sync {
    /// Produce the model's scalar output for `features`
    fn predict(&self, features: &[f64]) -> Result<f64, PredictError>;

    /// Short name of the model format, used in logs
    fn kind(&self) -> &'static str;
}
