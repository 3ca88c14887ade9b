//! Composite health scoring
//!
//! Combines battery condition with the failure model output into a bounded
//! score and a discrete risk category. Pure computation, no I/O.

use super::features::{default_ranges, FieldDefaults, ValidRange};
use crate::models::{ModelOutputs, RiskCategory, TelemetryRecord};
use serde::Deserialize;
use std::collections::HashMap;

/// Upper bound of the health score
pub const MAX_HEALTH_SCORE: f64 = 100.0;

/// Weights of the health score components. Normalised by their sum.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub soh: f64,
    pub soc: f64,
    pub reliability: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            soh: 0.5,
            soc: 0.2,
            reliability: 0.3,
        }
    }
}

impl ScoreWeights {
    pub fn validate(&self) -> Result<(), String> {
        let weights = [self.soh, self.soc, self.reliability];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err("score weights must be finite and non-negative".to_string());
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err("score weights must have a positive sum".to_string());
        }
        Ok(())
    }
}

/// Risk thresholds, evaluated from most to least severe
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    pub critical_probability: f64,
    pub critical_score: f64,
    pub high_probability: f64,
    pub high_score: f64,
    pub medium_probability: f64,
    pub medium_score: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            critical_probability: 0.8,
            critical_score: 20.0,
            high_probability: 0.5,
            high_score: 40.0,
            medium_probability: 0.2,
            medium_score: 70.0,
        }
    }
}

impl RiskThresholds {
    /// Map a score and probability to a category. First match wins.
    pub fn categorize(&self, health_score: f64, failure_probability: f64) -> RiskCategory {
        if failure_probability >= self.critical_probability || health_score < self.critical_score
        {
            RiskCategory::Critical
        } else if failure_probability >= self.high_probability || health_score < self.high_score
        {
            RiskCategory::High
        } else if failure_probability >= self.medium_probability
            || health_score < self.medium_score
        {
            RiskCategory::Medium
        } else {
            RiskCategory::Low
        }
    }
}

/// Health scoring policy
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoreWeights,
    pub thresholds: RiskThresholds,
    /// Battery temperature above which the score is penalised (°C)
    pub temperature_penalty_threshold: f64,
    /// Points removed per degree above the threshold
    pub temperature_penalty_per_degree: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            thresholds: RiskThresholds::default(),
            temperature_penalty_threshold: 45.0,
            temperature_penalty_per_degree: 2.0,
        }
    }
}

/// Score and category for one prediction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthAssessment {
    pub health_score: f64,
    pub risk_category: RiskCategory,
}

/// Computes the composite health index
#[derive(Debug, Clone)]
pub struct HealthScorer {
    config: ScoringConfig,
    defaults: FieldDefaults,
    ranges: HashMap<String, ValidRange>,
}

impl HealthScorer {
    /// `defaults` fills soh, soc and temperature when the record lacks them
    /// or carries a value outside its valid range
    pub fn new(config: ScoringConfig, defaults: FieldDefaults) -> Self {
        Self {
            config,
            defaults,
            ranges: default_ranges(),
        }
    }

    /// Use the same range table as the feature extractor
    pub fn with_ranges(mut self, ranges: HashMap<String, ValidRange>) -> Self {
        self.ranges = ranges;
        self
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn score(&self, record: &TelemetryRecord, outputs: &ModelOutputs) -> HealthAssessment {
        let soh = self.value_or_default(record, "soh");
        let soc = self.value_or_default(record, "soc");
        let temperature = self.value_or_default(record, "battery_temperature");
        let probability = outputs.failure_probability.clamp(0.0, 1.0);

        let w = &self.config.weights;
        let total = w.soh + w.soc + w.reliability;
        let weighted = if total > 0.0 {
            (w.soh * soh + w.soc * soc + w.reliability * (1.0 - probability) * MAX_HEALTH_SCORE)
                / total
        } else {
            0.0
        };

        let excess = temperature - self.config.temperature_penalty_threshold;
        let penalty = if excess > 0.0 {
            excess * self.config.temperature_penalty_per_degree
        } else {
            0.0
        };

        let health_score = clip_score(weighted - penalty);
        HealthAssessment {
            health_score,
            risk_category: self.config.thresholds.categorize(health_score, probability),
        }
    }

    fn value_or_default(&self, record: &TelemetryRecord, name: &str) -> f64 {
        record
            .field(name)
            .filter(|v| v.is_finite())
            .filter(|v| self.ranges.get(name).map_or(true, |r| r.contains(*v)))
            .unwrap_or_else(|| self.defaults.get(name))
    }
}

fn clip_score(score: f64) -> f64 {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, MAX_HEALTH_SCORE)
}
