//! Core data models for the live predictor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sensor fields carried by a telemetry row, in the order the models were trained on
pub const TELEMETRY_FIELDS: [&str; 10] = [
    "soc",
    "soh",
    "battery_voltage",
    "battery_current",
    "battery_temperature",
    "motor_temperature",
    "motor_vibration",
    "power_consumption",
    "driving_speed",
    "distance_traveled",
];

/// Most recent reading for a device, as stored by the telemetry source.
///
/// Every sensor field is optional; the timestamp is not.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub ts: DateTime<Utc>,
    pub soc: Option<f64>,
    pub soh: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub battery_current: Option<f64>,
    pub battery_temperature: Option<f64>,
    pub motor_temperature: Option<f64>,
    pub motor_vibration: Option<f64>,
    pub power_consumption: Option<f64>,
    pub driving_speed: Option<f64>,
    pub distance_traveled: Option<f64>,
}

impl TelemetryRecord {
    /// Create a record with only the timestamp set
    pub fn empty(ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            ..Default::default()
        }
    }

    /// Look up a sensor value by its column name
    pub fn field(&self, name: &str) -> Option<f64> {
        match name {
            "soc" => self.soc,
            "soh" => self.soh,
            "battery_voltage" => self.battery_voltage,
            "battery_current" => self.battery_current,
            "battery_temperature" => self.battery_temperature,
            "motor_temperature" => self.motor_temperature,
            "motor_vibration" => self.motor_vibration,
            "power_consumption" => self.power_consumption,
            "driving_speed" => self.driving_speed,
            "distance_traveled" => self.distance_traveled,
            _ => None,
        }
    }

    /// Whether `name` is a sensor column this record can carry
    pub fn is_known_field(name: &str) -> bool {
        TELEMETRY_FIELDS.contains(&name)
    }
}

/// Ordered model input built from a single telemetry record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub values: Vec<f64>,
    /// Fields whose value was missing or out of range and replaced by a default
    pub substituted: Vec<String>,
}

impl FeatureVector {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        !self.substituted.is_empty()
    }
}

/// Raw outputs of the two models for one cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelOutputs {
    pub rul: f64,
    pub failure_probability: f64,
}

/// Discrete risk level derived from the health score and failure probability
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskCategory {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskCategory::Low => "LOW",
            RiskCategory::Medium => "MEDIUM",
            RiskCategory::High => "HIGH",
            RiskCategory::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one successful inference cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub ts: DateTime<Utc>,
    pub rul: f64,
    pub failure_probability: f64,
    pub health_score: f64,
    pub risk_category: RiskCategory,
    pub latency_seconds: f64,
}

/// Flat message published to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionMessage {
    pub ts: String,
    pub rul: f64,
    pub failure_probability: f64,
    pub risk_category: RiskCategory,
}

impl From<&PredictionResult> for PredictionMessage {
    fn from(result: &PredictionResult) -> Self {
        Self {
            ts: result.ts.to_rfc3339(),
            rul: result.rul,
            failure_probability: result.failure_probability,
            risk_category: result.risk_category,
        }
    }
}
