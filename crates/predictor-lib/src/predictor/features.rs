//! Feature extraction for ML inference
//!
//! Maps one telemetry record onto the ordered feature schema a model was
//! trained on. Missing, non-finite and out-of-range sensor values are
//! replaced by the per-field default declared for the model, so a partial
//! sensor dropout degrades prediction fidelity instead of stopping the
//! pipeline. Every substitution is reported on the resulting vector.

use crate::error::ExtractError;
use crate::models::{FeatureVector, TelemetryRecord};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// Value used for a field that has no declared default
pub const FALLBACK_DEFAULT: f64 = 0.0;

/// Inclusive range a sensor value must fall in to be used as-is
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ValidRange {
    pub min: f64,
    pub max: f64,
}

impl ValidRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Physical limits of the telemetry contract
pub fn default_ranges() -> HashMap<String, ValidRange> {
    [
        ("soc", ValidRange::new(0.0, 100.0)),
        ("soh", ValidRange::new(0.0, 100.0)),
        ("battery_voltage", ValidRange::new(200.0, 500.0)),
        ("battery_temperature", ValidRange::new(-20.0, 80.0)),
        ("motor_temperature", ValidRange::new(0.0, 150.0)),
        ("driving_speed", ValidRange::new(0.0, 200.0)),
    ]
    .into_iter()
    .map(|(name, range)| (name.to_string(), range))
    .collect()
}

/// Feature substitution policy supplied through configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeatureConfig {
    /// Per-field defaults; override the values declared in model metadata
    #[serde(default)]
    pub defaults: HashMap<String, f64>,
    /// Per-field valid ranges; merged over the built-in limits
    #[serde(default)]
    pub ranges: HashMap<String, ValidRange>,
}

/// Default value for each field, layered from model metadata and configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldDefaults {
    values: HashMap<String, f64>,
}

impl FieldDefaults {
    pub fn new(values: HashMap<String, f64>) -> Self {
        Self { values }
    }

    /// Layer `overrides` on top of the current table
    pub fn merged_with(&self, overrides: &HashMap<String, f64>) -> Self {
        let mut values = self.values.clone();
        values.extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));
        Self { values }
    }

    pub fn get(&self, name: &str) -> f64 {
        self.values
            .get(name)
            .copied()
            .filter(|v| v.is_finite())
            .unwrap_or(FALLBACK_DEFAULT)
    }
}

/// Ordered input names of a model plus the defaults used to fill gaps
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSchema {
    names: Vec<String>,
    defaults: FieldDefaults,
}

impl FeatureSchema {
    pub fn new(names: Vec<String>, defaults: FieldDefaults) -> Self {
        Self { names, defaults }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn defaults(&self) -> &FieldDefaults {
        &self.defaults
    }

    /// Replace the defaults with configuration overrides layered on top
    pub fn with_overrides(mut self, overrides: &HashMap<String, f64>) -> Self {
        self.defaults = self.defaults.merged_with(overrides);
        self
    }
}

/// Builds model feature vectors from telemetry records
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    ranges: HashMap<String, ValidRange>,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self {
            ranges: default_ranges(),
        }
    }
}

impl FeatureExtractor {
    pub fn new(config: &FeatureConfig) -> Self {
        let mut ranges = default_ranges();
        ranges.extend(config.ranges.iter().map(|(k, v)| (k.clone(), *v)));
        Self { ranges }
    }

    /// Effective valid ranges: built-in limits merged with configuration
    pub fn ranges(&self) -> &HashMap<String, ValidRange> {
        &self.ranges
    }

    /// Build the feature vector for `schema` from `record`.
    ///
    /// Fails only when the schema is empty. A missing timestamp cannot reach
    /// this point: rows without one are rejected by the source reader.
    pub fn build(
        &self,
        record: &TelemetryRecord,
        schema: &FeatureSchema,
    ) -> Result<FeatureVector, ExtractError> {
        if schema.is_empty() {
            return Err(ExtractError::SchemaMismatch(
                "feature schema is empty".to_string(),
            ));
        }

        let mut values = Vec::with_capacity(schema.len());
        let mut substituted = Vec::new();

        for name in schema.names() {
            match self.usable_value(record, name) {
                Some(value) => values.push(value),
                None => {
                    let default = schema.defaults().get(name);
                    debug!(field = %name, default, "Substituting default for sensor value");
                    values.push(default);
                    substituted.push(name.clone());
                }
            }
        }

        Ok(FeatureVector {
            values,
            substituted,
        })
    }

    fn usable_value(&self, record: &TelemetryRecord, name: &str) -> Option<f64> {
        let value = record.field(name).filter(|v| v.is_finite())?;
        match self.ranges.get(name) {
            Some(range) if !range.contains(value) => None,
            _ => Some(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TELEMETRY_FIELDS;
    use chrono::Utc;

    fn full_schema(defaults: HashMap<String, f64>) -> FeatureSchema {
        FeatureSchema::new(
            TELEMETRY_FIELDS.iter().map(|s| s.to_string()).collect(),
            FieldDefaults::new(defaults),
        )
    }

    fn valid_record() -> TelemetryRecord {
        TelemetryRecord {
            soc: Some(85.0),
            soh: Some(95.0),
            battery_voltage: Some(380.0),
            battery_current: Some(-25.0),
            battery_temperature: Some(28.5),
            motor_temperature: Some(65.0),
            motor_vibration: Some(0.45),
            power_consumption: Some(35.0),
            driving_speed: Some(80.0),
            distance_traveled: Some(15000.0),
            ..TelemetryRecord::empty(Utc::now())
        }
    }

    #[test]
    fn test_complete_record_keeps_order() {
        let extractor = FeatureExtractor::default();
        let f = extractor
            .build(&valid_record(), &full_schema(HashMap::new()))
            .unwrap();
        assert_eq!(f.len(), 10);
        assert_eq!(f.values[0], 85.0);
        assert_eq!(f.values[1], 95.0);
        assert_eq!(f.values[2], 380.0);
        assert_eq!(f.values[9], 15000.0);
        assert!(!f.is_degraded());
    }

    #[test]
    fn test_missing_values_use_declared_defaults() {
        let extractor = FeatureExtractor::default();
        let record = TelemetryRecord {
            soc: Some(75.0),
            soh: Some(90.0),
            ..TelemetryRecord::empty(Utc::now())
        };
        let schema = full_schema(HashMap::from([("battery_voltage".to_string(), 350.0)]));
        let f = extractor.build(&record, &schema).unwrap();

        assert_eq!(f.len(), 10);
        assert_eq!(f.values[0], 75.0);
        assert_eq!(f.values[1], 90.0);
        assert_eq!(f.values[2], 350.0);
        assert_eq!(f.values[3], FALLBACK_DEFAULT);
        assert_eq!(f.substituted.len(), 8);
        assert!(f.substituted.contains(&"battery_voltage".to_string()));
    }

    #[test]
    fn test_non_finite_and_out_of_range_are_substituted() {
        let extractor = FeatureExtractor::default();
        let mut record = valid_record();
        record.soc = Some(150.0);
        record.motor_vibration = Some(f64::NAN);
        record.battery_current = Some(f64::INFINITY);

        let schema = full_schema(HashMap::from([("soc".to_string(), 50.0)]));
        let f = extractor.build(&record, &schema).unwrap();

        assert_eq!(f.values[0], 50.0);
        assert!(f.values.iter().all(|v| v.is_finite()));
        assert_eq!(
            f.substituted,
            vec!["soc", "battery_current", "motor_vibration"]
        );
    }

    #[test]
    fn test_configured_ranges_override_builtin() {
        let config = FeatureConfig {
            defaults: HashMap::new(),
            ranges: HashMap::from([("soc".to_string(), ValidRange::new(0.0, 200.0))]),
        };
        let extractor = FeatureExtractor::new(&config);
        let mut record = valid_record();
        record.soc = Some(150.0);

        let f = extractor
            .build(&record, &full_schema(HashMap::new()))
            .unwrap();
        assert_eq!(f.values[0], 150.0);
        assert!(!f.is_degraded());
    }

    #[test]
    fn test_empty_schema_is_rejected() {
        let extractor = FeatureExtractor::default();
        let schema = FeatureSchema::new(Vec::new(), FieldDefaults::default());
        let err = extractor.build(&valid_record(), &schema).unwrap_err();
        assert!(matches!(err, ExtractError::SchemaMismatch(_)));
    }

    #[test]
    fn test_vector_length_matches_any_schema() {
        let extractor = FeatureExtractor::default();
        let record = TelemetryRecord::empty(Utc::now());
        for len in 1..=TELEMETRY_FIELDS.len() {
            let names = TELEMETRY_FIELDS[..len].iter().map(|s| s.to_string()).collect();
            let schema = FeatureSchema::new(names, FieldDefaults::default());
            let f = extractor.build(&record, &schema).unwrap();
            assert_eq!(f.len(), len);
            assert!(f.values.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_overrides_layer_on_metadata_defaults() {
        let schema = full_schema(HashMap::from([
            ("soc".to_string(), 50.0),
            ("soh".to_string(), 80.0),
        ]))
        .with_overrides(&HashMap::from([("soh".to_string(), 90.0)]));
        assert_eq!(schema.defaults().get("soc"), 50.0);
        assert_eq!(schema.defaults().get("soh"), 90.0);
        assert_eq!(schema.defaults().get("motor_vibration"), FALLBACK_DEFAULT);
    }
}
