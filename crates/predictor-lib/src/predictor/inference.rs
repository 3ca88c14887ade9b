//! Model artifacts and inference
//!
//! Each model slot is backed by two files in the artifact directory: a
//! metadata descriptor (`<slot>_meta.json`) and a serialized predictor.
//! Predictors are either ONNX graphs run with tract or plain linear models
//! stored as JSON. Artifacts are loaded once at startup and are read-only
//! afterwards.

use super::features::{FeatureSchema, FieldDefaults};
use super::Predictor;
use crate::error::{LoadError, PredictError};
use crate::models::{FeatureVector, TelemetryRecord};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tract_onnx::prelude::*;
use tracing::{debug, info};

type TractModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// The two model slots held by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelSlot {
    /// Remaining-useful-life regressor
    Rul,
    /// Failure probability model
    Failure,
}

impl ModelSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSlot::Rul => "rul",
            ModelSlot::Failure => "failure",
        }
    }

    pub fn metadata_file(&self) -> String {
        format!("{}_meta.json", self.as_str())
    }

    pub fn onnx_file(&self) -> String {
        format!("{}_model.onnx", self.as_str())
    }

    pub fn linear_file(&self) -> String {
        format!("{}_model.json", self.as_str())
    }
}

impl fmt::Display for ModelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    feature_names: Vec<String>,
    #[serde(alias = "created_at")]
    trained_at: String,
    #[serde(default)]
    model_type: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    feature_defaults: HashMap<String, f64>,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    output_index: usize,
    #[serde(default)]
    output_column: usize,
}

/// Descriptor written next to each trained model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMetadata {
    pub feature_names: Vec<String>,
    pub trained_at: DateTime<Utc>,
    pub model_type: Option<String>,
    pub target: Option<String>,
    pub feature_defaults: HashMap<String, f64>,
    pub sha256: Option<String>,
    /// Which model output holds the prediction
    pub output_index: usize,
    /// Which value within that output (e.g. the positive-class column)
    pub output_column: usize,
}

impl ModelMetadata {
    pub fn new(feature_names: Vec<String>, trained_at: DateTime<Utc>) -> Self {
        Self {
            feature_names,
            trained_at,
            model_type: None,
            target: None,
            feature_defaults: HashMap::new(),
            sha256: None,
            output_index: 0,
            output_column: 0,
        }
    }

    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let bytes = std::fs::read(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&bytes).map_err(|reason| LoadError::InvalidMetadata {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn parse(bytes: &[u8]) -> Result<Self, String> {
        let raw: RawMetadata = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        let trained_at = parse_timestamp(&raw.trained_at)
            .ok_or_else(|| format!("unparseable trained_at '{}'", raw.trained_at))?;
        Ok(Self {
            feature_names: raw.feature_names,
            trained_at,
            model_type: raw.model_type,
            target: raw.target,
            feature_defaults: raw.feature_defaults,
            sha256: raw.sha256,
            output_index: raw.output_index,
            output_column: raw.output_column,
        })
    }
}

/// Accepts RFC 3339 and naive ISO-8601 timestamps (interpreted as UTC)
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Linear model stored as JSON, for lightweight deployments
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinearModel {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    #[serde(default)]
    pub link: LinkFunction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkFunction {
    #[default]
    Identity,
    Logistic,
}

impl Predictor for LinearModel {
    fn predict(&self, features: &[f64]) -> Result<f64, PredictError> {
        if features.len() != self.coefficients.len() {
            return Err(PredictError::DimensionMismatch {
                expected: self.coefficients.len(),
                actual: features.len(),
            });
        }
        let linear = self.intercept
            + self
                .coefficients
                .iter()
                .zip(features)
                .map(|(c, x)| c * x)
                .sum::<f64>();
        Ok(match self.link {
            LinkFunction::Identity => linear,
            LinkFunction::Logistic => 1.0 / (1.0 + (-linear).exp()),
        })
    }

    fn kind(&self) -> &'static str {
        "linear"
    }
}

/// ONNX model executed with tract
pub struct OnnxModel {
    plan: TractModel,
    num_features: usize,
    output_index: usize,
    output_column: usize,
}

impl OnnxModel {
    pub fn load(path: &Path, num_features: usize, metadata: &ModelMetadata) -> TractResult<Self> {
        let plan = tract_onnx::onnx()
            .model_for_path(path)?
            .with_input_fact(0, f32::fact([1, num_features]).into())?
            .into_optimized()?
            .into_runnable()?;
        Ok(Self {
            plan,
            num_features,
            output_index: metadata.output_index,
            output_column: metadata.output_column,
        })
    }

    fn run(&self, features: &[f64]) -> TractResult<f64> {
        let data: Vec<f32> = features.iter().map(|v| *v as f32).collect();
        let input: Tensor =
            tract_ndarray::Array2::from_shape_vec((1, self.num_features), data)?.into();
        let outputs = self.plan.run(tvec!(input.into()))?;
        let output = outputs
            .get(self.output_index)
            .ok_or_else(|| anyhow::anyhow!("model has no output {}", self.output_index))?;
        let values = output.cast_to::<f32>()?;
        let view = values.to_array_view::<f32>()?;
        view.iter()
            .nth(self.output_column)
            .map(|v| *v as f64)
            .ok_or_else(|| anyhow::anyhow!("output has no column {}", self.output_column))
    }
}

impl Predictor for OnnxModel {
    fn predict(&self, features: &[f64]) -> Result<f64, PredictError> {
        if features.len() != self.num_features {
            return Err(PredictError::DimensionMismatch {
                expected: self.num_features,
                actual: features.len(),
            });
        }
        self.run(features)
            .map_err(|e| PredictError::Inference(e.to_string()))
    }

    fn kind(&self) -> &'static str {
        "onnx"
    }
}

/// A loaded model together with its metadata and input schema
pub struct ModelArtifact {
    slot: ModelSlot,
    metadata: ModelMetadata,
    schema: FeatureSchema,
    predictor: Box<dyn Predictor>,
    checksum: String,
}

impl fmt::Debug for ModelArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelArtifact")
            .field("slot", &self.slot)
            .field("kind", &self.predictor.kind())
            .field("features", &self.schema.len())
            .field("trained_at", &self.metadata.trained_at)
            .field("checksum", &self.checksum)
            .finish()
    }
}

impl ModelArtifact {
    /// Assemble an artifact from an already constructed predictor
    pub fn from_parts(
        slot: ModelSlot,
        metadata: ModelMetadata,
        predictor: Box<dyn Predictor>,
        checksum: impl Into<String>,
    ) -> Result<Self, LoadError> {
        validate_schema(slot, &metadata.feature_names)?;
        let schema = FeatureSchema::new(
            metadata.feature_names.clone(),
            FieldDefaults::new(metadata.feature_defaults.clone()),
        );
        Ok(Self {
            slot,
            metadata,
            schema,
            predictor,
            checksum: checksum.into(),
        })
    }

    /// Load the artifact for `slot` from `dir`. ONNX takes precedence over
    /// a linear model when both are present.
    pub fn load(dir: &Path, slot: ModelSlot) -> Result<Self, LoadError> {
        let metadata = ModelMetadata::load(&dir.join(slot.metadata_file()))?;
        validate_schema(slot, &metadata.feature_names)?;

        let onnx_path = dir.join(slot.onnx_file());
        let linear_path = dir.join(slot.linear_file());
        let blob_path = if onnx_path.exists() {
            onnx_path
        } else if linear_path.exists() {
            linear_path
        } else {
            return Err(LoadError::MissingArtifact {
                slot: slot.to_string(),
                dir: dir.to_path_buf(),
            });
        };

        let bytes = std::fs::read(&blob_path).map_err(|source| LoadError::Io {
            path: blob_path.clone(),
            source,
        })?;
        let checksum = compute_checksum(&bytes);
        if let Some(expected) = &metadata.sha256 {
            if !expected.eq_ignore_ascii_case(&checksum) {
                return Err(LoadError::ChecksumMismatch {
                    path: blob_path,
                    expected: expected.clone(),
                    actual: checksum,
                });
            }
        }

        let predictor = load_predictor(&blob_path, &bytes, &metadata)?;

        info!(
            slot = %slot,
            kind = predictor.kind(),
            path = %blob_path.display(),
            features = metadata.feature_names.len(),
            trained_at = %metadata.trained_at,
            checksum = %checksum,
            "Loaded model artifact"
        );

        Self::from_parts(slot, metadata, predictor, checksum)
    }

    pub fn slot(&self) -> ModelSlot {
        self.slot
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Blob format backing this artifact, `onnx` or `linear`
    pub fn kind(&self) -> &'static str {
        self.predictor.kind()
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn feature_count(&self) -> usize {
        self.schema.len()
    }

    /// Layer configuration defaults over the ones declared in metadata
    pub fn with_default_overrides(mut self, overrides: &HashMap<String, f64>) -> Self {
        self.schema = self.schema.with_overrides(overrides);
        self
    }

    /// Run the model. Failure probabilities are clamped into [0, 1].
    pub fn predict(&self, features: &FeatureVector) -> Result<f64, PredictError> {
        if features.len() != self.feature_count() {
            return Err(PredictError::DimensionMismatch {
                expected: self.feature_count(),
                actual: features.len(),
            });
        }
        let value = self.predictor.predict(&features.values)?;
        if !value.is_finite() {
            return Err(PredictError::NonFinite);
        }
        debug!(slot = %self.slot, value, "Model inference completed");
        Ok(match self.slot {
            ModelSlot::Failure => value.clamp(0.0, 1.0),
            ModelSlot::Rul => value,
        })
    }
}

fn validate_schema(slot: ModelSlot, names: &[String]) -> Result<(), LoadError> {
    if names.is_empty() {
        return Err(LoadError::EmptySchema {
            slot: slot.to_string(),
        });
    }
    if let Some(unknown) = names.iter().find(|n| !TelemetryRecord::is_known_field(n)) {
        return Err(LoadError::UnknownFeature {
            slot: slot.to_string(),
            feature: unknown.clone(),
        });
    }
    Ok(())
}

fn load_predictor(
    path: &Path,
    bytes: &[u8],
    metadata: &ModelMetadata,
) -> Result<Box<dyn Predictor>, LoadError> {
    let num_features = metadata.feature_names.len();
    let model_error = |reason: String| LoadError::Model {
        path: path.to_path_buf(),
        reason,
    };

    match path.extension().and_then(|e| e.to_str()) {
        Some("onnx") => {
            let model = OnnxModel::load(path, num_features, metadata)
                .map_err(|e| model_error(format!("{:#}", e)))?;
            Ok(Box::new(model))
        }
        Some("json") => {
            let model: LinearModel =
                serde_json::from_slice(bytes).map_err(|e| model_error(e.to_string()))?;
            if model.coefficients.len() != num_features {
                return Err(model_error(format!(
                    "{} coefficients for {} declared features",
                    model.coefficients.len(),
                    num_features
                )));
            }
            Ok(Box::new(model))
        }
        _ => Err(LoadError::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}

/// Compute SHA256 checksum of data
fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// The two models used by every cycle, shared read-only across tasks
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    rul: Arc<ModelArtifact>,
    failure: Arc<ModelArtifact>,
    dir: Option<PathBuf>,
}

impl ModelRegistry {
    pub fn new(rul: ModelArtifact, failure: ModelArtifact) -> Self {
        Self {
            rul: Arc::new(rul),
            failure: Arc::new(failure),
            dir: None,
        }
    }

    /// Load both models from `dir`. Any failure is fatal to the caller.
    pub fn load(dir: &Path, default_overrides: &HashMap<String, f64>) -> Result<Self, LoadError> {
        let rul = ModelArtifact::load(dir, ModelSlot::Rul)?.with_default_overrides(default_overrides);
        let failure =
            ModelArtifact::load(dir, ModelSlot::Failure)?.with_default_overrides(default_overrides);
        let mut registry = Self::new(rul, failure);
        registry.dir = Some(dir.to_path_buf());
        Ok(registry)
    }

    pub fn rul(&self) -> &Arc<ModelArtifact> {
        &self.rul
    }

    pub fn failure(&self) -> &Arc<ModelArtifact> {
        &self.failure
    }

    pub fn get(&self, slot: ModelSlot) -> &Arc<ModelArtifact> {
        match slot {
            ModelSlot::Rul => &self.rul,
            ModelSlot::Failure => &self.failure,
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}
