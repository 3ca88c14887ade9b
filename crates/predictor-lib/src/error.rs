//! Error taxonomy for the inference pipeline
//!
//! Load errors are fatal at startup. Everything else is scoped to a single
//! cycle and classified by the stage that produced it.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Pipeline stage a cycle failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Read,
    Extract,
    Predict,
    Score,
    Publish,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Read,
        Stage::Extract,
        Stage::Predict,
        Stage::Score,
        Stage::Publish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Read => "read",
            Stage::Extract => "extract",
            Stage::Predict => "predict",
            Stage::Score => "score",
            Stage::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("telemetry source unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("telemetry source returned no rows")]
    NoData,

    #[error("malformed telemetry row: {0}")]
    MalformedRow(String),

    #[error("telemetry read timed out after {0:?}")]
    Timeout(Duration),
}

impl ReadError {
    /// Errors that count against the source connection
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ReadError::ConnectionUnavailable(_) | ReadError::Timeout(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid model metadata in {path:?}: {reason}")]
    InvalidMetadata { path: PathBuf, reason: String },

    #[error("no model artifact found for slot '{slot}' in {dir:?}")]
    MissingArtifact { slot: String, dir: PathBuf },

    #[error("unsupported model format {path:?}")]
    UnsupportedFormat { path: PathBuf },

    #[error("failed to load model {path:?}: {reason}")]
    Model { path: PathBuf, reason: String },

    #[error("model '{slot}' declares an empty feature schema")]
    EmptySchema { slot: String },

    #[error("model '{slot}' expects unknown feature '{feature}'")]
    UnknownFeature { slot: String, feature: String },

    #[error("checksum mismatch for {path:?}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("feature vector has {actual} values, model expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("model produced a non-finite output")]
    NonFinite,

    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum WriteBackError {
    #[error("telemetry source unavailable: {0}")]
    Unavailable(String),

    #[error("write-back timed out after {0:?}")]
    Timeout(Duration),
}

/// Cause of a failed cycle
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("{model} model: {source}")]
    Predict {
        model: &'static str,
        #[source]
        source: PredictError,
    },
}

impl CycleError {
    pub fn stage(&self) -> Stage {
        match self {
            CycleError::Read(_) => Stage::Read,
            CycleError::Extract(_) => Stage::Extract,
            CycleError::Predict { .. } => Stage::Predict,
        }
    }

    /// A dimension mismatch means the extractor and the model disagree on
    /// the schema; retrying cannot fix it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CycleError::Predict {
                source: PredictError::DimensionMismatch { .. },
                ..
            }
        )
    }

    /// An empty source is not worth a failure metric
    pub fn is_silent(&self) -> bool {
        matches!(self, CycleError::Read(ReadError::NoData))
    }
}
