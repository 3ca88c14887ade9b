//! Live inference library for battery telemetry
//!
//! This crate provides the core functionality for:
//! - Reading the latest telemetry row from the store of record
//! - Feature extraction and model inference (RUL and failure probability)
//! - Composite health scoring and risk classification
//! - Fan-out of results to metrics, MQTT and optional write-back
//! - Health checks and observability

pub mod api;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod predictor;
pub mod publish;
pub mod source;

pub use error::{CycleError, LoadError, PredictError, ReadError, SinkError, Stage, WriteBackError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{PredictorMetrics, StructuredLogger};
