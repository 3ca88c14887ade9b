//! Result publisher
//!
//! Never fails the cycle: each sink's error is counted, logged and folded
//! into the returned [`PublishOutcome`].

use super::PredictionSink;
use crate::error::SinkError;
use crate::health::{components, HealthRegistry};
use crate::models::{PredictionMessage, PredictionResult};
use crate::observability::{PredictorMetrics, StructuredLogger};
use crate::source::SourceReader;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Default bound on a broker publish
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-sink result of one publish, used for logging only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub metrics_ok: bool,
    pub broker_ok: bool,
    /// `None` when write-back is disabled
    pub db_ok: Option<bool>,
}

impl PublishOutcome {
    pub fn all_ok(&self) -> bool {
        self.metrics_ok && self.broker_ok && self.db_ok.unwrap_or(true)
    }
}

pub struct ResultPublisher {
    metrics: PredictorMetrics,
    sink: Arc<dyn PredictionSink>,
    write_back: Option<Arc<SourceReader>>,
    publish_timeout: Duration,
    health: HealthRegistry,
    logger: StructuredLogger,
}

impl ResultPublisher {
    pub fn new(
        metrics: PredictorMetrics,
        sink: Arc<dyn PredictionSink>,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            metrics,
            sink,
            write_back: None,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            health,
            logger,
        }
    }

    /// Enable write-back of predictions through `reader`
    pub fn with_write_back(mut self, reader: Arc<SourceReader>) -> Self {
        self.write_back = Some(reader);
        self
    }

    pub fn with_publish_timeout(mut self, publish_timeout: Duration) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }

    pub fn write_back_enabled(&self) -> bool {
        self.write_back.is_some()
    }

    pub async fn publish(&self, result: &PredictionResult) -> PublishOutcome {
        // In-process registry, cannot fail
        self.metrics.record_prediction(result);

        let (broker_ok, db_ok) = tokio::join!(self.publish_message(result), self.write_back(result));

        PublishOutcome {
            metrics_ok: true,
            broker_ok,
            db_ok,
        }
    }

    async fn publish_message(&self, result: &PredictionResult) -> bool {
        let message = PredictionMessage::from(result);
        let outcome = timeout(self.publish_timeout, self.sink.publish(&message))
            .await
            .unwrap_or(Err(SinkError::Timeout(self.publish_timeout)));

        match outcome {
            Ok(()) => {
                self.health.record_success(components::BROKER).await;
                true
            }
            Err(e) => {
                self.metrics.inc_broker_errors();
                self.health
                    .record_failure(components::BROKER, e.to_string())
                    .await;
                self.logger.log_sink_failure(self.sink.name(), &e);
                false
            }
        }
    }

    async fn write_back(&self, result: &PredictionResult) -> Option<bool> {
        let reader = self.write_back.as_ref()?;
        match reader
            .write_predictions(result.ts, result.rul, result.failure_probability)
            .await
        {
            Ok(_) => Some(true),
            Err(e) => {
                self.metrics.inc_db_errors();
                self.logger.log_sink_failure("write_back", &e);
                Some(false)
            }
        }
    }
}
