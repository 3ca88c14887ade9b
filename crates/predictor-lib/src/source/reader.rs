//! Source reader: bounded calls into the telemetry source
//!
//! Every call is wrapped in a timeout. Connection failures and timeouts are
//! counted in `db_query_errors_total` and mark the source degraded; the next
//! successful call marks it healthy again.

use super::{DeviceSelector, TelemetrySource};
use crate::error::{ReadError, WriteBackError};
use crate::health::{components, HealthRegistry};
use crate::models::TelemetryRecord;
use crate::observability::PredictorMetrics;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Default bound on a single read or write-back
pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct SourceReader {
    source: Arc<dyn TelemetrySource>,
    device: DeviceSelector,
    read_timeout: Duration,
    write_timeout: Duration,
    metrics: PredictorMetrics,
    health: HealthRegistry,
}

impl SourceReader {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        device: DeviceSelector,
        metrics: PredictorMetrics,
        health: HealthRegistry,
    ) -> Self {
        Self {
            source,
            device,
            read_timeout: DEFAULT_SOURCE_TIMEOUT,
            write_timeout: DEFAULT_SOURCE_TIMEOUT,
            metrics,
            health,
        }
    }

    pub fn with_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    pub fn device(&self) -> &DeviceSelector {
        &self.device
    }

    /// Fetch the most recent record for the configured device
    pub async fn fetch_latest(&self) -> Result<TelemetryRecord, ReadError> {
        let result = timeout(self.read_timeout, self.source.fetch_latest(&self.device))
            .await
            .unwrap_or(Err(ReadError::Timeout(self.read_timeout)));

        match &result {
            Ok(_) | Err(ReadError::NoData) => {
                self.health.record_success(components::SOURCE).await;
            }
            Err(e) if e.is_connection_error() => {
                self.metrics.inc_db_errors();
                self.health
                    .record_failure(components::SOURCE, e.to_string())
                    .await;
            }
            Err(_) => {}
        }
        result
    }

    /// Write the predictions onto the row with exactly `ts`
    pub async fn write_predictions(
        &self,
        ts: DateTime<Utc>,
        rul: f64,
        failure_probability: f64,
    ) -> Result<u64, WriteBackError> {
        let rows = timeout(
            self.write_timeout,
            self.source
                .write_predictions(&self.device, ts, rul, failure_probability),
        )
        .await
        .unwrap_or(Err(WriteBackError::Timeout(self.write_timeout)))?;

        if rows == 0 {
            debug!(ts = %ts, "Write-back matched no rows");
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;
    use crate::source::{async_trait, InMemorySource};

    struct StalledSource;

    #[async_trait]
    impl TelemetrySource for StalledSource {
        async fn fetch_latest(&self, _: &DeviceSelector) -> Result<TelemetryRecord, ReadError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(ReadError::NoData)
        }

        async fn write_predictions(
            &self,
            _: &DeviceSelector,
            _: DateTime<Utc>,
            _: f64,
            _: f64,
        ) -> Result<u64, WriteBackError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        }
    }

    fn reader(source: Arc<dyn TelemetrySource>) -> (SourceReader, PredictorMetrics, HealthRegistry) {
        let metrics = PredictorMetrics::new().unwrap();
        let health = HealthRegistry::new();
        let reader = SourceReader::new(
            source,
            DeviceSelector::Default,
            metrics.clone(),
            health.clone(),
        );
        (reader, metrics, health)
    }

    #[tokio::test]
    async fn test_connection_errors_are_counted() {
        let source = Arc::new(InMemorySource::with_record(TelemetryRecord::empty(Utc::now())));
        source
            .fail_next_read(ReadError::ConnectionUnavailable("refused".into()))
            .await;
        let (reader, metrics, health) = reader(source);

        assert!(reader.fetch_latest().await.is_err());
        assert_eq!(metrics.db_query_errors(), 1);
        let source_health = health.component(components::SOURCE).await.unwrap();
        assert_eq!(source_health.status, ComponentStatus::Degraded);

        assert!(reader.fetch_latest().await.is_ok());
        assert_eq!(metrics.db_query_errors(), 1);
        let source_health = health.component(components::SOURCE).await.unwrap();
        assert_eq!(source_health.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_no_data_and_malformed_rows_are_not_db_errors() {
        let source = Arc::new(InMemorySource::new());
        source
            .fail_next_read(ReadError::MalformedRow("ts is null".into()))
            .await;
        let (reader, metrics, _) = reader(source);

        assert!(matches!(
            reader.fetch_latest().await,
            Err(ReadError::MalformedRow(_))
        ));
        assert!(matches!(reader.fetch_latest().await, Err(ReadError::NoData)));
        assert_eq!(metrics.db_query_errors(), 0);
    }

    #[tokio::test]
    async fn test_stalled_read_times_out() {
        let (reader, metrics, _) = reader(Arc::new(StalledSource));
        let reader = reader.with_timeouts(Duration::from_millis(50), Duration::from_millis(50));

        let err = reader.fetch_latest().await.unwrap_err();
        assert!(matches!(err, ReadError::Timeout(_)));
        assert_eq!(metrics.db_query_errors(), 1);

        let err = reader.write_predictions(Utc::now(), 1.0, 0.1).await.unwrap_err();
        assert!(matches!(err, WriteBackError::Timeout(_)));
    }
}
