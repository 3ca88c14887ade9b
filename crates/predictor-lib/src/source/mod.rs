//! Telemetry source access
//!
//! The store of record is reached through the [`TelemetrySource`] trait so
//! the scheduler can be driven by an in-memory fake in tests. The production
//! implementation is [`PgTelemetrySource`]; [`SourceReader`] adds the
//! per-call timeout, error counting and health reporting around it.

mod memory;
mod postgres;
mod reader;

pub use memory::{InMemorySource, WrittenPrediction};
pub use postgres::{parse_connection_string, validate_identifier, PgSourceConfig, PgTelemetrySource};
pub use reader::{SourceReader, DEFAULT_SOURCE_TIMEOUT};

use crate::error::{ReadError, WriteBackError};
use crate::models::TelemetryRecord;
use chrono::{DateTime, Utc};
use std::fmt;

pub use async_trait::async_trait;

/// Which device's telemetry a query addresses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeviceSelector {
    /// The single device the store holds; no filter is applied
    #[default]
    Default,
    /// Rows whose `device_id` column matches
    Id(String),
}

impl DeviceSelector {
    pub fn from_option(device_id: Option<String>) -> Self {
        match device_id {
            Some(id) if !id.trim().is_empty() => DeviceSelector::Id(id),
            _ => DeviceSelector::Default,
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Default => f.write_str("default"),
            DeviceSelector::Id(id) => f.write_str(id),
        }
    }
}

/// Store of record holding timestamped telemetry rows
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Most recent row for `device`
    async fn fetch_latest(&self, device: &DeviceSelector) -> Result<TelemetryRecord, ReadError>;

    /// Set the two prediction fields on the row with exactly `ts`.
    ///
    /// Returns the number of rows updated; zero is not an error.
    async fn write_predictions(
        &self,
        device: &DeviceSelector,
        ts: DateTime<Utc>,
        rul: f64,
        failure_probability: f64,
    ) -> Result<u64, WriteBackError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_selector_from_option() {
        assert_eq!(DeviceSelector::from_option(None), DeviceSelector::Default);
        assert_eq!(
            DeviceSelector::from_option(Some("  ".into())),
            DeviceSelector::Default
        );
        assert_eq!(
            DeviceSelector::from_option(Some("ev-001".into())),
            DeviceSelector::Id("ev-001".into())
        );
        assert_eq!(DeviceSelector::Default.to_string(), "default");
    }
}
