//! In-memory telemetry source for a single device

use super::{async_trait, DeviceSelector, TelemetrySource};
use crate::error::{ReadError, WriteBackError};
use crate::models::TelemetryRecord;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// A prediction written back to the store
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenPrediction {
    pub ts: DateTime<Utc>,
    pub rul: f64,
    pub failure_probability: f64,
}

/// Telemetry source holding rows in memory.
///
/// Scripted read and write failures are returned before any row, one per
/// call, which makes outage scenarios reproducible.
#[derive(Default)]
pub struct InMemorySource {
    rows: Mutex<Vec<TelemetryRecord>>,
    read_failures: Mutex<VecDeque<ReadError>>,
    write_failures: Mutex<VecDeque<WriteBackError>>,
    written: Mutex<Vec<WrittenPrediction>>,
    fetch_calls: AtomicUsize,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: TelemetryRecord) -> Self {
        Self {
            rows: Mutex::new(vec![record]),
            ..Self::default()
        }
    }

    pub async fn push(&self, record: TelemetryRecord) {
        self.rows.lock().await.push(record);
    }

    /// Queue a failure for the next fetch
    pub async fn fail_next_read(&self, error: ReadError) {
        self.read_failures.lock().await.push_back(error);
    }

    /// Queue a failure for the next write-back
    pub async fn fail_next_write(&self, error: WriteBackError) {
        self.write_failures.lock().await.push_back(error);
    }

    pub async fn written(&self) -> Vec<WrittenPrediction> {
        self.written.lock().await.clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetrySource for InMemorySource {
    async fn fetch_latest(&self, _device: &DeviceSelector) -> Result<TelemetryRecord, ReadError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.read_failures.lock().await.pop_front() {
            return Err(error);
        }
        self.rows
            .lock()
            .await
            .iter()
            .max_by_key(|r| r.ts)
            .cloned()
            .ok_or(ReadError::NoData)
    }

    async fn write_predictions(
        &self,
        _device: &DeviceSelector,
        ts: DateTime<Utc>,
        rul: f64,
        failure_probability: f64,
    ) -> Result<u64, WriteBackError> {
        if let Some(error) = self.write_failures.lock().await.pop_front() {
            return Err(error);
        }
        let matched = self.rows.lock().await.iter().filter(|r| r.ts == ts).count() as u64;
        if matched > 0 {
            self.written.lock().await.push(WrittenPrediction {
                ts,
                rul,
                failure_probability,
            });
        }
        Ok(matched)
    }
}
