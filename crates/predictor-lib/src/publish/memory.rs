//! Sink that keeps published messages in memory

use super::PredictionSink;
use crate::error::SinkError;
use crate::models::PredictionMessage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Records every message it accepts. Can be switched offline to simulate an
/// unreachable broker.
pub struct RecordingSink {
    messages: Mutex<Vec<PredictionMessage>>,
    available: AtomicBool,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn messages(&self) -> Vec<PredictionMessage> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl PredictionSink for RecordingSink {
    async fn publish(&self, message: &PredictionMessage) -> Result<(), SinkError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("broker offline".to_string()));
        }
        self.messages.lock().await.push(message.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}
