//! Result fan-out
//!
//! A scored prediction goes to three places: the in-process metrics
//! registry, a publish/subscribe topic and, optionally, back onto the
//! telemetry row it was computed from. [`ResultPublisher`] attempts all of
//! them and isolates their failures from one another.

mod memory;
mod mqtt;
mod publisher;

pub use memory::RecordingSink;
pub use mqtt::{BrokerEndpoint, MqttConfig, MqttSink, DEFAULT_CLIENT_ID, DEFAULT_TOPIC};
pub use publisher::{PublishOutcome, ResultPublisher, DEFAULT_PUBLISH_TIMEOUT};

use crate::error::SinkError;
use crate::models::PredictionMessage;
use async_trait::async_trait;

/// Destination for flat prediction messages
#[async_trait]
pub trait PredictionSink: Send + Sync {
    /// Publish one message. Delivery is at-most-once.
    async fn publish(&self, message: &PredictionMessage) -> Result<(), SinkError>;

    /// Name used in logs
    fn name(&self) -> &'static str;
}
