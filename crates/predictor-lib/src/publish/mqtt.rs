//! MQTT prediction sink
//!
//! The connection is owned by a background task polling the `rumqttc` event
//! loop. Polling again after an error reconnects, so a broker outage heals on
//! its own. Publishes fail fast while the connection is down.

use super::PredictionSink;
use crate::error::SinkError;
use crate::models::PredictionMessage;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_TOPIC: &str = "v1/devices/me/predictions";
pub const DEFAULT_CLIENT_ID: &str = "ev_predictor";
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Pause between reconnect attempts after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Bound of the client request queue
    pub capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_MQTT_PORT,
            topic: DEFAULT_TOPIC.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            keep_alive: Duration::from_secs(60),
            capacity: 16,
        }
    }
}

/// Resolved broker address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl BrokerEndpoint {
    /// Accepts a bare host name or an `mqtt://host[:port]` URL. A port in
    /// the URL takes precedence over `default_port`.
    pub fn parse(host: &str, default_port: u16) -> Result<Self> {
        let host = host.trim();
        if host.is_empty() {
            bail!("broker host is empty");
        }
        if !host.contains("://") {
            return Ok(Self {
                host: host.to_string(),
                port: default_port,
            });
        }

        let url = url::Url::parse(host).with_context(|| format!("invalid broker URL '{}'", host))?;
        if !matches!(url.scheme(), "mqtt" | "tcp") {
            bail!("unsupported broker scheme '{}'", url.scheme());
        }
        let name = url
            .host_str()
            .with_context(|| format!("broker URL '{}' has no host", host))?;
        Ok(Self {
            host: name.to_string(),
            port: url.port().unwrap_or(default_port),
        })
    }
}

pub struct MqttSink {
    client: AsyncClient,
    topic: String,
    connected: Arc<AtomicBool>,
    event_loop: JoinHandle<()>,
}

impl MqttSink {
    /// Start the client and its event loop task. Must be called inside a
    /// Tokio runtime; the first connection attempt happens in the background.
    pub fn connect(config: &MqttConfig) -> Result<Self> {
        if config.topic.trim().is_empty() {
            bail!("publish topic is empty");
        }
        let endpoint = BrokerEndpoint::parse(&config.host, config.port)?;

        let mut options = MqttOptions::new(&config.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(config.keep_alive);
        let (client, mut event_loop) = AsyncClient::new(options, config.capacity);

        let connected = Arc::new(AtomicBool::new(false));
        let flag = connected.clone();
        let host = endpoint.host.clone();
        let port = endpoint.port;

        let event_loop = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        flag.store(true, Ordering::SeqCst);
                        info!(host = %host, port, "Connected to MQTT broker");
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        flag.store(false, Ordering::SeqCst);
                        warn!(host = %host, port, "MQTT broker closed the connection");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if flag.swap(false, Ordering::SeqCst) {
                            warn!(host = %host, port, error = %e, "MQTT connection lost");
                        } else {
                            debug!(host = %host, port, error = %e, "MQTT connection attempt failed");
                        }
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            topic: config.topic.clone(),
            connected,
            event_loop,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Send a DISCONNECT and stop the event loop
    pub async fn disconnect(&self) {
        if self.is_connected() {
            if let Err(e) = self.client.disconnect().await {
                debug!(error = %e, "MQTT disconnect failed");
            }
        }
        self.event_loop.abort();
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

#[async_trait]
impl PredictionSink for MqttSink {
    async fn publish(&self, message: &PredictionMessage) -> Result<(), SinkError> {
        if !self.is_connected() {
            return Err(SinkError::Unavailable("not connected to broker".to_string()));
        }
        let payload = serde_json::to_vec(message)?;
        self.client
            .try_publish(self.topic.as_str(), QoS::AtMostOnce, false, payload)
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        debug!(topic = %self.topic, ts = %message.ts, "Published predictions");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}
