//! Predictor configuration
//!
//! Layers, lowest to highest precedence: built-in defaults, legacy
//! connection variables (`PG_CONN_STRING`, `MQTT_HOST`), an optional TOML
//! file, `PREDICTOR_*` environment variables (`__` separates nested keys)
//! and command-line flags.

use anyhow::{bail, Context, Result};
use clap::Parser;
use predictor_lib::predictor::{FeatureConfig, ScoringConfig, DEFAULT_INTERVAL};
use predictor_lib::publish::{MqttConfig, DEFAULT_CLIENT_ID, DEFAULT_TOPIC};
use predictor_lib::source::{validate_identifier, DeviceSelector, PgSourceConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Live inference service for battery telemetry
#[derive(Debug, Default, Parser)]
#[command(name = "live-predictor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, env = "PREDICTOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Seconds between inference cycles
    #[arg(long)]
    pub interval: Option<f64>,

    /// Port of the /metrics, /healthz and /readyz endpoint
    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Write predictions back onto the telemetry row
    #[arg(long)]
    pub write_back: bool,

    /// PostgreSQL URL or libpq connection string
    #[arg(long)]
    pub pg: Option<String>,

    #[arg(long)]
    pub mqtt_host: Option<String>,

    #[arg(long)]
    pub mqtt_port: Option<u16>,

    /// Directory holding the model artifacts
    #[arg(long)]
    pub models_dir: Option<PathBuf>,

    /// Restrict reads and write-back to one device
    #[arg(long)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresSection {
    pub url: String,
    pub table: String,
    pub max_connections: u32,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for PostgresSection {
    fn default() -> Self {
        let defaults = PgSourceConfig::default();
        Self {
            url: defaults.connection,
            table: defaults.table,
            max_connections: defaults.max_connections,
            read_timeout_ms: 2000,
            write_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub publish_timeout_ms: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        let defaults = MqttConfig::default();
        Self {
            host: defaults.host,
            port: defaults.port,
            topic: DEFAULT_TOPIC.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            publish_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub interval_secs: f64,
    pub metrics_port: u16,
    pub write_back: bool,
    pub device_id: Option<String>,
    pub models_dir: PathBuf,
    pub predict_timeout_ms: u64,
    pub postgres: PostgresSection,
    pub mqtt: MqttSection,
    pub scoring: ScoringConfig,
    pub features: FeatureConfig,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5.0,
            metrics_port: 9100,
            write_back: false,
            device_id: None,
            models_dir: PathBuf::from("models"),
            predict_timeout_ms: 1000,
            postgres: PostgresSection::default(),
            mqtt: MqttSection::default(),
            scoring: ScoringConfig::default(),
            features: FeatureConfig::default(),
        }
    }
}

/// Connection variables read by earlier deployments
#[derive(Debug, Default)]
pub struct LegacyEnv {
    pub pg_conn_string: Option<String>,
    pub mqtt_host: Option<String>,
}

impl LegacyEnv {
    pub fn from_env() -> Self {
        Self {
            pg_conn_string: std::env::var("PG_CONN_STRING").ok(),
            mqtt_host: std::env::var("MQTT_HOST").ok(),
        }
    }
}

impl PredictorConfig {
    /// Load from the process environment and command line
    pub fn load(cli: &Cli) -> Result<Self> {
        let env = config::Environment::with_prefix("PREDICTOR")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true);
        Self::load_from(cli, env, LegacyEnv::from_env())
    }

    pub fn load_from(cli: &Cli, env: config::Environment, legacy: LegacyEnv) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(url) = legacy.pg_conn_string {
            builder = builder.set_default("postgres.url", url)?;
        }
        if let Some(host) = legacy.mqtt_host {
            builder = builder.set_default("mqtt.host", host)?;
        }

        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        let builder = builder
            .add_source(env)
            .set_override_option("interval_secs", cli.interval)?
            .set_override_option("metrics_port", cli.metrics_port.map(i64::from))?
            .set_override_option("write_back", cli.write_back.then_some(true))?
            .set_override_option("postgres.url", cli.pg.clone())?
            .set_override_option("mqtt.host", cli.mqtt_host.clone())?
            .set_override_option("mqtt.port", cli.mqtt_port.map(i64::from))?
            .set_override_option(
                "models_dir",
                cli.models_dir
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
            )?
            .set_override_option("device_id", cli.device_id.clone())?;

        let config: PredictorConfig = builder
            .build()
            .context("failed to assemble configuration")?
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.interval_secs.is_finite() || self.interval_secs <= 0.0 {
            bail!("interval must be a positive number of seconds");
        }
        if Duration::try_from_secs_f64(self.interval_secs).is_err() {
            bail!("interval of {} seconds is out of range", self.interval_secs);
        }
        for (name, range) in &self.features.ranges {
            if !range.min.is_finite() || !range.max.is_finite() || range.min > range.max {
                bail!(
                    "features.ranges.{} must satisfy min <= max (got {}..{})",
                    name,
                    range.min,
                    range.max
                );
            }
        }
        self.scoring
            .weights
            .validate()
            .map_err(anyhow::Error::msg)?;
        validate_identifier(&self.postgres.table)?;
        if self.mqtt.topic.trim().is_empty() {
            bail!("mqtt topic must not be empty");
        }
        for (name, value) in [
            ("predict_timeout_ms", self.predict_timeout_ms),
            ("postgres.read_timeout_ms", self.postgres.read_timeout_ms),
            ("postgres.write_timeout_ms", self.postgres.write_timeout_ms),
            ("mqtt.publish_timeout_ms", self.mqtt.publish_timeout_ms),
        ] {
            if value == 0 {
                bail!("{} must be positive", name);
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.interval_secs).unwrap_or(DEFAULT_INTERVAL)
    }

    pub fn predict_timeout(&self) -> Duration {
        Duration::from_millis(self.predict_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.postgres.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.postgres.write_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.mqtt.publish_timeout_ms)
    }

    pub fn device(&self) -> DeviceSelector {
        DeviceSelector::from_option(self.device_id.clone())
    }

    pub fn pg_source_config(&self) -> PgSourceConfig {
        PgSourceConfig {
            connection: self.postgres.url.clone(),
            table: self.postgres.table.clone(),
            max_connections: self.postgres.max_connections,
            acquire_timeout: self.read_timeout(),
        }
    }

    pub fn mqtt_config(&self) -> MqttConfig {
        MqttConfig {
            host: self.mqtt.host.clone(),
            port: self.mqtt.port,
            topic: self.mqtt.topic.clone(),
            client_id: self.mqtt.client_id.clone(),
            ..MqttConfig::default()
        }
    }
}
