//! Live predictor - battery predictive-maintenance inference service
//!
//! Periodically reads the latest telemetry row, runs the RUL and failure
//! models, scores battery health and fans the result out to Prometheus,
//! MQTT and (optionally) back into the telemetry table.

use anyhow::{Context, Result};
use clap::Parser;
use predictor_lib::{
    api::{self, AppState},
    health::{components, HealthRegistry},
    observability::{PredictorMetrics, StructuredLogger},
    predictor::{FeatureExtractor, ModelRegistry, Scheduler},
    publish::{MqttSink, ResultPublisher},
    source::{PgTelemetrySource, SourceReader},
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const PREDICTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = config::Cli::parse();
    let config = config::PredictorConfig::load(&cli).context("failed to load configuration")?;
    let device = config.device();
    let logger = StructuredLogger::new(device.to_string());

    let health_registry = HealthRegistry::with_components().await;
    let metrics = PredictorMetrics::new().context("failed to register metrics")?;

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    // Metrics and probes come up first so readiness reflects model loading
    let listener = api::bind(config.metrics_port).await?;
    let app_state = Arc::new(AppState::new(health_registry.clone(), metrics.clone()));
    let mut api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = api_shutdown.recv().await;
        };
        if let Err(e) = api::serve(listener, app_state, shutdown).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    let models = match ModelRegistry::load(&config.models_dir, &config.features.defaults) {
        Ok(models) => models,
        Err(e) => {
            health_registry.set_models_loaded(false).await;
            logger.log_shutdown("model load failed");
            return Err(e).with_context(|| {
                format!("failed to load models from {}", config.models_dir.display())
            });
        }
    };
    health_registry.set_models_loaded(true).await;
    logger.log_models_loaded(models.rul().checksum(), models.failure().checksum());

    let source = Arc::new(
        PgTelemetrySource::connect_lazy(&config.pg_source_config())
            .context("invalid telemetry source configuration")?,
    );
    let reader = Arc::new(
        SourceReader::new(
            source.clone(),
            device,
            metrics.clone(),
            health_registry.clone(),
        )
        .with_timeouts(config.read_timeout(), config.write_timeout()),
    );

    let sink = Arc::new(
        MqttSink::connect(&config.mqtt_config()).context("invalid broker configuration")?,
    );
    let mut publisher = ResultPublisher::new(
        metrics.clone(),
        sink.clone(),
        health_registry.clone(),
        logger.clone(),
    )
    .with_publish_timeout(config.publish_timeout());
    if config.write_back {
        publisher = publisher.with_write_back(reader.clone());
    }

    let scheduler = Scheduler::builder()
        .reader(reader)
        .models(models)
        .publisher(publisher)
        .metrics(metrics.clone())
        .health(health_registry.clone())
        .logger(logger.clone())
        .extractor(FeatureExtractor::new(&config.features))
        .scoring(config.scoring.clone())
        .interval(config.interval())
        .predict_timeout(config.predict_timeout())
        .build()?;

    logger.log_startup(PREDICTOR_VERSION, config.interval_secs, config.write_back);

    let scheduler_shutdown = shutdown_tx.subscribe();
    let signal_tx = shutdown_tx.clone();
    let signal_logger = logger.clone();
    tokio::spawn(async move {
        let reason = wait_for_signal().await;
        signal_logger.log_shutdown(reason);
        let _ = signal_tx.send(());
    });

    let result = scheduler.run(scheduler_shutdown).await;

    // Stop the metrics server and release connections
    let _ = shutdown_tx.send(());
    sink.disconnect().await;
    source.close().await;
    if let Err(e) = api_handle.await {
        error!(error = %e, "Metrics server task panicked");
    }

    match result {
        Ok(()) => {
            info!("Live predictor stopped");
            Ok(())
        }
        Err(e) => {
            health_registry
                .set_unhealthy(components::SCHEDULER, e.to_string())
                .await;
            logger.log_shutdown("fatal cycle failure");
            Err(e).context("scheduler stopped on a fatal error")
        }
    }
}

/// Resolves on SIGINT or SIGTERM with a description of the signal
async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT received",
                _ = terminate.recv() => "SIGTERM received",
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT received"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT received"
    }
}
