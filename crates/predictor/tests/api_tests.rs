//! Integration tests for the predictor HTTP endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use predictor_lib::{
    api::{self, create_router, AppState},
    health::{components, HealthRegistry},
    models::{RiskCategory, TelemetryRecord},
    observability::{PredictorMetrics, StructuredLogger},
    predictor::{ModelRegistry, Scheduler},
    publish::{RecordingSink, ResultPublisher},
    source::{DeviceSelector, InMemorySource, SourceReader},
    Stage,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::with_components().await;
    let metrics = PredictorMetrics::new().unwrap();
    let state = Arc::new(AppState::new(health_registry, metrics));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let (status, body) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

/// Linear model artifacts for both slots, with constant outputs
fn write_models(dir: &std::path::Path, rul: f64, failure_probability: f64) {
    let features = ["soc", "soh", "battery_temperature"];
    for (slot, intercept) in [("rul", rul), ("failure", failure_probability)] {
        let meta = serde_json::json!({
            "feature_names": features,
            "trained_at": "2024-06-01T00:00:00Z",
            "target": slot,
        });
        std::fs::write(dir.join(format!("{slot}_meta.json")), meta.to_string()).unwrap();
        let model = serde_json::json!({
            "intercept": intercept,
            "coefficients": [0.0, 0.0, 0.0],
        });
        std::fs::write(dir.join(format!("{slot}_model.json")), model.to_string()).unwrap();
    }
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    for name in ["source", "broker", "models", "scheduler"] {
        assert!(health["components"][name].is_object(), "missing {}", name);
    }
}

#[tokio::test]
async fn test_healthz_reports_degraded_source() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .record_failure(components::SOURCE, "connection refused")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    // Degraded is still operational
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["components"]["source"]["consecutive_failures"], 1);
    assert_eq!(
        health["components"]["source"]["message"],
        "connection refused"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::SCHEDULER, "feature vector has 9 values")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_before_models_load() {
    let (app, _state) = setup_test_app().await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
    assert_eq!(readiness["reason"], "Models not yet loaded");
}

#[tokio::test]
async fn test_readyz_returns_ok_after_models_load() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_models_loaded(true).await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    for name in [
        "predictions_emitted_total",
        "last_rul_value",
        "last_failure_probability",
        "prediction_latency_seconds",
        "db_query_errors_total",
        "broker_publish_errors_total",
    ] {
        assert!(metrics_text.contains(name), "missing {}", name);
    }
}

#[tokio::test]
async fn test_cycles_are_visible_on_metrics_endpoint() {
    let dir = TempDir::new().unwrap();
    write_models(dir.path(), 420.0, 0.3);
    let models = ModelRegistry::load(dir.path(), &Default::default()).unwrap();

    let (app, state) = setup_test_app().await;
    state.health_registry.set_models_loaded(true).await;

    let record = TelemetryRecord {
        soc: Some(85.0),
        soh: Some(95.0),
        battery_temperature: Some(25.0),
        ..TelemetryRecord::empty(Utc::now())
    };
    let source = Arc::new(InMemorySource::with_record(record));
    source
        .fail_next_read(predictor_lib::ReadError::ConnectionUnavailable(
            "refused".into(),
        ))
        .await;

    let reader = Arc::new(SourceReader::new(
        source,
        DeviceSelector::Default,
        state.metrics.clone(),
        state.health_registry.clone(),
    ));
    let sink = Arc::new(RecordingSink::new());
    let publisher = ResultPublisher::new(
        state.metrics.clone(),
        sink.clone(),
        state.health_registry.clone(),
        StructuredLogger::new("ev-001"),
    );
    let scheduler = Scheduler::builder()
        .reader(reader)
        .models(models)
        .publisher(publisher)
        .metrics(state.metrics.clone())
        .health(state.health_registry.clone())
        .build()
        .unwrap();

    assert_eq!(scheduler.tick().await.failed_stage(), Some(Stage::Read));
    assert!(scheduler.tick().await.is_success());

    let messages = sink.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].rul, 420.0);
    assert_eq!(messages[0].risk_category, RiskCategory::Medium);

    let (status, body) = get(app.clone(), "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("predictions_emitted_total 1"));
    assert!(text.contains("last_rul_value 420"));
    assert!(text.contains("db_query_errors_total 1"));
    assert!(text.contains("cycle_failures_total{stage=\"read\"} 1"));

    let (status, health) = get_json(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["components"]["source"]["status"], "healthy");
}

#[tokio::test]
async fn test_bind_fails_when_port_is_taken() {
    let first = api::bind(0).await.unwrap();
    let port = first.local_addr().unwrap().port();

    let err = api::bind(port).await.unwrap_err();
    assert!(err.to_string().contains(&port.to_string()));
}

#[tokio::test]
async fn test_serve_answers_on_bound_listener_until_shutdown() {
    let (_app, state) = setup_test_app().await;
    let listener = api::bind(0).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(api::serve(listener, state, async move {
        let _ = stop_rx.await;
    }));

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got {}", response);

    stop_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}
