//! Liveness and readiness tracking
//!
//! Each external dependency of the predictor (telemetry source, broker)
//! reports the outcome of every call here, next to the model and scheduler
//! state. The HTTP probes render the aggregated view.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Component names for health tracking
pub mod components {
    pub const SOURCE: &str = "source";
    pub const BROKER: &str = "broker";
    pub const MODELS: &str = "models";
    pub const SCHEDULER: &str = "scheduler";

    pub const ALL: [&str; 4] = [SOURCE, BROKER, MODELS, SCHEDULER];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Calls are failing but the predictor keeps cycling
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Failures since the last successful call
    #[serde(default)]
    pub consecutive_failures: u32,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>, consecutive_failures: u32) -> Self {
        Self {
            status,
            message,
            consecutive_failures,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ComponentStatus::Healthy, None, 0)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Unhealthy, Some(message.into()), 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let mut overall = ComponentStatus::Healthy;
        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => overall = ComponentStatus::Degraded,
                ComponentStatus::Healthy => {}
            }
        }
        overall
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct HealthState {
    components: HashMap<String, ComponentHealth>,
    models_loaded: bool,
}

/// Shared health view of the predictor
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every predictor component registered as healthy
    pub async fn with_components() -> Self {
        let registry = Self::new();
        for name in components::ALL {
            registry.register(name).await;
        }
        registry
    }

    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), health);
    }

    /// A call to `name` succeeded
    pub async fn record_success(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    /// A call to `name` failed; the component stays operational but degraded
    pub async fn record_failure(&self, name: &str, message: impl Into<String>) {
        let mut state = self.state.write().await;
        let failures = state
            .components
            .get(name)
            .map_or(0, |c| c.consecutive_failures)
            .saturating_add(1);
        state.components.insert(
            name.to_string(),
            ComponentHealth::new(ComponentStatus::Degraded, Some(message.into()), failures),
        );
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Both models are loaded; the predictor can serve
    pub async fn set_models_loaded(&self, loaded: bool) {
        let mut state = self.state.write().await;
        state.models_loaded = loaded;
        let health = if loaded {
            ComponentHealth::healthy()
        } else {
            ComponentHealth::unhealthy("Models not loaded")
        };
        state
            .components
            .insert(components::MODELS.to_string(), health);
    }

    pub async fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.state.read().await.components.get(name).cloned()
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.state.read().await.components.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let models_loaded = self.state.read().await.models_loaded;
        let health = self.health().await;

        let reason = if !models_loaded {
            Some("Models not yet loaded".to_string())
        } else if !health.status.is_operational() {
            Some("Critical component unhealthy".to_string())
        } else {
            None
        };
        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_with_components_registers_all() {
        let registry = HealthRegistry::with_components().await;
        let health = registry.health().await;
        assert_eq!(health.components.len(), 4);
        assert_eq!(health.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_source_outage_degrades_then_recovers() {
        let registry = HealthRegistry::with_components().await;
        registry
            .record_failure(components::SOURCE, "connection refused")
            .await;
        registry
            .record_failure(components::SOURCE, "connection refused")
            .await;

        let source = registry.component(components::SOURCE).await.unwrap();
        assert_eq!(source.status, ComponentStatus::Degraded);
        assert_eq!(source.consecutive_failures, 2);
        assert_eq!(source.message.as_deref(), Some("connection refused"));
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry.record_success(components::SOURCE).await;
        let source = registry.component(components::SOURCE).await.unwrap();
        assert_eq!(source.consecutive_failures, 0);
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_unhealthy_component_wins() {
        let registry = HealthRegistry::with_components().await;
        registry.record_failure(components::BROKER, "publish failed").await;
        registry
            .set_unhealthy(components::SCHEDULER, "schema mismatch")
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        assert!(!health.status.is_operational());
    }

    #[tokio::test]
    async fn test_not_ready_before_models_load() {
        let registry = HealthRegistry::with_components().await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Models not yet loaded"));
    }

    #[tokio::test]
    async fn test_ready_once_models_load() {
        let registry = HealthRegistry::with_components().await;
        registry.set_models_loaded(true).await;
        assert!(registry.readiness().await.ready);

        // A degraded broker does not take the predictor out of service
        registry.record_failure(components::BROKER, "timeout").await;
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_not_ready_when_scheduler_stopped() {
        let registry = HealthRegistry::with_components().await;
        registry.set_models_loaded(true).await;
        registry.set_unhealthy(components::SCHEDULER, "stopped").await;
        assert!(!registry.readiness().await.ready);
    }
}
