//! Health tracking for the metering controller
//!
//! Each reconciler reports the outcome of its passes here; the HTTP surface
//! serves the aggregate on `/healthz` and `/readyz`.

use crate::error::MeteringError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health of one reconciler, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Passes fail with errors a later pass may recover from
    Degraded,
    /// A billing invariant was violated
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Failed passes since the last successful one
    pub consecutive_failures: u32,
    pub updated_at: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>, consecutive_failures: u32) -> Self {
        Self {
            status,
            message,
            consecutive_failures,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ComponentStatus::Healthy, None, 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// The worst status among all components; healthy when there are none
    pub fn compute_status(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|health| health.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking, one per reconciler
pub mod components {
    pub const TENANT: &str = "tenant";
    pub const INGESTION: &str = "ingestion";
    pub const BILLING: &str = "billing";
    pub const SAMPLER: &str = "sampler";

    pub const ALL: &[&str] = &[TENANT, INGESTION, BILLING, SAMPLER];
}

#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<String, ComponentHealth>>>,
    synced: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a component as healthy; an already tracked one is kept
    pub async fn register(&self, name: &str) {
        self.components
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(ComponentHealth::healthy);
    }

    async fn transition(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        let mut components = self.components.write().await;
        let failures = match (status, components.get(name)) {
            (ComponentStatus::Healthy, _) => 0,
            (_, Some(previous)) => previous.consecutive_failures.saturating_add(1),
            (_, None) => 1,
        };
        components.insert(
            name.to_string(),
            ComponentHealth::new(status, message, failures),
        );
    }

    pub async fn set_healthy(&self, name: &str) {
        self.transition(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.transition(name, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.transition(name, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    /// Record the outcome of one reconcile pass.
    ///
    /// Conflicts that exhausted their retries and store errors degrade the
    /// component; invariant violations mark it unhealthy until a pass succeeds.
    pub async fn record_pass(&self, name: &str, outcome: Result<(), &MeteringError>) {
        match outcome {
            Ok(()) => self.set_healthy(name).await,
            Err(e) if matches!(e, MeteringError::Invariant(_)) => {
                self.set_unhealthy(name, e.to_string()).await
            }
            Err(e) => self.set_degraded(name, e.to_string()).await,
        }
    }

    /// Mark whether the controller finished its initial resync
    pub async fn set_ready(&self, synced: bool) {
        *self.synced.write().await = synced;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    /// Ready once synced, unless some reconciler hit an invariant violation
    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.synced.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("Controller not yet synced".to_string()),
            };
        }

        let components = self.components.read().await;
        let unhealthy: Vec<&str> = components
            .iter()
            .filter(|(_, health)| health.status == ComponentStatus::Unhealthy)
            .map(|(name, _)| name.as_str())
            .collect();

        if unhealthy.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("Unhealthy: {}", unhealthy.join(", "))),
            }
        }
    }
}
