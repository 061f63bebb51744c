//! HTTP API for health checks, Prometheus metrics and read-only metering views

use crate::config::MeteringConfig;
use crate::error::MeteringError;
use crate::health::{ComponentStatus, HealthRegistry};
use crate::models::{metering_name, BillingEntry, Metering, ResourceInfo, ResourceName};
use crate::store::{Api, ObjectKey, ObjectStore};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub store: Arc<dyn ObjectStore>,
    pub config: Arc<MeteringConfig>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        store: Arc<dyn ObjectStore>,
        config: Arc<MeteringConfig>,
    ) -> Self {
        Self {
            health_registry,
            store,
            config,
        }
    }

    fn meterings(&self) -> Api<Metering> {
        Api::new(self.store.clone())
    }
}

/// Compact view of a metering record
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeteringSummary {
    pub namespace: String,
    pub owner: String,
    pub interval_minutes: u32,
    pub accumulated_cost: i64,
    pub total_amount: i64,
    pub sequence_id: u64,
    pub last_billing_timestamp: i64,
    pub pending_deduction: bool,
}

impl From<&Metering> for MeteringSummary {
    fn from(metering: &Metering) -> Self {
        Self {
            namespace: metering.spec.namespace.clone(),
            owner: metering.spec.owner.clone(),
            interval_minutes: metering.spec.interval_minutes,
            accumulated_cost: metering.status.accumulated_cost(),
            total_amount: metering.status.total_amount,
            sequence_id: metering.status.sequence_id,
            last_billing_timestamp: metering.status.last_billing_timestamp,
            pending_deduction: metering.status.pending_deduction.is_some(),
        }
    }
}

/// Full view of one tenant's metering record
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeteringDetail {
    #[serde(flatten)]
    pub summary: MeteringSummary,
    pub accumulator: BTreeMap<ResourceName, ResourceInfo>,
    pub billing_hourly: Vec<BillingEntry>,
    pub billing_daily: Vec<BillingEntry>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn store_error(e: MeteringError) -> Response {
    error!(error = %e, "Store read failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 once the controller has synced
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn list_meterings(State(state): State<Arc<AppState>>) -> Response {
    match state
        .meterings()
        .list(Some(&state.config.system_namespace))
        .await
    {
        Ok(meterings) => {
            let summaries: Vec<MeteringSummary> =
                meterings.iter().map(MeteringSummary::from).collect();
            Json(summaries).into_response()
        }
        Err(e) => store_error(e),
    }
}

async fn get_metering(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
) -> Response {
    let key = ObjectKey::namespaced(&state.config.system_namespace, metering_name(&namespace));
    match state.meterings().get_opt(&key).await {
        Ok(Some(metering)) => Json(MeteringDetail {
            summary: MeteringSummary::from(&metering),
            accumulator: metering.status.accumulator,
            billing_hourly: metering.status.billing_hourly,
            billing_daily: metering.status.billing_daily,
        })
        .into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            format!("no metering record for namespace {namespace}"),
        ),
        Err(e) => store_error(e),
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/meterings", get(list_meterings))
        .route("/api/v1/meterings/:namespace", get(get_metering))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
