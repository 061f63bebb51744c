//! Metering Controller - tenant metering and billing aggregation
//!
//! Runs the tenant lifecycle, usage sampling, ingestion and billing
//! reconcilers against the object store and serves health, metrics and
//! read-only metering views over HTTP.

use anyhow::Result;
use metering_lib::{
    api,
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    reconcile::{self, Context},
    store::{MemoryStore, ObjectStore},
    Controller,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod seed;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting metering-controller");

    // Load configuration
    let config = config::ControllerConfig::load()?;
    let metering_config = config.metering_config();
    info!(
        system_namespace = %metering_config.system_namespace,
        interval_minutes = metering_config.billing_interval_minutes,
        "Controller configured"
    );

    // Standalone store, optionally seeded
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    if let Some(path) = &config.seed_path {
        let created = seed::Seed::load(path).await?.apply(&store).await?;
        info!(path = %path, objects = created, "Store seeded");
    }

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    for component in components::ALL {
        health_registry.register(component).await;
    }

    // Initialize structured logger
    let logger = StructuredLogger::new("metering-controller");
    logger.log_startup(
        CONTROLLER_VERSION,
        &metering_config.system_namespace,
        metering_config.billing_interval_minutes,
    );

    // Wire reconcilers into the controller
    let ctx = Context::new(store.clone(), metering_config.clone()).with_logger(logger.clone());
    let controller = reconcile::all(&ctx).into_iter().fold(
        Controller::new(store.clone(), health_registry.clone())
            .error_requeue(config.error_requeue())
            .logger(logger.clone()),
        Controller::register,
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let controller_handle = tokio::spawn(controller.run(shutdown_tx.subscribe()));

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(
        health_registry,
        store,
        ctx.config.clone(),
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    let _ = shutdown_tx.send(());
    controller_handle.await?;
    api_handle.abort();
    info!("Shutting down");

    Ok(())
}
