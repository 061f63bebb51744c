//! Tenant metering and billing library
//!
//! This crate provides the core functionality for:
//! - Provisioning metering records for tenant namespaces
//! - Sampling workload usage and pricing it
//! - Folding usage into per-tenant accumulators
//! - Closing billing periods and emitting ledger deductions
//! - Health checks and observability

pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod reconcile;
pub mod runtime;
pub mod store;

pub use config::MeteringConfig;
pub use error::{InvariantViolation, MeteringError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use observability::{MeteringMetrics, StructuredLogger};
pub use reconcile::{Action, Context, Reconciler};
pub use runtime::Controller;
pub use store::{Api, MemoryStore, ObjectKey, ObjectStore, RetryPolicy};
