//! Observability infrastructure for the metering controller
//!
//! Provides:
//! - Prometheus metrics (reconcile passes and latency, conflict retries, billed amounts)
//! - Structured JSON logging of billing events with tracing

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for reconcile pass latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MeteringMetricsInner> = OnceLock::new();

struct MeteringMetricsInner {
    reconcile_passes: IntCounterVec,
    reconcile_latency_seconds: HistogramVec,
    conflict_retries: IntCounterVec,
    billed_amount: IntCounter,
    ledger_deductions: IntCounter,
    usage_records_folded: IntCounter,
    usage_records_published: IntCounter,
    metered_tenants: IntGauge,
}

impl MeteringMetricsInner {
    fn new() -> Self {
        Self {
            reconcile_passes: register_int_counter_vec!(
                "metering_reconcile_passes_total",
                "Reconcile passes by component and result",
                &["component", "result"]
            )
            .expect("Failed to register reconcile_passes"),

            reconcile_latency_seconds: register_histogram_vec!(
                "metering_reconcile_latency_seconds",
                "Time spent in one reconcile pass",
                &["component"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_latency_seconds"),

            conflict_retries: register_int_counter_vec!(
                "metering_conflict_retries_total",
                "Read-modify-write attempts retried after a version conflict",
                &["kind"]
            )
            .expect("Failed to register conflict_retries"),

            billed_amount: register_int_counter!(
                "metering_billed_amount_total",
                "Sum of closed billing period amounts in minor units"
            )
            .expect("Failed to register billed_amount"),

            ledger_deductions: register_int_counter!(
                "metering_ledger_deductions_total",
                "Ledger deduction objects created"
            )
            .expect("Failed to register ledger_deductions"),

            usage_records_folded: register_int_counter!(
                "metering_usage_records_folded_total",
                "Usage records folded into metering accumulators"
            )
            .expect("Failed to register usage_records_folded"),

            usage_records_published: register_int_counter!(
                "metering_usage_records_published_total",
                "Usage records published by samplers"
            )
            .expect("Failed to register usage_records_published"),

            metered_tenants: register_int_gauge!(
                "metering_tenants",
                "Tenant namespaces with a metering record"
            )
            .expect("Failed to register metered_tenants"),
        }
    }
}

/// Handle to the process-wide metering metrics.
///
/// Clones share the same underlying Prometheus collectors.
#[derive(Clone)]
pub struct MeteringMetrics {
    _private: (),
}

impl Default for MeteringMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MeteringMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MeteringMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MeteringMetricsInner {
        GLOBAL_METRICS.get_or_init(MeteringMetricsInner::new)
    }

    /// Record the outcome and duration of a reconcile pass
    pub fn observe_pass(&self, component: &str, result: &str, duration_secs: f64) {
        self.inner()
            .reconcile_passes
            .with_label_values(&[component, result])
            .inc();
        self.inner()
            .reconcile_latency_seconds
            .with_label_values(&[component])
            .observe(duration_secs);
    }

    pub fn inc_conflict_retries(&self, kind: &str) {
        self.inner().conflict_retries.with_label_values(&[kind]).inc();
    }

    /// Add a closed period's amount; negative amounts are never billed
    pub fn add_billed_amount(&self, amount: i64) {
        if amount > 0 {
            self.inner().billed_amount.inc_by(amount as u64);
        }
    }

    pub fn inc_ledger_deductions(&self) {
        self.inner().ledger_deductions.inc();
    }

    pub fn inc_usage_records_folded(&self) {
        self.inner().usage_records_folded.inc();
    }

    pub fn inc_usage_records_published(&self) {
        self.inner().usage_records_published.inc();
    }

    /// Set the metered tenant gauge from a count of stored metering records
    pub fn set_metered_tenants(&self, count: usize) {
        self.inner()
            .metered_tenants
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }
}

/// Structured logger for billing events
///
/// Provides consistent JSON-formatted logging for tenant lifecycle,
/// ingestion and billing events.
#[derive(Clone)]
pub struct StructuredLogger {
    controller: String,
}

impl StructuredLogger {
    pub fn new(controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
        }
    }

    pub fn log_tenant_provisioned(&self, namespace: &str, owner: &str, interval_minutes: u32) {
        info!(
            event = "tenant_provisioned",
            controller = %self.controller,
            namespace = %namespace,
            owner = %owner,
            interval_minutes = interval_minutes,
            "Metering record created for tenant"
        );
    }

    pub fn log_tenant_removed(&self, namespace: &str) {
        info!(
            event = "tenant_removed",
            controller = %self.controller,
            namespace = %namespace,
            "Metering record removed for tenant"
        );
    }

    pub fn log_usage_folded(&self, record: &str, metering: &str, resources: usize) {
        info!(
            event = "usage_folded",
            controller = %self.controller,
            record = %record,
            metering = %metering,
            resources = resources,
            "Usage folded into accumulator"
        );
    }

    /// Log a closed billing period
    pub fn log_period_closed(
        &self,
        metering: &str,
        owner: &str,
        sequence_id: u64,
        amount: i64,
        rolled_to_daily: Option<i64>,
    ) {
        info!(
            event = "period_closed",
            controller = %self.controller,
            metering = %metering,
            owner = %owner,
            sequence_id = sequence_id,
            amount = amount,
            daily_rollover = ?rolled_to_daily,
            "Billing period closed"
        );
    }

    pub fn log_deduction_emitted(&self, name: &str, owner: &str, amount: i64, resumed: bool) {
        info!(
            event = "deduction_emitted",
            controller = %self.controller,
            deduction = %name,
            owner = %owner,
            amount = amount,
            resumed = resumed,
            "Ledger deduction requested"
        );
    }

    pub fn log_usage_published(&self, sampler: &str, tenants: usize, sequence_id: u64) {
        info!(
            event = "usage_published",
            controller = %self.controller,
            sampler = %sampler,
            tenants = tenants,
            sequence_id = sequence_id,
            "Usage sampling pass complete"
        );
    }

    /// Log an invariant violation that aborted a pass
    pub fn log_invariant_violation(&self, component: &str, key: &str, details: &str) {
        error!(
            event = "invariant_violation",
            controller = %self.controller,
            component = %component,
            key = %key,
            details = %details,
            "Invariant violated, pass aborted"
        );
    }

    pub fn log_startup(&self, version: &str, system_namespace: &str, interval_minutes: u32) {
        info!(
            event = "controller_started",
            controller = %self.controller,
            version = %version,
            system_namespace = %system_namespace,
            interval_minutes = interval_minutes,
            "Metering controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        warn!(
            event = "controller_shutdown",
            controller = %self.controller,
            reason = %reason,
            "Metering controller shutting down"
        );
    }
}
