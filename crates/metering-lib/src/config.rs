//! Configuration shared by the reconcilers
//!
//! One [`MeteringConfig`] is built at startup and handed to every
//! reconciler; nothing reads the environment after that.

use crate::models::{Quantity, QUOTA_STORAGE_KEY};
use crate::store::RetryPolicy;
use std::collections::BTreeMap;
use tracing::warn;

pub const DEFAULT_SYSTEM_NAMESPACE: &str = "metering-system";
pub const DEFAULT_BILLING_INTERVAL_MINUTES: u32 = 60;

#[derive(Debug, Clone)]
pub struct MeteringConfig {
    /// Namespace holding metering records, usage records and deductions
    pub system_namespace: String,
    pub billing_interval_minutes: u32,
    /// Bound on optimistic-concurrency retries
    pub retry: RetryPolicy,
    /// Hard limits written to every tenant quota
    pub default_quota: BTreeMap<String, Quantity>,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            billing_interval_minutes: DEFAULT_BILLING_INTERVAL_MINUTES,
            retry: RetryPolicy::default(),
            default_quota: default_quota(),
        }
    }
}

impl MeteringConfig {
    pub fn with_system_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.system_namespace = namespace.into();
        self
    }

    pub fn with_billing_interval(mut self, minutes: u32) -> Self {
        self.billing_interval_minutes = if minutes == 0 {
            DEFAULT_BILLING_INTERVAL_MINUTES
        } else {
            minutes
        };
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_default_quota(mut self, quota: BTreeMap<String, Quantity>) -> Self {
        self.default_quota = quota;
        self
    }
}

/// Parse the configured billing interval in minutes.
///
/// Missing, empty, non-numeric and zero values all fall back to the default.
pub fn parse_interval(raw: Option<&str>) -> u32 {
    let raw = match raw.map(str::trim) {
        Some(value) if !value.is_empty() => value,
        _ => return DEFAULT_BILLING_INTERVAL_MINUTES,
    };

    match raw.parse::<u32>() {
        Ok(0) => {
            warn!(value = raw, "Billing interval of zero, using default");
            DEFAULT_BILLING_INTERVAL_MINUTES
        }
        Ok(minutes) => minutes,
        Err(e) => {
            warn!(value = raw, error = %e, "Invalid billing interval, using default");
            DEFAULT_BILLING_INTERVAL_MINUTES
        }
    }
}

/// Quota applied to new tenants
pub fn default_quota() -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("limits.cpu".to_string(), Quantity::from_units(16)),
        ("limits.memory".to_string(), Quantity::from_units(64 << 30)),
        (QUOTA_STORAGE_KEY.to_string(), Quantity::from_units(100 << 30)),
        ("persistentvolumeclaims".to_string(), Quantity::from_units(20)),
        ("pods".to_string(), Quantity::from_units(100)),
    ])
}
