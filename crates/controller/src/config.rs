//! Controller configuration

use anyhow::Result;
use metering_lib::config::{parse_interval, DEFAULT_SYSTEM_NAMESPACE};
use metering_lib::MeteringConfig;
use serde::Deserialize;
use std::time::Duration;

/// Controller configuration, read from `METERING_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Namespace holding metering records and ledger deductions
    #[serde(default = "default_system_namespace")]
    pub system_namespace: String,

    /// Billing interval in minutes; invalid or zero values fall back to 60
    #[serde(default)]
    pub interval: Option<String>,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// JSON file with objects to load into the store at startup
    #[serde(default)]
    pub seed_path: Option<String>,

    /// Delay before a failed pass is retried, in seconds
    #[serde(default = "default_error_requeue")]
    pub error_requeue_secs: u64,
}

fn default_system_namespace() -> String {
    DEFAULT_SYSTEM_NAMESPACE.to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_error_requeue() -> u64 {
    30
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            system_namespace: default_system_namespace(),
            interval: None,
            api_port: default_api_port(),
            seed_path: None,
            error_requeue_secs: default_error_requeue(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("METERING"))
            .build()?;
        Self::from_config(config)
    }

    pub fn from_config(config: config::Config) -> Result<Self> {
        Ok(config.try_deserialize()?)
    }

    pub fn billing_interval_minutes(&self) -> u32 {
        parse_interval(self.interval.as_deref())
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs.max(1))
    }

    /// Configuration handed to the reconcilers
    pub fn metering_config(&self) -> MeteringConfig {
        MeteringConfig::default()
            .with_system_namespace(self.system_namespace.clone())
            .with_billing_interval(self.billing_interval_minutes())
    }
}
