//! Cluster objects read by the controller and sampler declarations

use super::{impl_resource, ObjectMeta, Quantity, ResourceName, OWNER_ANNOTATION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Tenant namespace as delivered by the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub metadata: ObjectMeta,
}

impl_resource!(Namespace, "Namespace");

impl Namespace {
    /// Owner identity, present only on billable tenant namespaces
    pub fn owner(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(OWNER_ANNOTATION)
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    pub limits: BTreeMap<ResourceName, Quantity>,
    pub requests: BTreeMap<ResourceName, Quantity>,
}

impl ResourceRequirements {
    /// The limit for `resource`, falling back to the request
    pub fn billable(&self, resource: &str) -> Option<Quantity> {
        self.limits
            .get(resource)
            .or_else(|| self.requests.get(resource))
            .copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodStatus {
    pub phase: PodPhase,
}

/// Workload instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl_resource!(Pod, "Pod");

impl Pod {
    pub fn is_running(&self) -> bool {
        self.status.phase == PodPhase::Running
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceQuotaSpec {
    pub hard: BTreeMap<String, Quantity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceQuotaStatus {
    pub hard: BTreeMap<String, Quantity>,
    pub used: BTreeMap<String, Quantity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ResourceQuotaSpec,
    #[serde(default)]
    pub status: ResourceQuotaStatus,
}

impl_resource!(ResourceQuota, "ResourceQuota");

/// Price of one resource kind: `price` minor units per `unit`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePrice {
    pub unit: Quantity,
    pub price: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub describe: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSamplerSpec {
    /// Short name used when naming published usage records
    pub resource_name: String,
    pub interval_minutes: u32,
    pub resources: BTreeMap<ResourceName, ResourcePrice>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkloadSamplerStatus {
    pub last_sample_timestamp: i64,
    pub sequence_id: u64,
}

/// Declares which workload resources are sampled, at what price and cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSampler {
    pub metadata: ObjectMeta,
    pub spec: WorkloadSamplerSpec,
    #[serde(default)]
    pub status: WorkloadSamplerStatus,
}

impl_resource!(WorkloadSampler, "WorkloadSampler");

impl WorkloadSampler {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.spec.interval_minutes.max(1)) * 60)
    }

    /// Time left before the next sampling pass; `None` when due
    pub fn time_until_due(&self, now: i64) -> Option<Duration> {
        let elapsed = now.saturating_sub(self.status.last_sample_timestamp);
        let interval = self.interval().as_secs() as i64;
        if elapsed >= interval {
            None
        } else {
            Some(Duration::from_secs((interval - elapsed) as u64))
        }
    }
}

/// Object kinds a price table entry applies to
pub const POD_OBJECT_KINDS: &[&str] = &["v1/Pod"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTableSpec {
    pub resource_name: String,
    pub resources: BTreeMap<ResourceName, ResourcePrice>,
    pub applicable_kinds: Vec<String>,
}

/// Advertises a sampler's resource kinds to pricing-aware consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTableEntry {
    pub metadata: ObjectMeta,
    pub spec: PriceTableSpec,
}

impl_resource!(PriceTableEntry, "PriceTableEntry");
