//! Workload usage sampler
//!
//! On every pass the sampler's price table entry is upserted. When the
//! sampling interval has elapsed, running pods in tenant namespaces are
//! priced and aggregated into one usage record per tenant. Storage is not
//! read from pods but once per tenant from its quota.
//!
//! Usage records are named after the sampler's current sequence and created
//! before that sequence advances, so a failed pass retries with the same
//! names and skips what it already published.

use super::pricing::{cost_of, Rounding};
use super::{Action, Context, Reconciler};
use crate::error::Result;
use crate::health::components;
use crate::models::{
    price_entry_name, quota_name, usage_record_name, Namespace, ObjectMeta, Pod,
    PriceTableEntry, PriceTableSpec, Quantity, Resource, ResourceInfo, ResourceName,
    ResourceQuota, ResourceUsage, ResourceUsageSpec, ResourceUsageStatus, WorkloadSampler,
    POD_OBJECT_KINDS, QUOTA_STORAGE_KEY, STORAGE_RESOURCE,
};
use crate::store::{ObjectKey, OperationResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Per tenant namespace, per resource kind
type TenantUsage = BTreeMap<String, BTreeMap<ResourceName, ResourceInfo>>;

pub struct SamplerReconciler {
    ctx: Context,
}

impl SamplerReconciler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    async fn upsert_price_entry(&self, sampler: &WorkloadSampler) -> Result<()> {
        let desired = PriceTableSpec {
            resource_name: sampler.spec.resource_name.clone(),
            resources: sampler.spec.resources.clone(),
            applicable_kinds: POD_OBJECT_KINDS.iter().map(|k| k.to_string()).collect(),
        };
        let template = PriceTableEntry {
            metadata: ObjectMeta::namespaced(
                &self.ctx.config.system_namespace,
                price_entry_name(&sampler.metadata.name),
            ),
            spec: desired.clone(),
        };

        let op = self
            .ctx
            .api::<PriceTableEntry>()
            .create_or_update(&template, &self.ctx.config.retry, |entry| {
                entry.spec = desired.clone();
            })
            .await?;
        if op != OperationResult::Unchanged {
            info!(sampler = %sampler.metadata.name, operation = ?op, "Price table entry reconciled");
        }
        Ok(())
    }

    /// Billable tenant namespaces mapped to their owners
    async fn tenants(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .ctx
            .api::<Namespace>()
            .list(None)
            .await?
            .into_iter()
            .filter(|ns| !ns.metadata.is_deleting())
            .filter_map(|ns| {
                let owner = ns.owner()?.to_string();
                Some((ns.metadata.name, owner))
            })
            .collect())
    }

    async fn sample_pods(
        &self,
        sampler: &WorkloadSampler,
        tenants: &BTreeMap<String, String>,
        now: i64,
        usage: &mut TenantUsage,
    ) -> Result<()> {
        for pod in self.ctx.api::<Pod>().list(None).await? {
            if !pod.is_running() || !tenants.contains_key(pod.namespace()) {
                continue;
            }

            for container in &pod.spec.containers {
                for (resource, price) in &sampler.spec.resources {
                    if resource == STORAGE_RESOURCE {
                        continue;
                    }
                    let Some(used) = container.resources.billable(resource) else {
                        continue;
                    };
                    let cost = cost_of(resource, used, price, Rounding::Floor)?;
                    add_usage(usage, pod.namespace(), resource, used, cost, now);
                }
            }
        }
        Ok(())
    }

    /// Storage comes from each tenant's quota usage snapshot, rounded up
    async fn sample_storage(
        &self,
        sampler: &WorkloadSampler,
        tenants: &BTreeMap<String, String>,
        now: i64,
        usage: &mut TenantUsage,
    ) -> Result<()> {
        let Some(price) = sampler.spec.resources.get(STORAGE_RESOURCE) else {
            return Ok(());
        };

        let quotas = self.ctx.api::<ResourceQuota>();
        for namespace in tenants.keys() {
            let key = ObjectKey::namespaced(namespace, quota_name(namespace));
            let Some(quota) = quotas.get_opt(&key).await? else {
                warn!(namespace = %namespace, "Tenant quota missing, storage not sampled");
                continue;
            };
            let Some(used) = quota.status.used.get(QUOTA_STORAGE_KEY).copied() else {
                continue;
            };
            if used.is_zero() {
                continue;
            }
            let cost = cost_of(STORAGE_RESOURCE, used, price, Rounding::Ceil)?;
            add_usage(usage, namespace, STORAGE_RESOURCE, used, cost, now);
        }
        Ok(())
    }

    /// Create one usage record per tenant; existing names count as published
    async fn publish(&self, sampler: &WorkloadSampler, usage: TenantUsage) -> Result<usize> {
        let api = self.ctx.api::<ResourceUsage>();
        let sequence_id = sampler.status.sequence_id;
        let sampler_name = if sampler.spec.resource_name.is_empty() {
            sampler.metadata.name.as_str()
        } else {
            sampler.spec.resource_name.as_str()
        };

        let mut published = 0;
        for (namespace, resources) in usage {
            if resources.is_empty() {
                continue;
            }
            let record = ResourceUsage {
                metadata: ObjectMeta::namespaced(
                    &self.ctx.config.system_namespace,
                    usage_record_name(&namespace, sampler_name, sequence_id),
                ),
                spec: ResourceUsageSpec {
                    target_namespace: namespace,
                    resources,
                },
                status: ResourceUsageStatus::default(),
            };

            match api.create(&record).await {
                Ok(_) => {
                    published += 1;
                    self.ctx.metrics.inc_usage_records_published();
                }
                Err(e) if e.is_already_exists() => {
                    debug!(record = %record.metadata.name, "Usage record already published");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(published)
    }
}

fn add_usage(
    usage: &mut TenantUsage,
    namespace: &str,
    resource: &str,
    used: Quantity,
    cost: i64,
    now: i64,
) {
    let incoming = ResourceInfo::new(used, cost, now, namespace);
    let resources = usage.entry(namespace.to_string()).or_default();
    match resources.get_mut(resource) {
        Some(existing) => existing.merge(&incoming),
        None => {
            resources.insert(resource.to_string(), incoming);
        }
    }
}

#[async_trait]
impl Reconciler for SamplerReconciler {
    fn kind(&self) -> &'static str {
        WorkloadSampler::KIND
    }

    fn component(&self) -> &'static str {
        components::SAMPLER
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(sampler) = self.ctx.api::<WorkloadSampler>().get_opt(key).await? else {
            return Ok(Action::AwaitChange);
        };
        if sampler.metadata.is_deleting() {
            return Ok(Action::AwaitChange);
        }

        self.upsert_price_entry(&sampler).await?;

        let now = self.ctx.now();
        if let Some(remaining) = sampler.time_until_due(now) {
            return Ok(Action::Requeue(remaining));
        }

        let tenants = self.tenants().await?;
        let mut usage = TenantUsage::new();
        self.sample_pods(&sampler, &tenants, now, &mut usage).await?;
        self.sample_storage(&sampler, &tenants, now, &mut usage).await?;

        let tenant_count = usage.len();
        let published = self.publish(&sampler, usage).await?;

        let sequence_id = sampler.status.sequence_id;
        self.ctx
            .api::<WorkloadSampler>()
            .modify_status(key, &self.ctx.config.retry, |current| {
                // Another pass already advanced past this sequence
                if current.status.sequence_id != sequence_id {
                    return Ok(None);
                }
                current.status.sequence_id += 1;
                current.status.last_sample_timestamp = now;
                Ok(Some(()))
            })
            .await?;

        debug!(sampler = %key, tenants = tenant_count, published, "Sampling pass finished");
        self.ctx
            .logger
            .log_usage_published(&sampler.metadata.name, published, sequence_id);

        Ok(Action::Requeue(sampler.interval()))
    }
}
