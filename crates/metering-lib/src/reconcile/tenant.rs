//! Tenant lifecycle
//!
//! Provisions the quota and metering record of a billable namespace and
//! removes the metering record once the namespace goes away.

use super::{Action, Context, Reconciler};
use crate::error::{Result, ResultExt};
use crate::health::components;
use crate::models::{
    quota_name, Metering, MeteringSpec, MeteringStatus, Namespace, ObjectMeta, Resource,
    ResourceQuota, ResourceQuotaSpec, ResourceQuotaStatus,
};
use crate::store::{ObjectKey, OperationResult};
use async_trait::async_trait;
use tracing::{debug, info};

pub struct TenantReconciler {
    ctx: Context,
}

impl TenantReconciler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Create-if-absent the tenant quota, forcing its hard limits to the default policy
    async fn ensure_quota(&self, namespace: &str) -> Result<()> {
        let template = ResourceQuota {
            metadata: ObjectMeta::namespaced(namespace, quota_name(namespace)),
            spec: ResourceQuotaSpec::default(),
            status: ResourceQuotaStatus::default(),
        };
        let hard = &self.ctx.config.default_quota;

        let op = self
            .ctx
            .api::<ResourceQuota>()
            .create_or_update(&template, &self.ctx.config.retry, |quota| {
                quota.spec.hard = hard.clone();
            })
            .await?;

        if op != OperationResult::Unchanged {
            info!(namespace = %namespace, operation = ?op, "Tenant quota reconciled");
        }
        Ok(())
    }

    /// Create the metering record unless one exists; an existing record is left untouched
    async fn ensure_metering(&self, namespace: &str, owner: &str) -> Result<()> {
        let api = self.ctx.api::<Metering>();
        let key = self.ctx.metering_key(namespace);
        if api.get_opt(&key).await?.is_some() {
            debug!(namespace = %namespace, "Metering record already present");
            return Ok(());
        }

        let interval_minutes = self.ctx.config.billing_interval_minutes;
        let metering = Metering {
            metadata: ObjectMeta::namespaced(&self.ctx.config.system_namespace, key.name.clone()),
            spec: MeteringSpec {
                owner: owner.to_string(),
                namespace: namespace.to_string(),
                interval_minutes,
            },
            status: MeteringStatus {
                last_billing_timestamp: self.ctx.now(),
                ..Default::default()
            },
        };

        match api.create(&metering).await {
            Ok(_) => {
                self.ctx
                    .logger
                    .log_tenant_provisioned(namespace, owner, interval_minutes);
                Ok(())
            }
            // A concurrent pass created it first
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Count the stored metering records and publish the count as the tenant gauge
    pub(crate) async fn refresh_tenant_gauge(&self) -> Result<usize> {
        let count = self
            .ctx
            .api::<Metering>()
            .list(Some(&self.ctx.config.system_namespace))
            .await?
            .len();
        self.ctx.metrics.set_metered_tenants(count);
        Ok(count)
    }

    async fn remove_metering(&self, namespace: &str) -> Result<()> {
        let removed = self
            .ctx
            .api::<Metering>()
            .delete(&self.ctx.metering_key(namespace))
            .await
            .ignore_not_found()?;

        if removed.is_some() {
            self.ctx.logger.log_tenant_removed(namespace);
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for TenantReconciler {
    fn kind(&self) -> &'static str {
        Namespace::KIND
    }

    fn component(&self) -> &'static str {
        components::TENANT
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let namespace = key.name.as_str();

        let ns = self.ctx.api::<Namespace>().get_opt(key).await?;
        match ns {
            Some(ns) if !ns.metadata.is_deleting() => {
                let Some(owner) = ns.owner() else {
                    debug!(namespace = %namespace, "Namespace has no owner, not billable");
                    return Ok(Action::AwaitChange);
                };
                self.ensure_quota(namespace).await?;
                self.ensure_metering(namespace, owner).await?;
            }
            _ => self.remove_metering(namespace).await?,
        }

        self.refresh_tenant_gauge().await?;
        Ok(Action::AwaitChange)
    }
}
