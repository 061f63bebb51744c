//! Usage ingestion
//!
//! Folds a pending usage record into the accumulators of the metering
//! records its entries belong to, then marks the record complete.
//!
//! Every fold is tagged with the usage record's key. A record re-delivered
//! after a crash between folding and marking is recognised by that tag and
//! not counted twice.

use super::{Action, Context, Reconciler};
use crate::error::{InvariantViolation, Result, ResultExt};
use crate::health::components;
use crate::models::{Metering, Resource, ResourceInfo, ResourceName, ResourceUsage, UsagePhase};
use crate::store::ObjectKey;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

type Entries = BTreeMap<ResourceName, ResourceInfo>;

pub struct IngestReconciler {
    ctx: Context,
}

impl IngestReconciler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Entries that may be folded; negative ones are rejected
    fn valid_entries(
        record: &ResourceUsage,
    ) -> impl Iterator<Item = (&ResourceName, &ResourceInfo)> {
        let record_name = record.metadata.name.as_str();
        record.spec.resources.iter().filter(move |(resource, info)| {
            if info.is_negative() {
                let violation = InvariantViolation::NegativeUsage {
                    record: record_name.to_string(),
                    resource: resource.to_string(),
                };
                error!(error = %violation, "Rejecting usage entry");
                return false;
            }
            true
        })
    }

    /// Group the record's entries by the tenant whose metering record they land in.
    ///
    /// An entry goes to its own namespace when that tenant is metered and to
    /// the record's target namespace otherwise. Entries with neither are dropped.
    async fn group_entries(&self, record: &ResourceUsage) -> Result<BTreeMap<String, Entries>> {
        let record_name = record.metadata.name.as_str();
        let target = record.spec.target_namespace.as_str();
        let mut metered: BTreeMap<String, bool> = BTreeMap::new();
        let mut groups: BTreeMap<String, Entries> = BTreeMap::new();

        for (resource, info) in Self::valid_entries(record) {
            let mut resolved = None;
            for namespace in [info.namespace.as_str(), target] {
                if namespace.is_empty() {
                    continue;
                }
                if self.is_metered(namespace, &mut metered).await? {
                    resolved = Some(namespace);
                    break;
                }
            }

            let Some(namespace) = resolved else {
                warn!(
                    record = %record_name,
                    resource = %resource,
                    namespace = %info.namespace,
                    target = %target,
                    "No metering record for usage entry, skipping"
                );
                continue;
            };
            if namespace != info.namespace && !info.namespace.is_empty() {
                debug!(
                    record = %record_name,
                    resource = %resource,
                    from = %info.namespace,
                    to = %namespace,
                    "Usage entry resolved to target namespace"
                );
            }

            groups
                .entry(namespace.to_string())
                .or_default()
                .insert(resource.clone(), info.clone());
        }

        Ok(groups)
    }

    async fn is_metered(&self, namespace: &str, seen: &mut BTreeMap<String, bool>) -> Result<bool> {
        if let Some(found) = seen.get(namespace) {
            return Ok(*found);
        }
        let found = self
            .ctx
            .api::<Metering>()
            .get_opt(&self.ctx.metering_key(namespace))
            .await?
            .is_some();
        seen.insert(namespace.to_string(), found);
        Ok(found)
    }

    /// Fold one group into its tenant's accumulator.
    ///
    /// Returns false when the record vanished or the token was seen.
    async fn fold(&self, token: &str, namespace: &str, entries: &Entries) -> Result<bool> {
        let key = self.ctx.metering_key(namespace);
        let folded = self
            .ctx
            .api::<Metering>()
            .modify_status(&key, &self.ctx.config.retry, |metering| {
                Ok(metering.status.fold(token, entries).then_some(()))
            })
            .await
            .ignore_not_found()?;

        match folded {
            None => {
                warn!(
                    namespace = %namespace,
                    token = %token,
                    "Metering record removed before fold, skipping entries"
                );
                Ok(false)
            }
            Some(None) => {
                debug!(namespace = %namespace, token = %token, "Usage already folded");
                Ok(false)
            }
            Some(Some(_)) => {
                self.ctx
                    .logger
                    .log_usage_folded(token, &key.name, entries.len());
                Ok(true)
            }
        }
    }

    async fn mark_complete(&self, key: &ObjectKey) -> Result<()> {
        self.ctx
            .api::<ResourceUsage>()
            .modify_status(key, &self.ctx.config.retry, |record| {
                if record.is_complete() {
                    return Ok(None);
                }
                record.status.phase = UsagePhase::Complete;
                Ok(Some(()))
            })
            .await
            .ignore_not_found()?;
        Ok(())
    }

    /// Fold a pending record and mark it complete.
    ///
    /// Returns how many tenant accumulators actually changed.
    pub(crate) async fn ingest(&self, record: &ResourceUsage) -> Result<usize> {
        let key = record.key();
        let token = key.to_string();
        let mut folded = 0;
        for (namespace, entries) in self.group_entries(record).await? {
            if self.fold(&token, &namespace, &entries).await? {
                folded += 1;
            }
        }

        // Last step: a crash before this point re-delivers the record
        self.mark_complete(&key).await?;
        Ok(folded)
    }
}

#[async_trait]
impl Reconciler for IngestReconciler {
    fn kind(&self) -> &'static str {
        ResourceUsage::KIND
    }

    fn component(&self) -> &'static str {
        components::INGESTION
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(record) = self.ctx.api::<ResourceUsage>().get_opt(key).await? else {
            return Ok(Action::AwaitChange);
        };
        if record.is_complete() || record.metadata.is_deleting() {
            return Ok(Action::AwaitChange);
        }

        if self.ingest(&record).await? > 0 {
            self.ctx.metrics.inc_usage_records_folded();
        }

        Ok(Action::AwaitChange)
    }
}
