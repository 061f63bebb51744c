//! Object model shared by the reconcilers
//!
//! Every object stored in the control plane carries an [`ObjectMeta`] and
//! implements [`Resource`] so the store can address it by kind and key.

mod metering;
mod quantity;
mod workload;

pub use metering::*;
pub use quantity::Quantity;
pub use workload::*;

use crate::store::ObjectKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resource kind name such as `cpu`, `memory` or `storage`
pub type ResourceName = String;

/// Annotation marking a namespace as a billable tenant; the value is the owner
pub const OWNER_ANNOTATION: &str = "tenant.metering.io/owner";

/// Quota key holding the tenant's aggregate requested storage
pub const QUOTA_STORAGE_KEY: &str = "requests.storage";

/// Resource kind billed from the quota snapshot instead of containers
pub const STORAGE_RESOURCE: &str = "storage";

pub const METERING_PREFIX: &str = "metering-";
pub const QUOTA_PREFIX: &str = "quota-";
pub const DEDUCTION_PREFIX: &str = "deduction";
pub const PRICE_PREFIX: &str = "price-";

/// Metadata common to all stored objects
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Opaque version token maintained by the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// Unix seconds at which deletion was requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<i64>,
}

impl ObjectMeta {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// A typed object the store can hold
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind name used to partition the store
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}

macro_rules! impl_resource {
    ($ty:ty, $kind:literal) => {
        impl $crate::models::Resource for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &$crate::models::ObjectMeta {
                &self.metadata
            }
        }
    };
}

pub(crate) use impl_resource;

/// Name of the metering record for a tenant namespace
pub fn metering_name(namespace: &str) -> String {
    format!("{METERING_PREFIX}{namespace}")
}

/// Name of the resource quota provisioned in a tenant namespace
pub fn quota_name(namespace: &str) -> String {
    format!("{QUOTA_PREFIX}{namespace}")
}

/// Deterministic ledger deduction name for one billing period
pub fn deduction_name(owner: &str, sequence_id: u64) -> String {
    format!("{DEDUCTION_PREFIX}-{owner}-{sequence_id}")
}

/// Deterministic usage record name for one sampling pass of one tenant
pub fn usage_record_name(namespace: &str, sampler: &str, sequence_id: u64) -> String {
    format!("{namespace}-{sampler}-{sequence_id}")
}

/// Name of the price table entry published by a sampler
pub fn price_entry_name(sampler: &str) -> String {
    format!("{PRICE_PREFIX}{sampler}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_meta_serializes_camel_case() {
        let mut meta = ObjectMeta::namespaced("team-a", "metering-team-a");
        meta.resource_version = Some("4".into());
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["resourceVersion"], "4");
        assert!(json.get("deletionTimestamp").is_none());
    }

    #[test]
    fn test_names_are_deterministic() {
        assert_eq!(metering_name("team-a"), "metering-team-a");
        assert_eq!(deduction_name("alice", 7), "deduction-alice-7");
        assert_eq!(usage_record_name("team-a", "pods", 3), "team-a-pods-3");
        assert_eq!(price_entry_name("pods"), "price-pods");
    }
}
