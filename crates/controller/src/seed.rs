//! Standalone seeding of the in-memory store
//!
//! Without a control plane the controller starts from a JSON document that
//! lists the namespaces, pods, quotas and samplers to load.

use anyhow::{Context as _, Result};
use metering_lib::models::{Namespace, Pod, Resource, ResourceQuota, WorkloadSampler};
use metering_lib::store::{Api, ObjectStore};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub namespaces: Vec<Namespace>,
    pub quotas: Vec<ResourceQuota>,
    pub pods: Vec<Pod>,
    pub samplers: Vec<WorkloadSampler>,
}

impl Seed {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading seed file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing seed file {}", path.display()))
    }

    /// Create every object; returns how many were stored
    pub async fn apply(self, store: &Arc<dyn ObjectStore>) -> Result<usize> {
        let mut created = 0;
        created += create_all(store, self.namespaces).await?;
        created += create_all(store, self.quotas).await?;
        created += create_all(store, self.pods).await?;
        created += create_all(store, self.samplers).await?;
        Ok(created)
    }
}

async fn create_all<T: Resource>(store: &Arc<dyn ObjectStore>, objects: Vec<T>) -> Result<usize> {
    let api = Api::<T>::new(store.clone());
    let count = objects.len();
    for object in objects {
        api.create(&object)
            .await
            .with_context(|| format!("seeding {} {}", T::KIND, object.key()))?;
    }
    if count > 0 {
        info!(kind = T::KIND, count, "Seeded objects");
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use metering_lib::store::{MemoryStore, ObjectKey};
    use std::io::Write;
    use tokio_test::assert_err;

    const SEED: &str = r#"{
        "namespaces": [
            {"metadata": {"name": "team-a", "annotations": {"tenant.metering.io/owner": "alice"}}}
        ],
        "pods": [
            {"metadata": {"name": "web", "namespace": "team-a"},
             "spec": {"containers": [{"name": "app", "resources": {"limits": {"cpu": "500m"}}}]},
             "status": {"phase": "Running"}}
        ],
        "samplers": [
            {"metadata": {"name": "pod-sampler", "namespace": "metering-system"},
             "spec": {"resourceName": "pods", "intervalMinutes": 5,
                      "resources": {"cpu": {"unit": "1", "price": 10}}}}
        ]
    }"#;

    #[tokio::test]
    async fn test_seed_load_and_apply() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SEED.as_bytes()).unwrap();

        let seed = Seed::load(file.path()).await.unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        assert_eq!(seed.apply(&store).await.unwrap(), 3);

        let ns = Api::<Namespace>::new(store.clone())
            .get(&ObjectKey::cluster("team-a"))
            .await
            .unwrap();
        assert_eq!(ns.owner(), Some("alice"));
        let sampler = Api::<WorkloadSampler>::new(store)
            .get(&ObjectKey::namespaced("metering-system", "pod-sampler"))
            .await
            .unwrap();
        assert_eq!(sampler.spec.interval_minutes, 5);
    }

    #[tokio::test]
    async fn test_seed_rejects_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"pods\": 3}").unwrap();
        assert_err!(Seed::load(file.path()).await);
    }
}
