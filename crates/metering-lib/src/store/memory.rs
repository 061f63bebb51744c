//! In-process object store
//!
//! Holds JSON documents in a [`DashMap`] keyed by kind and object key, stamps
//! every write with a fresh resource version, and rejects writes that carry a
//! stale one. Used for standalone runs and tests.

use super::{ObjectKey, ObjectStore, WatchEvent, WatchEventType};
use crate::error::{MeteringError, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the watch channel; slow subscribers observe `Lagged`
const WATCH_BUFFER: usize = 4096;

type StoreKey = (&'static str, ObjectKey);

pub struct MemoryStore {
    objects: DashMap<StoreKey, Value>,
    version: AtomicU64,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            objects: DashMap::new(),
            version: AtomicU64::new(0),
            events,
        }
    }

    /// Number of stored objects of `kind`
    pub fn count(&self, kind: &str) -> usize {
        self.objects.iter().filter(|e| e.key().0 == kind).count()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn notify(&self, kind: &'static str, key: &ObjectKey, event_type: WatchEventType) {
        trace!(kind, key = %key, ?event_type, "Store change");
        // No subscribers is fine
        let _ = self.events.send(WatchEvent {
            kind,
            key: key.clone(),
            event_type,
        });
    }

    /// Check the incoming version token against the stored one.
    ///
    /// An absent token means an unconditional write.
    fn check_version(
        kind: &'static str,
        key: &ObjectKey,
        stored: &Value,
        incoming: &Value,
    ) -> Result<()> {
        let stored_version = resource_version(stored);
        match resource_version(incoming) {
            Some(token) if Some(token) != stored_version => Err(MeteringError::Conflict {
                kind,
                key: key.clone(),
                reason: format!(
                    "version {} is stale, current is {}",
                    token,
                    stored_version.unwrap_or("none")
                ),
            }),
            _ => Ok(()),
        }
    }
}

fn resource_version(value: &Value) -> Option<&str> {
    value
        .get("metadata")
        .and_then(|m| m.get("resourceVersion"))
        .and_then(Value::as_str)
}

fn set_resource_version(value: &mut Value, version: String) {
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert("resourceVersion".to_string(), Value::String(version));
    }
}

fn namespace_of(value: &Value) -> Option<&str> {
    value
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str)
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: &'static str, key: &ObjectKey) -> Result<Value> {
        self.objects
            .get(&(kind, key.clone()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MeteringError::NotFound {
                kind,
                key: key.clone(),
            })
    }

    async fn list(&self, kind: &'static str, namespace: Option<&str>) -> Result<Vec<Value>> {
        let mut items: Vec<(ObjectKey, Value)> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .filter(|entry| namespace.is_none() || namespace_of(entry.value()) == namespace)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(items.into_iter().map(|(_, value)| value).collect())
    }

    async fn create(&self, kind: &'static str, key: &ObjectKey, mut object: Value) -> Result<Value> {
        match self.objects.entry((kind, key.clone())) {
            Entry::Occupied(_) => {
                return Err(MeteringError::AlreadyExists {
                    kind,
                    key: key.clone(),
                })
            }
            Entry::Vacant(slot) => {
                set_resource_version(&mut object, self.next_version());
                slot.insert(object.clone());
            }
        }
        self.notify(kind, key, WatchEventType::Applied);
        Ok(object)
    }

    async fn replace(&self, kind: &'static str, key: &ObjectKey, mut object: Value) -> Result<Value> {
        {
            let mut stored = self
                .objects
                .get_mut(&(kind, key.clone()))
                .ok_or_else(|| MeteringError::NotFound {
                    kind,
                    key: key.clone(),
                })?;
            Self::check_version(kind, key, stored.value(), &object)?;

            // Status is owned by replace_status
            if let Some(obj) = object.as_object_mut() {
                match stored.value().get("status") {
                    Some(status) => {
                        obj.insert("status".to_string(), status.clone());
                    }
                    None => {
                        obj.remove("status");
                    }
                }
            }
            set_resource_version(&mut object, self.next_version());
            *stored.value_mut() = object.clone();
        }
        self.notify(kind, key, WatchEventType::Applied);
        Ok(object)
    }

    async fn replace_status(
        &self,
        kind: &'static str,
        key: &ObjectKey,
        object: Value,
    ) -> Result<Value> {
        let updated = {
            let mut stored = self
                .objects
                .get_mut(&(kind, key.clone()))
                .ok_or_else(|| MeteringError::NotFound {
                    kind,
                    key: key.clone(),
                })?;
            Self::check_version(kind, key, stored.value(), &object)?;

            let status = object.get("status").cloned().unwrap_or(Value::Null);
            let mut updated = stored.value().clone();
            if let Some(obj) = updated.as_object_mut() {
                obj.insert("status".to_string(), status);
            }
            set_resource_version(&mut updated, self.next_version());
            *stored.value_mut() = updated.clone();
            updated
        };
        self.notify(kind, key, WatchEventType::Applied);
        Ok(updated)
    }

    async fn delete(&self, kind: &'static str, key: &ObjectKey) -> Result<()> {
        self.objects
            .remove(&(kind, key.clone()))
            .ok_or_else(|| MeteringError::NotFound {
                kind,
                key: key.clone(),
            })?;
        self.notify(kind, key, WatchEventType::Deleted);
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    const KIND: &str = "Widget";

    fn widget(name: &str, version: Option<&str>) -> Value {
        let mut value = json!({
            "metadata": {"name": name, "namespace": "ns"},
            "spec": {"size": 1},
            "status": {"ready": false}
        });
        if let Some(v) = version {
            set_resource_version(&mut value, v.to_string());
        }
        value
    }

    #[tokio::test]
    async fn test_create_conflicts_on_existing_key() {
        let store = MemoryStore::new();
        let key = ObjectKey::namespaced("ns", "a");

        assert_ok!(store.create(KIND, &key, widget("a", None)).await);
        let err = assert_err!(store.create(KIND, &key, widget("a", None)).await);
        assert!(err.is_already_exists());
        assert_eq!(store.count(KIND), 1);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = MemoryStore::new();
        let key = ObjectKey::namespaced("ns", "a");

        let created = store.create(KIND, &key, widget("a", None)).await.unwrap();
        let token = resource_version(&created).unwrap().to_string();

        let mut first = created.clone();
        first["status"]["ready"] = json!(true);
        store.replace_status(KIND, &key, first).await.unwrap();

        // Second writer still holds the original token
        let err = store
            .replace_status(KIND, &key, widget("a", Some(&token)))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let stored = store.get(KIND, &key).await.unwrap();
        assert_eq!(stored["status"]["ready"], json!(true));
    }

    #[tokio::test]
    async fn test_replace_keeps_status_and_replace_status_keeps_spec() {
        let store = MemoryStore::new();
        let key = ObjectKey::namespaced("ns", "a");
        store.create(KIND, &key, widget("a", None)).await.unwrap();

        let mut spec_change = widget("a", None);
        spec_change["spec"]["size"] = json!(3);
        spec_change["status"]["ready"] = json!(true);
        store.replace(KIND, &key, spec_change).await.unwrap();

        let stored = store.get(KIND, &key).await.unwrap();
        assert_eq!(stored["spec"]["size"], json!(3));
        assert_eq!(stored["status"]["ready"], json!(false));

        let mut status_change = widget("a", None);
        status_change["spec"]["size"] = json!(9);
        status_change["status"]["ready"] = json!(true);
        store.replace_status(KIND, &key, status_change).await.unwrap();

        let stored = store.get(KIND, &key).await.unwrap();
        assert_eq!(stored["spec"]["size"], json!(3));
        assert_eq!(stored["status"]["ready"], json!(true));
    }

    #[tokio::test]
    async fn test_watch_and_list() {
        let store = MemoryStore::new();
        let mut events = store.watch();

        store
            .create(KIND, &ObjectKey::namespaced("ns", "b"), widget("b", None))
            .await
            .unwrap();
        store
            .create(KIND, &ObjectKey::namespaced("ns", "a"), widget("a", None))
            .await
            .unwrap();
        assert_ok!(store.delete(KIND, &ObjectKey::namespaced("ns", "b")).await);
        assert!(store
            .delete(KIND, &ObjectKey::namespaced("ns", "b"))
            .await
            .unwrap_err()
            .is_not_found());

        let first = events.recv().await.unwrap();
        assert_eq!(first.key.name, "b");
        assert_eq!(first.event_type, WatchEventType::Applied);
        events.recv().await.unwrap();
        let deleted = events.recv().await.unwrap();
        assert_eq!(deleted.event_type, WatchEventType::Deleted);

        let listed = store.list(KIND, Some("ns")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store.list(KIND, Some("other")).await.unwrap().is_empty());
    }
}
