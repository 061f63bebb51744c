//! Control-plane object store abstraction
//!
//! Reconcilers only rely on typed CRUD, conditional updates guarded by a
//! version token, and a watch stream. [`ObjectStore`] captures those
//! primitives over JSON documents; [`Api`] adds typed access and the
//! read-modify-write helpers that retry on version conflicts.

mod memory;
mod retry;

pub use memory::MemoryStore;
pub use retry::{Backoff, RetryPolicy};

use crate::error::{MeteringError, Result, ResultExt};
use crate::models::Resource;
use crate::observability::MeteringMetrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Address of an object within its kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    /// Object created or updated
    Applied,
    Deleted,
}

/// Notification that an object changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: &'static str,
    pub key: ObjectKey,
    pub event_type: WatchEventType,
}

/// Primitives offered by the control plane
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, kind: &'static str, key: &ObjectKey) -> Result<Value>;

    /// List objects of a kind, optionally restricted to one namespace
    async fn list(&self, kind: &'static str, namespace: Option<&str>) -> Result<Vec<Value>>;

    /// Create an object; fails with `AlreadyExists` when the key is taken
    async fn create(&self, kind: &'static str, key: &ObjectKey, object: Value) -> Result<Value>;

    /// Replace everything but the status, conditional on the version token
    async fn replace(&self, kind: &'static str, key: &ObjectKey, object: Value) -> Result<Value>;

    /// Replace only the status, conditional on the version token
    async fn replace_status(
        &self,
        kind: &'static str,
        key: &ObjectKey,
        object: Value,
    ) -> Result<Value>;

    async fn delete(&self, kind: &'static str, key: &ObjectKey) -> Result<()>;

    /// Subscribe to change notifications
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Result of [`Api::create_or_update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

/// Typed view of the store for one resource kind
pub struct Api<T> {
    store: Arc<dyn ObjectStore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Api<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Resource> Api<T> {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    pub async fn get(&self, key: &ObjectKey) -> Result<T> {
        let value = self.store.get(T::KIND, key).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Get an object, mapping absence to `None`
    pub async fn get_opt(&self, key: &ObjectKey) -> Result<Option<T>> {
        self.get(key).await.ignore_not_found()
    }

    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<T>> {
        self.store
            .list(T::KIND, namespace)
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(MeteringError::from))
            .collect()
    }

    pub async fn create(&self, object: &T) -> Result<T> {
        let value = serde_json::to_value(object)?;
        let created = self.store.create(T::KIND, &object.key(), value).await?;
        Ok(serde_json::from_value(created)?)
    }

    pub async fn replace(&self, object: &T) -> Result<T> {
        let value = serde_json::to_value(object)?;
        let updated = self.store.replace(T::KIND, &object.key(), value).await?;
        Ok(serde_json::from_value(updated)?)
    }

    pub async fn replace_status(&self, object: &T) -> Result<T> {
        let value = serde_json::to_value(object)?;
        let updated = self
            .store
            .replace_status(T::KIND, &object.key(), value)
            .await?;
        Ok(serde_json::from_value(updated)?)
    }

    pub async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.store.delete(T::KIND, key).await
    }

    /// Read-modify-write of the status with re-read and retry on conflict.
    ///
    /// `mutate` runs against a freshly read object on every attempt and may
    /// decline the write by returning `Ok(None)`; errors abort without
    /// writing. Returns the stored object and the value `mutate` produced.
    pub async fn modify_status<R, F>(
        &self,
        key: &ObjectKey,
        policy: &RetryPolicy,
        mut mutate: F,
    ) -> Result<Option<(T, R)>>
    where
        F: FnMut(&mut T) -> Result<Option<R>> + Send,
        R: Send,
    {
        let mut backoff = policy.backoff();
        let mut attempt = 1u32;

        loop {
            let mut current = self.get(key).await?;
            let outcome = match mutate(&mut current)? {
                Some(outcome) => outcome,
                None => return Ok(None),
            };

            match self.replace_status(&current).await {
                Ok(updated) => return Ok(Some((updated, outcome))),
                Err(e) if e.is_conflict() => match backoff.next() {
                    Some(delay) => {
                        MeteringMetrics::new().inc_conflict_retries(T::KIND);
                        debug!(kind = T::KIND, key = %key, attempt, "Status update conflicted, retrying");
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Create `template` if absent, otherwise apply `mutate` to the stored
    /// object and write it back when something changed.
    ///
    /// `mutate` is applied to the template before creation as well, so the
    /// resulting fields are the same on both paths.
    pub async fn create_or_update<F>(
        &self,
        template: &T,
        policy: &RetryPolicy,
        mut mutate: F,
    ) -> Result<OperationResult>
    where
        F: FnMut(&mut T) + Send,
    {
        let key = template.key();
        let mut backoff = policy.backoff();

        loop {
            let result = match self.get_opt(&key).await? {
                None => {
                    let mut object = template.clone();
                    mutate(&mut object);
                    self.create(&object).await.map(|_| OperationResult::Created)
                }
                Some(mut existing) => {
                    let before = serde_json::to_value(&existing)?;
                    mutate(&mut existing);
                    if serde_json::to_value(&existing)? == before {
                        return Ok(OperationResult::Unchanged);
                    }
                    self.replace(&existing).await.map(|_| OperationResult::Updated)
                }
            };

            match result {
                Ok(op) => return Ok(op),
                Err(e) if e.is_conflict() || e.is_already_exists() => match backoff.next() {
                    Some(delay) => {
                        MeteringMetrics::new().inc_conflict_retries(T::KIND);
                        debug!(kind = T::KIND, key = %key, error = %e, "Create or update raced, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }
}
