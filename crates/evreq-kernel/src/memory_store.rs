//! In-memory collaborators with API-server-like semantics.
//!
//! `InMemoryRequestStore` enforces resourceVersion preconditions on status writes and
//! only bumps the version when the status actually changes, like the API server does
//! for no-op updates. `InMemoryPods` records every eviction call and can be told to
//! refuse evictions the way a disruption budget would.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use kube::ResourceExt;

use evreq_api::EvictionRequest;

use crate::error::ReconcileError;
use crate::store::{EvictionRequestStore, PodIdentity, PodTargets};

type ObjectKey = (String, String);

fn key_of(request: &EvictionRequest) -> ObjectKey {
    (request.namespace().unwrap_or_default(), request.name_any())
}

/// Eviction requests keyed by namespaced name.
#[derive(Default)]
pub struct InMemoryRequestStore {
    objects: RwLock<HashMap<ObjectKey, EvictionRequest>>,
    injected_failures: Mutex<VecDeque<ReconcileError>>,
    status_writes: Mutex<u64>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or overwrite) an object, assigning the next resourceVersion.
    pub fn insert(&self, mut request: EvictionRequest) -> Result<EvictionRequest, ReconcileError> {
        let mut objects = self
            .objects
            .write()
            .map_err(|e| ReconcileError::Store(e.to_string()))?;
        let key = key_of(&request);
        let next = objects
            .get(&key)
            .map(|existing| next_resource_version(existing))
            .unwrap_or_else(|| "1".to_string());
        request.metadata.resource_version = Some(next);
        objects.insert(key, request.clone());
        Ok(request)
    }

    /// Apply an external status write (e.g. an interceptor heartbeat) to the stored object.
    pub fn mutate_status<F>(
        &self,
        namespace: &str,
        name: &str,
        mutate: F,
    ) -> Result<EvictionRequest, ReconcileError>
    where
        F: FnOnce(&mut EvictionRequest),
    {
        let mut objects = self
            .objects
            .write()
            .map_err(|e| ReconcileError::Store(e.to_string()))?;
        let stored = objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| ReconcileError::NotFound(format!("{}/{}", namespace, name)))?;
        mutate(stored);
        stored.metadata.resource_version = Some(next_resource_version(stored));
        Ok(stored.clone())
    }

    /// Make the next `update_status` call fail with `error`.
    pub fn fail_next_update(&self, error: ReconcileError) {
        if let Ok(mut failures) = self.injected_failures.lock() {
            failures.push_back(error);
        }
    }

    /// Number of `update_status` calls received, successful or not.
    pub fn status_writes(&self) -> u64 {
        self.status_writes.lock().map(|n| *n).unwrap_or(0)
    }

    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<EvictionRequest> {
        self.objects
            .read()
            .ok()?
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

fn next_resource_version(request: &EvictionRequest) -> String {
    let current = request
        .metadata
        .resource_version
        .as_deref()
        .and_then(|rv| rv.parse::<u64>().ok())
        .unwrap_or(0);
    (current + 1).to_string()
}

#[async_trait]
impl EvictionRequestStore for InMemoryRequestStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EvictionRequest>, ReconcileError> {
        let objects = self
            .objects
            .read()
            .map_err(|e| ReconcileError::Store(e.to_string()))?;
        Ok(objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn update_status(
        &self,
        request: &EvictionRequest,
    ) -> Result<EvictionRequest, ReconcileError> {
        if let Ok(mut writes) = self.status_writes.lock() {
            *writes += 1;
        }
        let injected = self
            .injected_failures
            .lock()
            .map_err(|e| ReconcileError::Store(e.to_string()))?
            .pop_front();
        if let Some(error) = injected {
            return Err(error);
        }

        let mut objects = self
            .objects
            .write()
            .map_err(|e| ReconcileError::Store(e.to_string()))?;
        let key = key_of(request);
        let stored = objects
            .get_mut(&key)
            .ok_or_else(|| ReconcileError::NotFound(format!("{}/{}", key.0, key.1)))?;
        if stored.metadata.resource_version != request.metadata.resource_version {
            return Err(ReconcileError::Conflict(format!(
                "{}/{}: resourceVersion {:?} is stale, current is {:?}",
                key.0,
                key.1,
                request.metadata.resource_version,
                stored.metadata.resource_version
            )));
        }
        if stored.status != request.status {
            stored.status = request.status.clone();
            stored.metadata.resource_version = Some(next_resource_version(stored));
        }
        Ok(stored.clone())
    }
}

/// Pods keyed by namespaced name. A successful eviction removes the pod.
#[derive(Default)]
pub struct InMemoryPods {
    pods: RwLock<HashMap<ObjectKey, PodIdentity>>,
    blocked: Mutex<Option<String>>,
    evictions: Mutex<Vec<PodIdentity>>,
}

impl InMemoryPods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pod: PodIdentity) {
        if let Ok(mut pods) = self.pods.write() {
            pods.insert((pod.namespace.clone(), pod.name.clone()), pod);
        }
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        if let Ok(mut pods) = self.pods.write() {
            pods.remove(&(namespace.to_string(), name.to_string()));
        }
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.pods
            .read()
            .map(|pods| pods.contains_key(&(namespace.to_string(), name.to_string())))
            .unwrap_or(false)
    }

    /// Refuse evictions with `message` until [InMemoryPods::unblock_evictions].
    pub fn block_evictions(&self, message: impl Into<String>) {
        if let Ok(mut blocked) = self.blocked.lock() {
            *blocked = Some(message.into());
        }
    }

    pub fn unblock_evictions(&self) {
        if let Ok(mut blocked) = self.blocked.lock() {
            *blocked = None;
        }
    }

    /// Every eviction call received, including refused ones.
    pub fn eviction_calls(&self) -> Vec<PodIdentity> {
        self.evictions
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PodTargets for InMemoryPods {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodIdentity>, ReconcileError> {
        let pods = self
            .pods
            .read()
            .map_err(|e| ReconcileError::Target(e.to_string()))?;
        Ok(pods.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn evict(&self, pod: &PodIdentity) -> Result<(), ReconcileError> {
        self.evictions
            .lock()
            .map_err(|e| ReconcileError::Eviction(e.to_string()))?
            .push(pod.clone());
        let blocked = self
            .blocked
            .lock()
            .map_err(|e| ReconcileError::Eviction(e.to_string()))?
            .clone();
        if let Some(message) = blocked {
            return Err(ReconcileError::EvictionBlocked(message));
        }
        let mut pods = self
            .pods
            .write()
            .map_err(|e| ReconcileError::Eviction(e.to_string()))?;
        match pods.remove(&(pod.namespace.clone(), pod.name.clone())) {
            Some(_) => Ok(()),
            None => Err(ReconcileError::Eviction(format!(
                "pods \"{}\" not found",
                pod.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evreq_api::{EvictionRequestSpec, EvictionTarget, LocalPodReference};

    fn request() -> EvictionRequest {
        let mut request = EvictionRequest::new(
            "evict-web-0",
            EvictionRequestSpec {
                target: EvictionTarget {
                    pod_ref: Some(LocalPodReference {
                        name: "web-0".into(),
                        uid: "uid-1".into(),
                    }),
                },
                ..Default::default()
            },
        );
        request.metadata.namespace = Some("shop".into());
        request
    }

    #[tokio::test]
    async fn update_status_rejects_stale_resource_version() {
        let store = InMemoryRequestStore::new();
        let created = store.insert(request()).expect("insert");

        let mut first = created.clone();
        first.status_mut().message = "first".into();
        let persisted = store.update_status(&first).await.expect("first write");
        assert_eq!(persisted.metadata.resource_version.as_deref(), Some("2"));

        let mut stale = created;
        stale.status_mut().message = "second".into();
        let err = store.update_status(&stale).await.expect_err("stale write");
        assert!(err.is_conflict());
        assert_eq!(store.status_writes(), 2);
    }

    #[tokio::test]
    async fn noop_status_write_keeps_resource_version() {
        let store = InMemoryRequestStore::new();
        let created = store.insert(request()).expect("insert");
        let persisted = store.update_status(&created).await.expect("write");
        assert_eq!(persisted.metadata.resource_version, created.metadata.resource_version);
    }

    #[tokio::test]
    async fn injected_failure_is_returned_once() {
        let store = InMemoryRequestStore::new();
        let created = store.insert(request()).expect("insert");
        store.fail_next_update(ReconcileError::Store("etcd unavailable".into()));
        assert!(store.update_status(&created).await.is_err());
        assert!(store.update_status(&created).await.is_ok());
    }

    #[tokio::test]
    async fn blocked_eviction_keeps_pod_and_records_call() {
        let pods = InMemoryPods::new();
        let pod = PodIdentity::new("shop", "web-0", "uid-1");
        pods.insert(pod.clone());
        pods.block_evictions("Cannot evict pod as it would violate the pod's disruption budget.");

        let err = pods.evict(&pod).await.expect_err("blocked");
        assert!(matches!(err, ReconcileError::EvictionBlocked(_)));
        assert!(pods.contains("shop", "web-0"));

        pods.unblock_evictions();
        pods.evict(&pod).await.expect("evicted");
        assert!(!pods.contains("shop", "web-0"));
        assert_eq!(pods.eviction_calls().len(), 2);
    }
}
