//! API-server backed collaborators for the kernel.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, EvictParams, PostParams, Preconditions};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, ResourceExt};
use tracing::debug;

use evreq_api::EvictionRequest;
use evreq_kernel::{EvictionRequestStore, PodIdentity, PodTargets, ReconcileError};

const HTTP_NOT_FOUND: u16 = 404;
const HTTP_CONFLICT: u16 = 409;
const HTTP_TOO_MANY_REQUESTS: u16 = 429;

fn api_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

fn store_error(err: kube::Error) -> ReconcileError {
    match api_code(&err) {
        Some(HTTP_CONFLICT) => ReconcileError::Conflict(err.to_string()),
        Some(HTTP_NOT_FOUND) => ReconcileError::NotFound(err.to_string()),
        _ => ReconcileError::Store(err.to_string()),
    }
}

/// Policy refusals (disruption budgets) come back as 429.
fn eviction_error(err: kube::Error) -> ReconcileError {
    match api_code(&err) {
        Some(HTTP_TOO_MANY_REQUESTS) => ReconcileError::EvictionBlocked(err.to_string()),
        _ => ReconcileError::Eviction(err.to_string()),
    }
}

#[derive(Clone)]
pub struct KubeRequestStore {
    client: Client,
}

impl KubeRequestStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<EvictionRequest> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl EvictionRequestStore for KubeRequestStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EvictionRequest>, ReconcileError> {
        self.api(namespace).get_opt(name).await.map_err(store_error)
    }

    async fn update_status(
        &self,
        request: &EvictionRequest,
    ) -> Result<EvictionRequest, ReconcileError> {
        let namespace = request.namespace().unwrap_or_default();
        let name = request.name_any();
        let body = serde_json::to_vec(request).map_err(|e| ReconcileError::Store(e.to_string()))?;
        debug!(namespace = %namespace, name = %name, "replacing eviction request status");
        self.api(&namespace)
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(store_error)
    }
}

/// Pods read from the informer cache; evictions go to the API server.
#[derive(Clone)]
pub struct KubePods {
    client: Client,
    cache: Store<Pod>,
}

impl KubePods {
    pub fn new(client: Client, cache: Store<Pod>) -> Self {
        Self { client, cache }
    }
}

#[async_trait]
impl PodTargets for KubePods {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodIdentity>, ReconcileError> {
        let key = ObjectRef::<Pod>::new(name).within(namespace);
        Ok(self.cache.get(&key).map(|pod| PodIdentity {
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: pod.metadata.uid.clone(),
        }))
    }

    async fn evict(&self, pod: &PodIdentity) -> Result<(), ReconcileError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                preconditions: Some(Preconditions {
                    uid: pod.uid.clone(),
                    resource_version: None,
                }),
                ..DeleteParams::default()
            }),
            ..EvictParams::default()
        };
        api.evict(&pod.name, &params)
            .await
            .map(|_| ())
            .map_err(eviction_error)
    }
}
