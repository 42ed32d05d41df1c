//! Collaborator contracts: the object store holding eviction requests and the pod
//! lifecycle primitive.
//!
//! Implementations are responsible for making remote semantics explicit:
//! - `update_status` is an optimistic-concurrency write; a stale
//!   `resourceVersion` must surface as [ReconcileError::Conflict].
//! - Reads report absence as `Ok(None)`, never as an error.
//! - `evict` reports policy refusals (disruption budgets) as
//!   [ReconcileError::EvictionBlocked].

use async_trait::async_trait;

use evreq_api::EvictionRequest;

use crate::error::ReconcileError;

/// Observed identity of a pod, enough to detect same-name replacements.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PodIdentity {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
}

impl PodIdentity {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: Some(uid.into()),
        }
    }

    pub fn uid_matches(&self, expected: &str) -> bool {
        self.uid.as_deref() == Some(expected)
    }
}

#[async_trait]
pub trait EvictionRequestStore: Send + Sync {
    /// Read an eviction request by namespaced name.
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EvictionRequest>, ReconcileError>;

    /// Persist `.status` and return the stored object with its new resourceVersion.
    async fn update_status(
        &self,
        request: &EvictionRequest,
    ) -> Result<EvictionRequest, ReconcileError>;
}

#[async_trait]
pub trait PodTargets: Send + Sync {
    async fn get(&self, namespace: &str, name: &str)
        -> Result<Option<PodIdentity>, ReconcileError>;

    /// Issue the terminal Eviction API call.
    async fn evict(&self, pod: &PodIdentity) -> Result<(), ReconcileError>;
}
