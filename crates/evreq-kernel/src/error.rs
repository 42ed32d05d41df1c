//! Error taxonomy for reconciliation.

/// Errors surfaced by the kernel. Every variant is returned to the work queue,
/// which is the single retry authority; nothing in the kernel retries internally.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(String),
    /// Optimistic-concurrency write rejected because of a stale resourceVersion.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("target lookup failed: {0}")]
    Target(String),
    /// Eviction refused by an external policy such as a PodDisruptionBudget.
    #[error("eviction blocked: {0}")]
    EvictionBlocked(String),
    #[error("eviction failed: {0}")]
    Eviction(String),
    #[error("failed precondition: {0}")]
    Precondition(String),
}

impl ReconcileError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcileError::NotFound(_))
    }

    /// True for failures of the terminal eviction call itself.
    pub fn is_eviction_failure(&self) -> bool {
        matches!(
            self,
            ReconcileError::EvictionBlocked(_) | ReconcileError::Eviction(_)
        )
    }
}
