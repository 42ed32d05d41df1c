//! Terminal eviction: the irreversible last step once no interceptor remains.
//!
//! This is the only place the failed-eviction counter moves and the only place a
//! positive `Evicted` condition is recorded.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{error, info, warn};

use evreq_api::{
    ConditionStatus, EvictionRequest, CONDITION_TYPE_EVICTED, CONDITION_TYPE_READY,
    REASON_EVICTION_SUCCEEDED, REASON_POD_NOT_FOUND,
};

use crate::error::ReconcileError;
use crate::status::StatusManager;
use crate::store::PodTargets;

const NIL_POD_REF_MESSAGE: &str = "EvictionRequest.Spec.Target.PodRef cannot be nil";

#[derive(Clone)]
pub struct EvictionPerformer {
    pods: Arc<dyn PodTargets>,
    status: StatusManager,
}

impl EvictionPerformer {
    pub fn new(pods: Arc<dyn PodTargets>, status: StatusManager) -> Self {
        Self { pods, status }
    }

    /// Evict the target pod and record the outcome on the request.
    ///
    /// A pod that is gone (or replaced under the same name) is a silent no-op. A
    /// failed eviction bumps the counter, records `Evicted=False` and returns the
    /// eviction error so the work queue retries.
    pub async fn perform(&self, request: &mut EvictionRequest) -> Result<(), ReconcileError> {
        let namespace = request.namespace().unwrap_or_default();
        let Some(pod_ref) = request.pod_ref().cloned() else {
            error!(
                namespace = %namespace,
                name = %request.name_any(),
                "FailedPrecondition: {}", NIL_POD_REF_MESSAGE
            );
            if let Err(err) = self
                .status
                .upsert_condition(
                    request,
                    CONDITION_TYPE_READY,
                    ConditionStatus::False,
                    REASON_POD_NOT_FOUND,
                    NIL_POD_REF_MESSAGE,
                )
                .await
            {
                warn!(error = %err, "failed to report missing pod reference");
            }
            return Err(ReconcileError::Precondition(
                "pod reference cannot be nil".to_string(),
            ));
        };

        let pod = match self.pods.get(&namespace, &pod_ref.name).await {
            Ok(Some(pod)) if pod.uid_matches(&pod_ref.uid) => pod,
            Ok(Some(pod)) => {
                warn!(
                    namespace = %namespace,
                    pod = %pod_ref.name,
                    expected_uid = %pod_ref.uid,
                    actual_uid = ?pod.uid,
                    "pod was replaced under the same name, skipping eviction"
                );
                return Ok(());
            }
            Ok(None) => {
                warn!(namespace = %namespace, pod = %pod_ref.name, "pod in pod reference not found, skipping");
                return Ok(());
            }
            Err(err) => {
                error!(namespace = %namespace, pod = %pod_ref.name, error = %err, "failed to get pod");
                return Err(err);
            }
        };

        if let Err(err) = self.pods.evict(&pod).await {
            error!(namespace = %namespace, pod = %pod.name, error = %err, "failed to evict pod");
            if let Err(status_err) = self.status.increment_failed_eviction_counter(request).await {
                warn!(error = %status_err, "failed eviction was not recorded on the request");
            }
            return Err(err);
        }

        info!(namespace = %namespace, target_pod_name = %pod.name, "pod evicted successfully");
        self.status
            .upsert_condition(
                request,
                CONDITION_TYPE_EVICTED,
                ConditionStatus::True,
                REASON_EVICTION_SUCCEEDED,
                "Pod evicted successfully",
            )
            .await
    }
}
