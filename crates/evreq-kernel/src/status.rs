//! Status discipline: condition upserts, the failed-eviction counter and the
//! cancellation-policy default.
//!
//! The free functions are pure mutations of [EvictionRequestStatus]; [StatusManager]
//! applies them and persists through exactly one `update_status` call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::ResourceExt;
use tracing::{debug, error};

use evreq_api::{
    CancellationPolicy, ConditionStatus, EvictionRequest, EvictionRequestStatus,
    PodEvictionStatus, CONDITION_TYPE_EVICTED, REASON_EVICTION_FAILED,
};

use crate::clock::Clock;
use crate::error::ReconcileError;
use crate::store::EvictionRequestStore;

/// Merge a condition by type. The transition time moves only when the status value
/// changes (or the type is new); reason and message are always overwritten.
/// Returns true when anything changed.
pub fn upsert_condition(
    status: &mut EvictionRequestStatus,
    condition_type: &str,
    condition_status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> bool {
    let value = condition_status.as_str();
    match status
        .conditions
        .iter_mut()
        .find(|c| c.type_ == condition_type)
    {
        Some(existing) => {
            let unchanged =
                existing.status == value && existing.reason == reason && existing.message == message;
            if existing.status != value {
                existing.last_transition_time = Time(now);
            }
            existing.status = value.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            !unchanged
        }
        None => {
            status.conditions.push(Condition {
                type_: condition_type.to_string(),
                status: value.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Time(now),
                observed_generation: None,
            });
            true
        }
    }
}

/// Set the cancellation policy to `Allow` when unset. Returns true when it was unset.
pub fn apply_default_cancellation_policy(status: &mut EvictionRequestStatus) -> bool {
    if status.eviction_request_cancellation_policy.is_some() {
        return false;
    }
    status.eviction_request_cancellation_policy = Some(CancellationPolicy::Allow);
    true
}

/// Increment the failed Eviction API counter, creating the pod status on first use.
/// Returns the new value; the counter saturates rather than wrapping.
pub fn increment_failed_eviction_counter(status: &mut EvictionRequestStatus) -> i32 {
    let pod_status = status
        .pod_eviction_status
        .get_or_insert_with(PodEvictionStatus::default);
    pod_status.failed_api_eviction_counter = pod_status.failed_api_eviction_counter.saturating_add(1);
    pod_status.failed_api_eviction_counter
}

/// Applies status mutations and persists them.
#[derive(Clone)]
pub struct StatusManager {
    store: Arc<dyn EvictionRequestStore>,
    clock: Arc<dyn Clock>,
}

impl StatusManager {
    pub fn new(store: Arc<dyn EvictionRequestStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Upsert a condition, apply the cancellation-policy default and persist.
    pub async fn upsert_condition(
        &self,
        request: &mut EvictionRequest,
        condition_type: &str,
        condition_status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Result<(), ReconcileError> {
        let now = self.clock.now();
        let status = request.status_mut();
        upsert_condition(status, condition_type, condition_status, reason, message, now);
        apply_default_cancellation_policy(status);
        debug!(
            namespace = %request.namespace().unwrap_or_default(),
            name = %request.name_any(),
            condition_type,
            condition_status = %condition_status,
            reason,
            "upserting eviction request condition"
        );
        self.persist(request).await
    }

    /// Record one failed Eviction API call as `Evicted=False/EvictionFailed`.
    pub async fn increment_failed_eviction_counter(
        &self,
        request: &mut EvictionRequest,
    ) -> Result<(), ReconcileError> {
        let status = request.status_mut();
        let counter = increment_failed_eviction_counter(status);
        apply_default_cancellation_policy(status);
        debug!(
            namespace = %request.namespace().unwrap_or_default(),
            name = %request.name_any(),
            failed_api_eviction_counter = counter,
            "incrementing failed eviction counter"
        );
        if let Err(err) = self
            .upsert_condition(
                request,
                CONDITION_TYPE_EVICTED,
                ConditionStatus::False,
                REASON_EVICTION_FAILED,
                "Failed to evict pod",
            )
            .await
        {
            error!(error = %err, "failed to increment failed eviction counter");
            return Err(err);
        }
        Ok(())
    }

    /// Write `.status` and adopt the stored object, so later writes in the same
    /// invocation carry the fresh resourceVersion.
    pub async fn persist(&self, request: &mut EvictionRequest) -> Result<(), ReconcileError> {
        match self.store.update_status(request).await {
            Ok(stored) => {
                *request = stored;
                Ok(())
            }
            Err(err) => {
                error!(
                    namespace = %request.namespace().unwrap_or_default(),
                    name = %request.name_any(),
                    error = %err,
                    "failed to update eviction request status"
                );
                Err(err)
            }
        }
    }
}
