//! Schema for the `EvictionRequest` custom resource.
//!
//! An eviction request names one target (a pod) and an optional, prioritized
//! list of interceptors. Interceptors take turns owning the request through
//! `.status.activeInterceptorClass`; once none remain the controller evicts
//! the pod through the Eviction API.

pub mod constants;
pub mod v1alpha1;

pub use constants::{
    ConditionStatus, CONDITION_TYPE_EVICTED, CONDITION_TYPE_INTERCEPTING, CONDITION_TYPE_READY,
    DEFAULT_HEARTBEAT_DEADLINE_SECONDS, GROUP, REASON_EVICTION_FAILED, REASON_EVICTION_SUCCEEDED,
    REASON_INTERCEPTORS_NOT_READY, REASON_INTERCEPTORS_READY, REASON_POD_NOT_FOUND, VERSION,
};
pub use v1alpha1::{
    CancellationPolicy, EvictionRequest, EvictionRequestSpec, EvictionRequestStatus,
    EvictionRequestType, EvictionTarget, Interceptor, LocalPodReference, PodEvictionStatus,
    Requester,
};
