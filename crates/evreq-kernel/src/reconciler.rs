//! Per-item entry point: resolve the target, default the cancellation policy, route.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

use evreq_api::EvictionRequest;

use crate::clock::Clock;
use crate::error::ReconcileError;
use crate::eviction::EvictionPerformer;
use crate::interceptor::InterceptorStateMachine;
use crate::status::{self, StatusManager};
use crate::store::{EvictionRequestStore, PodTargets};

/// One reconciliation of one eviction request. Errors are retried by the caller.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, request: EvictionRequest) -> Result<(), ReconcileError>;
}

#[derive(Clone)]
pub struct Reconciler {
    pods: Arc<dyn PodTargets>,
    status: StatusManager,
    interceptors: InterceptorStateMachine,
    performer: EvictionPerformer,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn EvictionRequestStore>,
        pods: Arc<dyn PodTargets>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let status = StatusManager::new(store, clock);
        let performer = EvictionPerformer::new(pods.clone(), status.clone());
        let interceptors = InterceptorStateMachine::new(status.clone(), performer.clone());
        Self {
            pods,
            status,
            interceptors,
            performer,
        }
    }
}

#[async_trait]
impl Reconcile for Reconciler {
    /// A request deleted after it was queued is not an error.
    async fn reconcile(&self, request: EvictionRequest) -> Result<(), ReconcileError> {
        let namespace = request.namespace().unwrap_or_default();
        let name = request.name_any();
        match self.dispatch(request).await {
            Err(err) if err.is_not_found() => {
                debug!(namespace = %namespace, name = %name, error = %err, "eviction request no longer exists, nothing to do");
                Ok(())
            }
            result => result,
        }
    }
}

impl Reconciler {
    async fn dispatch(&self, mut request: EvictionRequest) -> Result<(), ReconcileError> {
        let namespace = request.namespace().unwrap_or_default();
        let name = request.name_any();

        // A missing reference is reported by the performer.
        let Some(pod_ref) = request.pod_ref().cloned() else {
            return self.performer.perform(&mut request).await;
        };

        match self.pods.get(&namespace, &pod_ref.name).await? {
            None => {
                debug!(namespace = %namespace, name = %name, pod = %pod_ref.name, "target pod not found, nothing to do");
                return Ok(());
            }
            Some(pod) if !pod.uid_matches(&pod_ref.uid) => {
                debug!(
                    namespace = %namespace,
                    name = %name,
                    pod = %pod_ref.name,
                    "target pod uid does not match, nothing to do"
                );
                return Ok(());
            }
            Some(_) => {}
        }

        if status::apply_default_cancellation_policy(request.status_mut()) {
            info!(namespace = %namespace, name = %name, "defaulting cancellation policy to Allow");
            self.status.persist(&mut request).await?;
        }

        if request.spec.interceptors.is_empty() {
            self.performer.perform(&mut request).await
        } else {
            self.interceptors.handle(&mut request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use evreq_api::{
        CancellationPolicy, EvictionRequestSpec, EvictionRequestStatus, EvictionTarget,
        Interceptor, LocalPodReference, CONDITION_TYPE_EVICTED, REASON_EVICTION_FAILED,
    };

    use crate::clock::ManualClock;
    use crate::memory_store::{InMemoryPods, InMemoryRequestStore};
    use crate::store::PodIdentity;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn request(interceptors: Vec<Interceptor>) -> EvictionRequest {
        let mut request = EvictionRequest::new(
            "evict-web-0",
            EvictionRequestSpec {
                target: EvictionTarget {
                    pod_ref: Some(LocalPodReference {
                        name: "web-0".into(),
                        uid: "uid-1".into(),
                    }),
                },
                interceptors,
                ..Default::default()
            },
        );
        request.metadata.namespace = Some("shop".into());
        request
    }

    struct Fixture {
        store: Arc<InMemoryRequestStore>,
        pods: Arc<InMemoryPods>,
        clock: Arc<ManualClock>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryRequestStore::new());
        let pods = Arc::new(InMemoryPods::new());
        pods.insert(PodIdentity::new("shop", "web-0", "uid-1"));
        let clock = Arc::new(ManualClock::new(t0()));
        let reconciler = Reconciler::new(store.clone(), pods.clone(), clock.clone());
        Fixture {
            store,
            pods,
            clock,
            reconciler,
        }
    }

    impl Fixture {
        fn stored(&self) -> EvictionRequest {
            self.store.snapshot("shop", "evict-web-0").expect("stored")
        }

        async fn reconcile_stored(&self) -> Result<(), ReconcileError> {
            self.reconciler.reconcile(self.stored()).await
        }
    }

    #[tokio::test]
    async fn no_interceptors_evicts_directly() {
        let f = fixture();
        f.store.insert(request(Vec::new())).expect("insert");

        f.reconcile_stored().await.expect("reconcile");

        assert_eq!(f.pods.eviction_calls().len(), 1);
        let stored = f.stored();
        assert_eq!(
            stored.condition(CONDITION_TYPE_EVICTED).map(|c| c.status.as_str()),
            Some("True")
        );
        let status = stored.status_or_default();
        assert_eq!(status.active_interceptor_class, None);
        assert!(!status.active_interceptor_completed);
        assert_eq!(status.heartbeat_time, None);
        assert_eq!(
            status.eviction_request_cancellation_policy,
            Some(CancellationPolicy::Allow)
        );
    }

    #[tokio::test]
    async fn absent_pod_is_a_noop() {
        let f = fixture();
        f.pods.remove("shop", "web-0");
        f.store.insert(request(Vec::new())).expect("insert");

        f.reconcile_stored().await.expect("reconcile");

        assert_eq!(f.store.status_writes(), 0);
        assert!(f.pods.eviction_calls().is_empty());
    }

    #[tokio::test]
    async fn replaced_pod_is_a_noop() {
        let f = fixture();
        f.pods.insert(PodIdentity::new("shop", "web-0", "uid-2"));
        f.store
            .insert(request(vec![Interceptor::new("a", 10)]))
            .expect("insert");

        f.reconcile_stored().await.expect("reconcile");

        assert_eq!(f.store.status_writes(), 0);
        assert_eq!(f.stored().status, None);
    }

    #[tokio::test]
    async fn forbid_policy_is_preserved() {
        let f = fixture();
        let mut seeded = request(vec![Interceptor::new("a", 10)]);
        seeded.status = Some(EvictionRequestStatus {
            eviction_request_cancellation_policy: Some(CancellationPolicy::Forbid),
            ..Default::default()
        });
        f.store.insert(seeded).expect("insert");

        f.reconcile_stored().await.expect("reconcile");

        let status = f.stored().status_or_default();
        assert_eq!(
            status.eviction_request_cancellation_policy,
            Some(CancellationPolicy::Forbid)
        );
        assert_eq!(status.active_interceptor_class.as_deref(), Some("a"));
        assert_eq!(f.store.status_writes(), 1);
    }

    #[tokio::test]
    async fn second_pass_without_changes_is_idempotent() {
        let f = fixture();
        f.store
            .insert(request(vec![Interceptor::new("a", 10), Interceptor::new("b", 20)]))
            .expect("insert");

        f.reconcile_stored().await.expect("first pass");
        let after_first = f.stored();
        let writes = f.store.status_writes();
        f.clock.advance(Duration::minutes(1));
        f.reconcile_stored().await.expect("second pass");

        assert_eq!(f.stored(), after_first);
        assert_eq!(f.store.status_writes(), writes);
        assert_eq!(after_first.active_interceptor_class(), Some("b"));
    }

    #[tokio::test]
    async fn failure_counter_never_decreases_across_retries() {
        let f = fixture();
        f.pods.block_evictions("Cannot evict pod as it would violate the pod's disruption budget.");
        f.store.insert(request(Vec::new())).expect("insert");

        let mut last = 0;
        for attempt in 1..=4 {
            let err = f.reconcile_stored().await.expect_err("blocked");
            assert!(err.is_eviction_failure());
            let counter = f.stored().failed_api_eviction_counter();
            assert!(counter >= last);
            assert_eq!(counter, attempt);
            last = counter;
        }
        let evicted = f.stored();
        let evicted = evicted.condition(CONDITION_TYPE_EVICTED).expect("condition");
        assert_eq!(evicted.reason, REASON_EVICTION_FAILED);

        f.pods.unblock_evictions();
        f.reconcile_stored().await.expect("evicted");
        assert_eq!(f.stored().failed_api_eviction_counter(), last);
    }

    #[tokio::test]
    async fn stale_snapshot_surfaces_conflict() {
        let f = fixture();
        let stale = f
            .store
            .insert(request(vec![Interceptor::new("a", 10)]))
            .expect("insert");
        f.store
            .mutate_status("shop", "evict-web-0", |r| {
                r.status_mut().message = "written by interceptor".into();
            })
            .expect("mutate");

        let err = f.reconciler.reconcile(stale).await.expect_err("conflict");

        assert!(err.is_conflict());
        assert_eq!(f.stored().active_interceptor_class(), None);
    }

    #[tokio::test]
    async fn deleted_request_is_a_noop() {
        let f = fixture();
        let mut gone = request(vec![Interceptor::new("a", 10)]);
        gone.metadata.resource_version = Some("1".into());

        f.reconciler.reconcile(gone).await.expect("deleted request");

        assert_eq!(f.store.snapshot("shop", "evict-web-0"), None);
        assert!(f.pods.eviction_calls().is_empty());
    }

    #[tokio::test]
    async fn deleted_request_without_interceptors_is_not_evicted() {
        let f = fixture();
        let mut gone = request(Vec::new());
        gone.metadata.resource_version = Some("1".into());

        f.reconciler.reconcile(gone).await.expect("deleted request");

        // The policy default is the first write and the store rejects it.
        assert_eq!(f.store.status_writes(), 1);
        assert!(f.pods.eviction_calls().is_empty());
    }

    #[tokio::test]
    async fn missing_pod_ref_is_a_precondition_error() {
        let f = fixture();
        let mut seeded = request(vec![Interceptor::new("a", 10)]);
        seeded.spec.target.pod_ref = None;
        f.store.insert(seeded).expect("insert");

        let err = f.reconcile_stored().await.expect_err("precondition");

        assert!(matches!(err, ReconcileError::Precondition(_)));
        assert!(f.pods.eviction_calls().is_empty());
    }
}
