//! Priority-ordered hand-off between interceptors.
//!
//! The machine keeps no memory of its own. [decide] reads the persisted status and
//! names the next step; [InterceptorStateMachine::handle] applies it and persists, and
//! the resulting watch event drives the following step.

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use evreq_api::{
    ConditionStatus, EvictionRequest, EvictionRequestStatus, Interceptor,
    CONDITION_TYPE_INTERCEPTING, REASON_INTERCEPTORS_NOT_READY, REASON_INTERCEPTORS_READY,
};

use crate::error::ReconcileError;
use crate::eviction::EvictionPerformer;
use crate::status::{self, StatusManager};

/// Next step for a request, derived from its spec and status alone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InterceptorDecision {
    /// No interceptor has been selected yet.
    Select { class: String },
    /// The active interceptor completed and a lower-priority one follows.
    HandOff { from: String, to: String },
    /// Every interceptor had its turn; the pod can be evicted.
    Exhausted { last: Option<String> },
    /// The active interceptor was silent for longer than the heartbeat deadline.
    Stalled {
        class: String,
        silence: Duration,
        deadline: Duration,
    },
    /// The active interceptor still owns the request.
    Waiting { class: String },
}

/// Hand-off order: priority descending, then class name ascending.
pub fn sorted_interceptors(interceptors: &[Interceptor]) -> Vec<&Interceptor> {
    let mut sorted: Vec<&Interceptor> = interceptors.iter().collect();
    sorted.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.interceptor_class.cmp(&b.interceptor_class))
    });
    sorted
}

pub fn decide(request: &EvictionRequest, now: DateTime<Utc>) -> InterceptorDecision {
    let sorted = sorted_interceptors(&request.spec.interceptors);

    let Some(active) = request.active_interceptor_class() else {
        return match sorted.first() {
            Some(first) => InterceptorDecision::Select {
                class: first.interceptor_class.clone(),
            },
            None => InterceptorDecision::Exhausted { last: None },
        };
    };

    if request.active_interceptor_completed() {
        // An active class missing from the spec has nothing after it.
        let next = sorted
            .iter()
            .position(|i| i.interceptor_class == active)
            .and_then(|pos| sorted.get(pos + 1));
        return match next {
            Some(next) => InterceptorDecision::HandOff {
                from: active.to_string(),
                to: next.interceptor_class.clone(),
            },
            None => InterceptorDecision::Exhausted {
                last: Some(active.to_string()),
            },
        };
    }

    let deadline = request.heartbeat_deadline();
    match request.heartbeat_time() {
        Some(heartbeat) if now - heartbeat > deadline => InterceptorDecision::Stalled {
            class: active.to_string(),
            silence: now - heartbeat,
            deadline,
        },
        _ => InterceptorDecision::Waiting {
            class: active.to_string(),
        },
    }
}

/// Grant ownership to `class`: reset completion, drop the previous estimate and
/// start the heartbeat window at `now`.
pub fn select_interceptor(status: &mut EvictionRequestStatus, class: &str, now: DateTime<Utc>) {
    status.active_interceptor_class = Some(class.to_string());
    status.active_interceptor_completed = false;
    status.expected_interceptor_finish_time = None;
    status.heartbeat_time = Some(Time(now));
    status::upsert_condition(
        status,
        CONDITION_TYPE_INTERCEPTING,
        ConditionStatus::True,
        REASON_INTERCEPTORS_READY,
        &format!("Interceptor {} is active", class),
        now,
    );
}

#[derive(Clone)]
pub struct InterceptorStateMachine {
    status: StatusManager,
    performer: EvictionPerformer,
}

impl InterceptorStateMachine {
    pub fn new(status: StatusManager, performer: EvictionPerformer) -> Self {
        Self { status, performer }
    }

    pub async fn handle(&self, request: &mut EvictionRequest) -> Result<(), ReconcileError> {
        let now = self.status.now();
        let namespace = request.namespace().unwrap_or_default();
        let name = request.name_any();

        match decide(request, now) {
            InterceptorDecision::Select { class } => {
                info!(namespace = %namespace, name = %name, interceptor_class = %class, "selecting first interceptor");
                select_interceptor(request.status_mut(), &class, now);
                self.status.persist(request).await
            }
            InterceptorDecision::HandOff { from, to } => {
                info!(
                    namespace = %namespace,
                    name = %name,
                    from = %from,
                    interceptor_class = %to,
                    "interceptor completed, handing off"
                );
                select_interceptor(request.status_mut(), &to, now);
                self.status.persist(request).await
            }
            InterceptorDecision::Stalled {
                class,
                silence,
                deadline,
            } => {
                warn!(
                    namespace = %namespace,
                    name = %name,
                    interceptor_class = %class,
                    silence_seconds = silence.num_seconds(),
                    deadline_seconds = deadline.num_seconds(),
                    "interceptor missed its heartbeat deadline, marking completed"
                );
                request.status_mut().active_interceptor_completed = true;
                self.status.persist(request).await
            }
            InterceptorDecision::Waiting { class } => {
                debug!(namespace = %namespace, name = %name, interceptor_class = %class, "waiting for active interceptor");
                Ok(())
            }
            InterceptorDecision::Exhausted { last } => {
                info!(
                    namespace = %namespace,
                    name = %name,
                    last_interceptor_class = last.as_deref().unwrap_or_default(),
                    "all interceptors processed, evicting pod"
                );
                // Persisted on its own so it survives a performer no-op.
                if status::upsert_condition(
                    request.status_mut(),
                    CONDITION_TYPE_INTERCEPTING,
                    ConditionStatus::False,
                    REASON_INTERCEPTORS_NOT_READY,
                    "All interceptors have completed",
                    now,
                ) {
                    self.status.persist(request).await?;
                }
                self.performer.perform(request).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;
    use evreq_api::{
        EvictionRequestSpec, EvictionTarget, LocalPodReference, CONDITION_TYPE_EVICTED,
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
                heartbeat_deadline_seconds: Some(600),
                ..Default::default()
            },
        );
        request.metadata.namespace = Some("shop".into());
        request
    }

    fn a_and_b() -> Vec<Interceptor> {
        vec![Interceptor::new("a", 10), Interceptor::new("b", 20)]
    }

    struct Fixture {
        store: Arc<InMemoryRequestStore>,
        pods: Arc<InMemoryPods>,
        clock: Arc<ManualClock>,
        machine: InterceptorStateMachine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryRequestStore::new());
        let pods = Arc::new(InMemoryPods::new());
        pods.insert(PodIdentity::new("shop", "web-0", "uid-1"));
        let clock = Arc::new(ManualClock::new(t0()));
        let status = StatusManager::new(store.clone(), clock.clone());
        let performer = EvictionPerformer::new(pods.clone(), status.clone());
        Fixture {
            store,
            pods,
            clock,
            machine: InterceptorStateMachine::new(status, performer),
        }
    }

    fn complete(store: &InMemoryRequestStore) -> EvictionRequest {
        store
            .mutate_status("shop", "evict-web-0", |r| {
                r.status_mut().active_interceptor_completed = true;
            })
            .expect("mutate")
    }

    #[test]
    fn ties_break_by_class_name() {
        let interceptors = vec![
            Interceptor::new("zeta", 5),
            Interceptor::new("alpha", 5),
            Interceptor::new("top", 50),
        ];
        let order: Vec<&str> = sorted_interceptors(&interceptors)
            .into_iter()
            .map(|i| i.interceptor_class.as_str())
            .collect();
        assert_eq!(order, vec!["top", "alpha", "zeta"]);
    }

    #[test]
    fn heartbeat_exactly_at_deadline_is_not_stalled() {
        let mut request = request(a_and_b());
        select_interceptor(request.status_mut(), "b", t0());

        let at_deadline = t0() + Duration::seconds(600);
        assert_eq!(
            decide(&request, at_deadline),
            InterceptorDecision::Waiting { class: "b".into() }
        );
        assert!(matches!(
            decide(&request, at_deadline + Duration::seconds(1)),
            InterceptorDecision::Stalled { .. }
        ));
    }

    #[test]
    fn active_without_heartbeat_waits() {
        let mut request = request(a_and_b());
        request.status_mut().active_interceptor_class = Some("b".into());
        assert_eq!(
            decide(&request, t0() + Duration::days(30)),
            InterceptorDecision::Waiting { class: "b".into() }
        );
    }

    #[test]
    fn completed_unknown_class_counts_as_exhausted() {
        let mut request = request(a_and_b());
        let status = request.status_mut();
        status.active_interceptor_class = Some("removed".into());
        status.active_interceptor_completed = true;
        assert_eq!(
            decide(&request, t0()),
            InterceptorDecision::Exhausted {
                last: Some("removed".into())
            }
        );
    }

    #[tokio::test]
    async fn selects_highest_priority_first() {
        let f = fixture();
        let mut request = f.store.insert(request(a_and_b())).expect("insert");

        f.machine.handle(&mut request).await.expect("select");

        let stored = f.store.snapshot("shop", "evict-web-0").expect("stored");
        assert_eq!(stored.active_interceptor_class(), Some("b"));
        assert!(!stored.active_interceptor_completed());
        assert_eq!(stored.heartbeat_time(), Some(t0()));
        let intercepting = stored
            .condition(CONDITION_TYPE_INTERCEPTING)
            .expect("condition");
        assert_eq!(intercepting.status, "True");
    }

    #[tokio::test]
    async fn completed_interceptor_hands_off_to_next() {
        let f = fixture();
        let mut request = f.store.insert(request(a_and_b())).expect("insert");
        f.machine.handle(&mut request).await.expect("select");
        f.store
            .mutate_status("shop", "evict-web-0", |r| {
                let status = r.status_mut();
                status.active_interceptor_completed = true;
                status.expected_interceptor_finish_time = Some(Time(t0() + Duration::hours(1)));
            })
            .expect("mutate");
        f.clock.advance(Duration::minutes(3));

        let mut request = f.store.snapshot("shop", "evict-web-0").expect("stored");
        f.machine.handle(&mut request).await.expect("hand off");

        let stored = f.store.snapshot("shop", "evict-web-0").expect("stored");
        assert_eq!(stored.active_interceptor_class(), Some("a"));
        assert!(!stored.active_interceptor_completed());
        assert_eq!(stored.heartbeat_time(), Some(t0() + Duration::minutes(3)));
        assert_eq!(
            stored
                .status
                .as_ref()
                .and_then(|s| s.expected_interceptor_finish_time.clone()),
            None
        );
    }

    #[tokio::test]
    async fn last_completed_interceptor_triggers_eviction() {
        let f = fixture();
        let mut seeded = request(a_and_b());
        let status = seeded.status_mut();
        status.active_interceptor_class = Some("a".into());
        status.active_interceptor_completed = true;
        let mut request = f.store.insert(seeded).expect("insert");

        f.machine.handle(&mut request).await.expect("evict");

        assert_eq!(f.pods.eviction_calls().len(), 1);
        let stored = f.store.snapshot("shop", "evict-web-0").expect("stored");
        assert_eq!(
            stored.condition(CONDITION_TYPE_EVICTED).map(|c| c.status.as_str()),
            Some("True")
        );
        assert_eq!(
            stored
                .condition(CONDITION_TYPE_INTERCEPTING)
                .map(|c| c.reason.as_str()),
            Some(REASON_INTERCEPTORS_NOT_READY)
        );
        assert_eq!(stored.active_interceptor_class(), Some("a"));
    }

    #[tokio::test]
    async fn exhausted_chain_records_intercepting_false_when_pod_is_gone() {
        let f = fixture();
        let mut seeded = request(a_and_b());
        let status = seeded.status_mut();
        status.active_interceptor_class = Some("a".into());
        status.active_interceptor_completed = true;
        let mut request = f.store.insert(seeded).expect("insert");
        f.pods.remove("shop", "web-0");

        f.machine.handle(&mut request).await.expect("no-op eviction");

        assert!(f.pods.eviction_calls().is_empty());
        let stored = f.store.snapshot("shop", "evict-web-0").expect("stored");
        let intercepting = stored
            .condition(CONDITION_TYPE_INTERCEPTING)
            .expect("intercepting condition");
        assert_eq!(intercepting.status, "False");
        assert_eq!(intercepting.reason, REASON_INTERCEPTORS_NOT_READY);
        assert!(stored.condition(CONDITION_TYPE_EVICTED).is_none());

        let writes = f.store.status_writes();
        let mut again = stored.clone();
        f.machine.handle(&mut again).await.expect("second pass");
        assert_eq!(f.store.status_writes(), writes);
    }

    #[tokio::test]
    async fn silent_interceptor_is_marked_completed() {
        let f = fixture();
        let mut request = f.store.insert(request(a_and_b())).expect("insert");
        f.machine.handle(&mut request).await.expect("select");
        f.clock.advance(Duration::seconds(601));

        f.machine.handle(&mut request).await.expect("stall");

        let stored = f.store.snapshot("shop", "evict-web-0").expect("stored");
        assert_eq!(stored.active_interceptor_class(), Some("b"));
        assert!(stored.active_interceptor_completed());
        assert!(f.pods.eviction_calls().is_empty());
    }

    #[tokio::test]
    async fn waiting_interceptor_writes_nothing() {
        let f = fixture();
        let mut request = f.store.insert(request(a_and_b())).expect("insert");
        f.machine.handle(&mut request).await.expect("select");
        let writes = f.store.status_writes();
        let before = f.store.snapshot("shop", "evict-web-0").expect("stored");
        f.clock.advance(Duration::seconds(599));

        f.machine.handle(&mut request).await.expect("wait");
        f.machine.handle(&mut request).await.expect("wait");

        assert_eq!(f.store.status_writes(), writes);
        assert_eq!(f.store.snapshot("shop", "evict-web-0"), Some(before));
    }

    #[tokio::test]
    async fn chain_visits_each_interceptor_once_then_evicts() {
        let f = fixture();
        let interceptors = vec![
            Interceptor::new("low", 1),
            Interceptor::new("high", 300),
            Interceptor::new("mid", 20),
        ];
        let mut request = f.store.insert(request(interceptors)).expect("insert");

        let mut visited = Vec::new();
        loop {
            f.machine.handle(&mut request).await.expect("reconcile");
            if !f.pods.eviction_calls().is_empty() {
                break;
            }
            let stored = f.store.snapshot("shop", "evict-web-0").expect("stored");
            let active = stored.active_interceptor_class().expect("active").to_string();
            assert!(!visited.contains(&active), "{} selected twice", active);
            visited.push(active);
            request = complete(&f.store);
        }

        assert_eq!(visited, vec!["high", "mid", "low"]);
        assert_eq!(f.pods.eviction_calls().len(), 1);
    }
}
