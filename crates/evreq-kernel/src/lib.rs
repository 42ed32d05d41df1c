//! Eviction request reconciliation core.
//!
//! Every decision is re-derived from the persisted object alone: the kernel keeps no
//! state between invocations and is safe to re-run any number of times. Components,
//! leaves first:
//!
//! - [status]: condition upserts, failure counter, cancellation-policy default.
//! - [eviction]: the terminal Eviction API call and its bookkeeping.
//! - [interceptor]: priority ordering and hand-off between interceptors.
//! - [reconciler]: the per-item entry point used by the work queue.
//!
//! Remote state is reached only through the traits in [store] and [clock].

pub mod clock;
pub mod error;
pub mod eviction;
pub mod interceptor;
pub mod memory_store;
pub mod reconciler;
pub mod status;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ReconcileError;
pub use eviction::EvictionPerformer;
pub use interceptor::{decide, sorted_interceptors, InterceptorDecision, InterceptorStateMachine};
pub use memory_store::{InMemoryPods, InMemoryRequestStore};
pub use reconciler::{Reconcile, Reconciler};
pub use status::StatusManager;
pub use store::{EvictionRequestStore, PodIdentity, PodTargets};
