//! Kubernetes controller for `EvictionRequest` objects.
//!
//! Watches eviction requests and pods, feeds a deduplicating work queue, and runs a
//! fixed pool of workers over the reconciliation kernel while this process holds
//! the leader lease.

pub mod config;
pub mod controller;
pub mod election;
pub mod kube_store;
pub mod queue;
pub mod rate_limiter;
pub mod worker;

pub use config::{ConfigError, ControllerConfig, LeaseSettings};
pub use controller::{on_request_event, Controller, ControllerError};
pub use election::{ElectionError, KubeLeaseLock, LeaseElector, LeaseLock, LeaseRecord, Leadership};
pub use kube_store::{KubePods, KubeRequestStore};
pub use queue::{ObjectKey, WorkQueue};
pub use rate_limiter::{
    default_controller_rate_limiter, ItemExponentialBackoff, MaxOf, RateLimiter, TokenBucket,
};
pub use worker::{report_error, reported_errors, WorkerPool, WorkerPoolConfig};
