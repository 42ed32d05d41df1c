//! Leader election over a `coordination.k8s.io/v1` Lease.
//!
//! [LeaseElector] keeps at most one active controller per lease. Only the holder
//! runs workers; ownership changes are published as [Leadership] edges on a
//! `tokio::sync::watch` channel. A holder that cannot renew within the renew
//! deadline steps down, and other candidates take over once the recorded renew
//! time is older than the lease duration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use evreq_kernel::Clock;

use crate::config::LeaseSettings;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ElectionError {
    /// Another candidate updated the lease first.
    #[error("lease update conflict: {0}")]
    Conflict(String),
    #[error("lease api error: {0}")]
    Api(String),
}

/// Leadership edges as seen by this candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Leadership {
    Candidate,
    StartedLeading,
    StoppedLeading,
}

/// The fields of a Lease that election cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder_identity: Option<String>,
    pub lease_duration_seconds: i32,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub lease_transitions: i32,
    pub resource_version: Option<String>,
}

impl LeaseRecord {
    fn held_by_other(&self, identity: &str, now: DateTime<Utc>) -> bool {
        let Some(holder) = self.holder_identity.as_deref().filter(|h| !h.is_empty()) else {
            return false;
        };
        if holder == identity {
            return false;
        }
        match self.renew_time {
            Some(renewed) => {
                renewed + chrono::Duration::seconds(i64::from(self.lease_duration_seconds)) > now
            }
            None => false,
        }
    }
}

/// Storage for the lease. Updates must be conditional on `resource_version`.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    async fn get(&self) -> Result<Option<LeaseRecord>, ElectionError>;
    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, ElectionError>;
    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, ElectionError>;
}

pub struct KubeLeaseLock {
    api: Api<Lease>,
    name: String,
    namespace: String,
}

impl KubeLeaseLock {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: record.resource_version.clone(),
                ..ObjectMeta::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder_identity.clone(),
                lease_duration_seconds: Some(record.lease_duration_seconds),
                acquire_time: record.acquire_time.map(MicroTime),
                renew_time: record.renew_time.map(MicroTime),
                lease_transitions: Some(record.lease_transitions),
                ..LeaseSpec::default()
            }),
        }
    }
}

fn from_lease(lease: Lease) -> LeaseRecord {
    let spec = lease.spec.unwrap_or_default();
    LeaseRecord {
        holder_identity: spec.holder_identity,
        lease_duration_seconds: spec.lease_duration_seconds.unwrap_or(0),
        acquire_time: spec.acquire_time.map(|t| t.0),
        renew_time: spec.renew_time.map(|t| t.0),
        lease_transitions: spec.lease_transitions.unwrap_or(0),
        resource_version: lease.metadata.resource_version,
    }
}

fn lease_error(err: kube::Error) -> ElectionError {
    match &err {
        kube::Error::Api(response) if response.code == 409 => {
            ElectionError::Conflict(err.to_string())
        }
        _ => ElectionError::Api(err.to_string()),
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn get(&self) -> Result<Option<LeaseRecord>, ElectionError> {
        self.api
            .get_opt(&self.name)
            .await
            .map(|lease| lease.map(from_lease))
            .map_err(lease_error)
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, ElectionError> {
        self.api
            .create(&PostParams::default(), &self.to_lease(record))
            .await
            .map(from_lease)
            .map_err(lease_error)
    }

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, ElectionError> {
        self.api
            .replace(&self.name, &PostParams::default(), &self.to_lease(record))
            .await
            .map(from_lease)
            .map_err(lease_error)
    }
}

pub struct LeaseElector {
    lock: Arc<dyn LeaseLock>,
    identity: String,
    settings: LeaseSettings,
    clock: Arc<dyn Clock>,
    edges: watch::Sender<Leadership>,
}

impl LeaseElector {
    pub fn new(
        lock: Arc<dyn LeaseLock>,
        identity: impl Into<String>,
        settings: LeaseSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (edges, _) = watch::channel(Leadership::Candidate);
        Self {
            lock,
            identity: identity.into(),
            settings,
            clock,
            edges,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn subscribe(&self) -> watch::Receiver<Leadership> {
        self.edges.subscribe()
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.settings.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    /// One acquire-or-renew round. `Ok(true)` when this candidate holds the lease
    /// afterwards, `Ok(false)` when someone else does.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, ElectionError> {
        let now = self.clock.now();
        let Some(current) = self.lock.get().await? else {
            let record = LeaseRecord {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: self.lease_duration_seconds(),
                acquire_time: Some(now),
                renew_time: Some(now),
                lease_transitions: 0,
                resource_version: None,
            };
            return match self.lock.create(&record).await {
                Ok(_) => Ok(true),
                Err(ElectionError::Conflict(_)) => Ok(false),
                Err(err) => Err(err),
            };
        };

        if current.held_by_other(&self.identity, now) {
            return Ok(false);
        }

        let already_holder = current.holder_identity.as_deref() == Some(self.identity.as_str());
        let record = LeaseRecord {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: self.lease_duration_seconds(),
            acquire_time: if already_holder {
                current.acquire_time
            } else {
                Some(now)
            },
            renew_time: Some(now),
            lease_transitions: if already_holder {
                current.lease_transitions
            } else {
                current.lease_transitions.saturating_add(1)
            },
            resource_version: current.resource_version,
        };
        match self.lock.update(&record).await {
            Ok(_) => Ok(true),
            Err(ElectionError::Conflict(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Give the lease up so a successor does not wait for it to expire.
    pub async fn release(&self) -> Result<(), ElectionError> {
        let Some(current) = self.lock.get().await? else {
            return Ok(());
        };
        if current.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        let now = self.clock.now();
        let record = LeaseRecord {
            holder_identity: None,
            lease_duration_seconds: 1,
            acquire_time: Some(now),
            renew_time: Some(now),
            ..current
        };
        self.lock.update(&record).await.map(|_| ())
    }

    /// Campaign until elected, then renew until the renew deadline is missed or
    /// `shutdown` flips to true. Returns after publishing `StoppedLeading`, or
    /// without any edge when shut down while still a candidate.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(identity = %self.identity, lease = %self.settings.name, namespace = %self.settings.namespace, "attempting to acquire leader lease");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => break,
                Ok(false) => debug!(identity = %self.identity, "lease held by another candidate"),
                Err(err) => warn!(error = %err, "failed to acquire lease"),
            }
            if sleep_or_shutdown(self.settings.retry_period, &mut shutdown).await {
                return;
            }
        }

        info!(identity = %self.identity, "successfully acquired lease");
        self.edges.send_replace(Leadership::StartedLeading);

        let mut last_renewed = tokio::time::Instant::now();
        loop {
            if sleep_or_shutdown(self.settings.retry_period, &mut shutdown).await {
                if let Err(err) = self.release().await {
                    warn!(error = %err, "failed to release lease");
                }
                break;
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = tokio::time::Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "lease taken over by another candidate");
                    break;
                }
                Err(err) => warn!(error = %err, "failed to renew lease"),
            }
            if last_renewed.elapsed() >= self.settings.renew_deadline {
                warn!(identity = %self.identity, "failed to renew lease within the renew deadline");
                break;
            }
        }

        info!(identity = %self.identity, "leader lost");
        self.edges.send_replace(Leadership::StoppedLeading);
    }
}

/// Sleep for `period`; true when shutdown was requested first.
async fn sleep_or_shutdown(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let closed = tokio::select! {
        _ = tokio::time::sleep(period) => return false,
        changed = shutdown.changed() => changed.is_err(),
    };
    closed || *shutdown.borrow()
}
