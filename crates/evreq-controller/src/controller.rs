//! Wiring: election edges start and stop the informers and the worker pool.

use std::future::Future;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use evreq_api::EvictionRequest;
use evreq_kernel::{Reconciler, SystemClock};

use crate::config::{ConfigError, ControllerConfig};
use crate::election::{ElectionError, KubeLeaseLock, LeaseElector, Leadership};
use crate::kube_store::{KubePods, KubeRequestStore};
use crate::worker::{report_error, WorkerPool, WorkerPoolConfig};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("kubernetes client error: {0}")]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Election(#[from] ElectionError),
    #[error("leader election lost")]
    LeadershipLost,
    #[error("controller task failed: {0}")]
    Task(String),
}

pub struct Controller {
    client: Client,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(client: Client, config: ControllerConfig) -> Self {
        Self { client, config }
    }

    /// Campaign for the lease and serve while leading. Returns `Ok` when `shutdown`
    /// resolves and [ControllerError::LeadershipLost] when the lease is lost.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ControllerError>
    where
        F: Future<Output = ()>,
    {
        let lease = &self.config.lease;
        let identity = uuid::Uuid::new_v4().to_string();
        let lock = Arc::new(KubeLeaseLock::new(
            self.client.clone(),
            &lease.namespace,
            &lease.name,
        ));
        let elector = Arc::new(LeaseElector::new(
            lock,
            identity,
            lease.clone(),
            Arc::new(SystemClock),
        ));
        let mut edges = elector.subscribe();

        let (election_stop, election_stop_rx) = watch::channel(false);
        let election = {
            let elector = elector.clone();
            tokio::spawn(async move { elector.run(election_stop_rx).await })
        };

        let (serve_stop, serve_stop_rx) = watch::channel(false);
        let mut serving = None;
        let mut lost = false;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                changed = edges.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let edge = *edges.borrow_and_update();
                    match edge {
                        Leadership::StartedLeading if serving.is_none() => {
                            info!(identity = %elector.identity(), "started leading");
                            serving = Some(tokio::spawn(serve(
                                self.client.clone(),
                                self.config.clone(),
                                serve_stop_rx.clone(),
                            )));
                        }
                        Leadership::StoppedLeading => {
                            error!(identity = %elector.identity(), "stopped leading");
                            lost = true;
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        serve_stop.send_replace(true);
        if let Some(handle) = serving {
            handle
                .await
                .map_err(|e| ControllerError::Task(e.to_string()))??;
        }
        election_stop.send_replace(true);
        election
            .await
            .map_err(|e| ControllerError::Task(e.to_string()))?;

        if lost {
            return Err(ControllerError::LeadershipLost);
        }
        Ok(())
    }
}

/// Informers, periodic resync and workers for one term of leadership.
async fn serve(
    client: Client,
    config: ControllerConfig,
    stop: watch::Receiver<bool>,
) -> Result<(), ControllerError> {
    let (pods, pod_writer) = reflector::store::<Pod>();
    let pod_events = reflector(
        pod_writer,
        watcher(Api::<Pod>::all(client.clone()), watcher::Config::default()),
    )
    .default_backoff();
    let (requests, request_writer) = reflector::store::<EvictionRequest>();
    let request_events = reflector(
        request_writer,
        watcher(
            Api::<EvictionRequest>::all(client.clone()),
            watcher::Config::default(),
        ),
    )
    .default_backoff();

    let reconciler = Reconciler::new(
        Arc::new(KubeRequestStore::new(client.clone())),
        Arc::new(KubePods::new(client, pods.clone())),
        Arc::new(SystemClock),
    );
    let pool = WorkerPool::new(
        WorkerPoolConfig {
            workers: config.workers,
            ..WorkerPoolConfig::default()
        },
        Arc::new(reconciler),
    );

    let mut background = JoinSet::new();
    background.spawn(drain_pod_events(pod_events));
    background.spawn(drain_request_events(request_events, pool.clone()));
    background.spawn(resync(requests.clone(), pool.clone(), config.resync_interval));

    info!("waiting for informer caches to sync");
    let synced = async {
        pods.wait_until_ready().await?;
        requests.wait_until_ready().await
    };
    tokio::select! {
        _ = stopped(stop.clone()) => {
            background.abort_all();
            return Ok(());
        }
        result = synced => match result {
            Ok(()) => info!("informer caches synced"),
            Err(err) => report_error("cache sync", &err),
        }
    }

    pool.run(stopped(stop)).await;
    background.abort_all();
    while background.join_next().await.is_some() {}
    Ok(())
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

async fn drain_pod_events<S>(events: S)
where
    S: Stream<Item = Result<watcher::Event<Pod>, watcher::Error>>,
{
    let mut events = std::pin::pin!(events);
    while let Some(event) = events.next().await {
        if let Err(err) = event {
            warn!(error = %err, "pod watch error");
        }
    }
}

async fn drain_request_events<S>(events: S, pool: WorkerPool)
where
    S: Stream<Item = Result<watcher::Event<EvictionRequest>, watcher::Error>>,
{
    let mut events = std::pin::pin!(events);
    while let Some(event) = events.next().await {
        on_request_event(&pool, event);
    }
}

/// Apply events (initial list and updates) enqueue; deletes drop the request's
/// snapshot and retry state.
pub fn on_request_event(
    pool: &WorkerPool,
    event: Result<watcher::Event<EvictionRequest>, watcher::Error>,
) {
    match event {
        Ok(watcher::Event::Apply(request)) | Ok(watcher::Event::InitApply(request)) => {
            pool.enqueue(&request)
        }
        Ok(watcher::Event::Delete(request)) => {
            debug!(namespace = ?request.metadata.namespace, name = ?request.metadata.name, "eviction request deleted");
            pool.forget_request(&request);
        }
        Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
        Err(err) => warn!(error = %err, "eviction request watch error"),
    }
}

/// Re-enqueue every cached request each `period`. Stalled interceptors are only
/// noticed on a reconcile, so this bounds how late a missed heartbeat is seen.
async fn resync(
    requests: reflector::Store<EvictionRequest>,
    pool: WorkerPool,
    period: std::time::Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let all = requests.state();
        debug!(count = all.len(), "resyncing eviction requests");
        for request in all {
            pool.enqueue(&request);
        }
    }
}
