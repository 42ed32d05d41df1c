use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use evreq_controller::{Controller, ControllerConfig};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,evreq_kernel=info,evreq_controller=info")
        }))
        .init();

    let config = ControllerConfig::from_env().context("invalid controller configuration")?;
    info!(
        kubeconfig = %config.kubeconfig.display(),
        workers = config.workers,
        resync_interval_secs = config.resync_interval.as_secs(),
        lease = %config.lease.name,
        lease_namespace = %config.lease.namespace,
        "starting eviction request controller"
    );
    let client = config
        .client()
        .await
        .context("failed to build kubernetes client")?;

    Controller::new(client, config)
        .run(shutdown_signal())
        .await
        .context("controller exited with error")?;
    info!("controller stopped");
    Ok(())
}
