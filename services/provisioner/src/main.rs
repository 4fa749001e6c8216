//! CloudSelf Provisioner
//!
//! Runs two cooperating loops against one Kubernetes cluster:
//!
//! - **Ingestion poller**: turns pending backend records into Website objects
//! - **Website controller**: reconciles each Website into a ConfigMap, an
//!   nginx Pod and a NodePort Service, and reports the outcome to the backend

use std::sync::Arc;

use anyhow::{Context as _, Result};
use cloudself_provisioner::backend::BackendClient;
use cloudself_provisioner::config::Config;
use cloudself_provisioner::controller::{self, Context};
use cloudself_provisioner::engine::WebsiteReconciler;
use cloudself_provisioner::platform::KubePlatform;
use cloudself_provisioner::poller::{run_poll_loop, IngestionPoller};
use cloudself_provisioner::templates::MANAGER_NAME;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to CLOUDSELF_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting CloudSelf provisioner");
    info!(
        backend_url = %config.backend_url,
        namespace = %config.namespace,
        poll_interval_secs = config.poll_interval.as_secs(),
        requeue_secs = config.requeue_delay.as_secs(),
        "Configuration loaded"
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let platform = Arc::new(KubePlatform::new(client.clone(), MANAGER_NAME));
    let backend = Arc::new(
        BackendClient::new(&config.backend_url, config.backend_timeout)
            .context("Failed to build backend HTTP client")?,
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller = IngestionPoller::new(
        platform.clone(),
        backend.clone(),
        &config.namespace,
        config.poll_interval,
    );
    let poller_handle = tokio::spawn(run_poll_loop(
        poller,
        config.requeue_delay,
        shutdown_rx.clone(),
    ));

    let ctx = Arc::new(Context {
        reconciler: WebsiteReconciler::new(platform, backend, config.requeue_delay),
        namespace: config.namespace.clone(),
        error_backoff: config.error_backoff,
    });
    let controller_handle = tokio::spawn(controller::run(client, ctx, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = poller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Poller task panicked");
            }
        }
        result = controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Give in-flight passes a moment to finish
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    info!("Provisioner shutdown complete");
    Ok(())
}
