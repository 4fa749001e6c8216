//! Controller wiring.
//!
//! Connects the reconciliation engine to `kube::runtime::Controller`, which
//! watches Websites and their owned children, deduplicates triggers per
//! object and applies requeue/backoff.
//!
//! Website events pass a generation filter: status writes do not bump
//! `metadata.generation`, so the engine's own writes never trigger a pass and
//! a failing Website waits out the error backoff.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::{predicates, reflector, watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::crd::Website;
use crate::engine::{ReconcileError, WebsiteReconciler};
use crate::templates;

/// Shared state handed to every reconciliation.
pub struct Context {
    pub reconciler: WebsiteReconciler,

    /// Namespace used when a watched object carries none.
    pub namespace: String,

    /// Requeue delay after a failed pass.
    pub error_backoff: Duration,
}

/// Map an engine outcome to a controller action.
fn action_for(outcome: cloudself_reconcile::Outcome) -> Action {
    match outcome.requeue_after() {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    }
}

async fn reconcile(website: Arc<Website>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let namespace = website
        .namespace()
        .unwrap_or_else(|| ctx.namespace.clone());
    let name = website.name_any();

    debug!(namespace = %namespace, name = %name, "Reconciling Website");
    let outcome = ctx.reconciler.reconcile(&namespace, &name).await?;
    Ok(action_for(outcome))
}

fn error_policy(website: Arc<Website>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    warn!(
        name = %website.name_any(),
        error = %error,
        backoff_secs = ctx.error_backoff.as_secs(),
        "Reconciliation failed, backing off"
    );
    Action::requeue(ctx.error_backoff)
}

/// Run the Website controller until shutdown.
pub async fn run(client: Client, ctx: Arc<Context>, mut shutdown: watch::Receiver<bool>) {
    let namespace = ctx.namespace.clone();
    let websites: Api<Website> = Api::namespaced(client.clone(), &namespace);
    let children = watcher::Config::default().labels(&templates::managed_selector());

    let (reader, writer) = reflector::store();
    let website_events = watcher(websites, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(predicates::generation);

    info!(namespace = %namespace, "Starting Website controller");

    Controller::for_stream(website_events, reader)
        .owns(
            Api::<ConfigMap>::namespaced(client.clone(), &namespace),
            children.clone(),
        )
        .owns(
            Api::<Pod>::namespaced(client.clone(), &namespace),
            children.clone(),
        )
        .owns(Api::<Service>::namespaced(client, &namespace), children)
        .graceful_shutdown_on(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => debug!(name = %obj.name, action = ?action, "Reconciled"),
                Err(e) => warn!(error = %e, "Controller error"),
            }
        })
        .await;

    info!("Website controller stopped");
}
