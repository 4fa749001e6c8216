//! Website reconciliation engine.
//!
//! One pass drives a single `Website` toward a running nginx topology:
//!
//! 1. Load the Website; a missing object means nothing to do
//! 2. Stop early if it is already provisioned
//! 3. Ensure the ConfigMap, Pod and Service exist ("already exists" is fine)
//! 4. Inspect the live Pod phase and Service node port
//! 5. Requeue while the platform is still starting things, or record
//!    `provisioned` locally and then on the backend
//!
//! Creation and readiness inspection are separate steps: a created Pod is
//! not a running Pod. Hard creation failures are mirrored to the Website
//! status and the backend, then returned so the trigger mechanism can back
//! off. Passes are idempotent and safe to abandon at any await point.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cloudself_reconcile::Outcome;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{Resource, ResourceExt};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendApi, StatusUpdate};
use crate::crd::{Phase, Website, WebsiteStatus};
use crate::platform::{Platform, PlatformError};
use crate::templates;

/// Pod phase that counts as serving.
pub const POD_RUNNING: &str = "Running";

/// Child object kinds, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    ConfigMap,
    Pod,
    Service,
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildKind::ConfigMap => write!(f, "ConfigMap"),
            ChildKind::Pod => write!(f, "Pod"),
            ChildKind::Service => write!(f, "Service"),
        }
    }
}

/// Reconciliation errors surfaced to the trigger mechanism.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A child object could not be created. Already reported as `failed`.
    #[error("failed to create {kind}: {source}")]
    Creation {
        kind: ChildKind,
        #[source]
        source: PlatformError,
    },

    /// The provisioned status could not be written; the backend was not told.
    #[error("failed to write website status: {0}")]
    StatusWrite(#[source] PlatformError),

    /// Reading cluster state failed.
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Live child state relevant to readiness.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveChildren {
    /// Reported Pod phase, if any.
    pub pod_phase: Option<String>,

    /// First node port assigned to the Service, if any.
    pub node_port: Option<i32>,
}

impl LiveChildren {
    /// Extract readiness inputs from live objects.
    pub fn observe(pod: &Pod, service: &Service) -> Self {
        let pod_phase = pod.status.as_ref().and_then(|status| status.phase.clone());
        let node_port = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .and_then(|ports| {
                ports
                    .iter()
                    .find_map(|port| port.node_port.filter(|n| *n > 0))
            });

        Self {
            pod_phase,
            node_port,
        }
    }
}

/// Readiness of a website's topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Pod running and reachable on `node_port`.
    Ready { node_port: i32 },

    /// Pod running, node port not assigned yet.
    AwaitingPort,

    /// Pod not running yet.
    AwaitingPod { phase: Option<String> },
}

/// What to do after observing live state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Record `provisioned` with this access descriptor.
    Provision { endpoint: String },

    /// Check again later without touching status.
    Requeue { after: Duration, readiness: Readiness },
}

/// True when a pass has nothing left to do for this status.
pub fn is_settled(status: Option<&WebsiteStatus>) -> bool {
    status.is_some_and(WebsiteStatus::is_provisioned)
}

/// True when `status` already records a failure with exactly `message`.
///
/// A repeated identical failure leaves both the Website and the backend
/// untouched, so a failing pass produces no status event of its own.
pub fn failure_recorded(status: Option<&WebsiteStatus>, message: &str) -> bool {
    status.is_some_and(|status| {
        status.status == Phase::Failed && status.error_message.as_deref() == Some(message)
    })
}

pub fn assess_readiness(live: &LiveChildren) -> Readiness {
    if live.pod_phase.as_deref() != Some(POD_RUNNING) {
        return Readiness::AwaitingPod {
            phase: live.pod_phase.clone(),
        };
    }

    match live.node_port {
        Some(node_port) => Readiness::Ready { node_port },
        None => Readiness::AwaitingPort,
    }
}

/// Access descriptor for a node port.
///
/// Only the port is stored; the node address is resolved by whoever accesses
/// the site.
pub fn access_descriptor(node_port: i32) -> String {
    format!(":{node_port}")
}

pub fn decide(live: &LiveChildren, requeue_delay: Duration) -> Decision {
    match assess_readiness(live) {
        Readiness::Ready { node_port } => Decision::Provision {
            endpoint: access_descriptor(node_port),
        },
        readiness => Decision::Requeue {
            after: requeue_delay,
            readiness,
        },
    }
}

/// Result of an idempotent create.
#[derive(Debug)]
enum Ensured<T> {
    Created(T),
    Existed,
}

fn ensured<T>(result: Result<T, PlatformError>) -> Result<Ensured<T>, PlatformError> {
    match result {
        Ok(obj) => Ok(Ensured::Created(obj)),
        Err(e) if e.is_already_exists() => Ok(Ensured::Existed),
        Err(e) => Err(e),
    }
}

/// Give a child template the Website's namespace and controller reference.
fn adopt<K: Resource>(mut child: K, website: &Website, namespace: &str) -> K {
    let meta = child.meta_mut();
    meta.namespace = Some(namespace.to_string());
    if let Some(owner) = website.controller_owner_ref(&()) {
        meta.owner_references = Some(vec![owner]);
    }
    child
}

/// Reconciler driving Websites through the platform and the backend.
pub struct WebsiteReconciler {
    platform: Arc<dyn Platform>,
    backend: Arc<dyn BackendApi>,
    requeue_delay: Duration,
}

impl WebsiteReconciler {
    pub fn new(
        platform: Arc<dyn Platform>,
        backend: Arc<dyn BackendApi>,
        requeue_delay: Duration,
    ) -> Self {
        Self {
            platform,
            backend,
            requeue_delay,
        }
    }

    /// Perform one reconciliation pass for `namespace/name`.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Outcome, ReconcileError> {
        let Some(website) = self.platform.get_website(namespace, name).await? else {
            info!(namespace, name, "Website not found, assuming it was deleted");
            return Ok(Outcome::Done);
        };

        if is_settled(website.status.as_ref()) {
            debug!(
                namespace,
                name,
                endpoint = ?website.status.as_ref().and_then(|s| s.pod_ip_address.as_deref()),
                "Website already provisioned"
            );
            return Ok(Outcome::Done);
        }

        let website_name = website.spec.website_name.clone();

        let config_map = adopt(
            templates::build_config_map(&website_name, &website.spec.html_content),
            &website,
            namespace,
        );
        match ensured(self.platform.create_config_map(&config_map).await) {
            Ok(Ensured::Created(_)) => info!(namespace, name = %website_name, "Created ConfigMap"),
            Ok(Ensured::Existed) => debug!(namespace, name = %website_name, "ConfigMap exists"),
            Err(e) => return Err(self.fail(&website, namespace, ChildKind::ConfigMap, e).await),
        }

        let pod = adopt(templates::build_pod(&website_name), &website, namespace);
        let pod = match ensured(self.platform.create_pod(&pod).await) {
            Ok(Ensured::Created(pod)) => {
                info!(namespace, name = %website_name, "Created Pod");
                pod
            }
            // Live state may have moved past the template
            Ok(Ensured::Existed) => self.platform.get_pod(namespace, &website_name).await?,
            Err(e) => return Err(self.fail(&website, namespace, ChildKind::Pod, e).await),
        };

        let service = adopt(templates::build_service(&website_name), &website, namespace);
        let service = match ensured(self.platform.create_service(&service).await) {
            Ok(Ensured::Created(service)) => {
                info!(namespace, name = %website_name, "Created Service");
                service
            }
            Ok(Ensured::Existed) => self.platform.get_service(namespace, &website_name).await?,
            Err(e) => return Err(self.fail(&website, namespace, ChildKind::Service, e).await),
        };

        let live = LiveChildren::observe(&pod, &service);
        match decide(&live, self.requeue_delay) {
            Decision::Requeue { after, readiness } => {
                match &readiness {
                    Readiness::AwaitingPort => {
                        info!(namespace, name, "NodePort not yet assigned, requeueing")
                    }
                    Readiness::AwaitingPod { phase } => {
                        info!(namespace, name, phase = ?phase, "Pod not running yet, requeueing")
                    }
                    Readiness::Ready { .. } => {}
                }
                Ok(Outcome::RequeueAfter(after))
            }
            Decision::Provision { endpoint } => {
                let status = WebsiteStatus::provisioned(endpoint.clone(), Utc::now());
                self.platform
                    .update_website_status(namespace, name, &status)
                    .await
                    .map_err(|e| {
                        error!(namespace, name, error = %e, "Failed to update Website status");
                        ReconcileError::StatusWrite(e)
                    })?;

                info!(namespace, name, endpoint = %endpoint, "Website provisioned");
                self.push(website.spec.backend_id, &StatusUpdate::provisioned(endpoint))
                    .await;
                Ok(Outcome::Done)
            }
        }
    }

    /// Report a hard creation failure everywhere it is visible.
    async fn fail(
        &self,
        website: &Website,
        namespace: &str,
        kind: ChildKind,
        source: PlatformError,
    ) -> ReconcileError {
        let name = website.name_any();
        let message = format!("Failed to create {kind}: {source}");
        error!(namespace, name = %name, kind = %kind, error = %source, "Child creation failed");

        if failure_recorded(website.status.as_ref(), &message) {
            debug!(namespace, name = %name, "Failure already recorded, not reporting again");
            return ReconcileError::Creation { kind, source };
        }

        let status = WebsiteStatus::failed(message.clone(), Utc::now());
        if let Err(e) = self
            .platform
            .update_website_status(namespace, &name, &status)
            .await
        {
            warn!(namespace, name = %name, error = %e, "Failed to record failure in Website status");
        }

        self.push(website.spec.backend_id, &StatusUpdate::failed(message))
            .await;

        ReconcileError::Creation { kind, source }
    }

    /// Push a status to the backend; failures are logged only.
    async fn push(&self, backend_id: i64, update: &StatusUpdate) {
        match self.backend.push_status(backend_id, update).await {
            Ok(()) => info!(backend_id, status = %update.status, "Updated backend status"),
            Err(e) => error!(
                backend_id,
                status = %update.status,
                error = %e,
                "Failed to update backend status"
            ),
        }
    }
}
