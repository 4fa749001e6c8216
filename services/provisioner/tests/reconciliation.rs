//! Integration tests for the reconciliation engine.
//!
//! These drive `WebsiteReconciler` against the in-memory platform and backend:
//! 1. Child objects are created once and tolerated when present
//! 2. Waiting on the platform never touches status or the backend
//! 3. Readiness records `provisioned` locally before telling the backend
//! 4. Hard creation failures are reported as `failed` and returned

use std::sync::Arc;
use std::time::Duration;

use cloudself_provisioner::backend::{MockBackend, StatusUpdate};
use cloudself_provisioner::crd::{Phase, Website, WebsiteSpec, WebsiteStatus};
use cloudself_provisioner::engine::{ChildKind, ReconcileError, WebsiteReconciler};
use cloudself_provisioner::platform::{MockOp, MockPlatform};
use cloudself_reconcile::Outcome;

const NS: &str = "default";
const REQUEUE: Duration = Duration::from_secs(5);

struct Harness {
    platform: Arc<MockPlatform>,
    backend: Arc<MockBackend>,
    reconciler: WebsiteReconciler,
}

impl Harness {
    fn new() -> Self {
        let platform = Arc::new(MockPlatform::new());
        let backend = Arc::new(MockBackend::new());
        let reconciler = WebsiteReconciler::new(platform.clone(), backend.clone(), REQUEUE);
        Self {
            platform,
            backend,
            reconciler,
        }
    }

    fn with_website(name: &str, backend_id: i64) -> Self {
        let harness = Self::new();
        harness.platform.insert_website(website(name, backend_id));
        harness
    }

    async fn reconcile(&self, name: &str) -> Result<Outcome, ReconcileError> {
        self.reconciler.reconcile(NS, name).await
    }

    fn status(&self, name: &str) -> Option<WebsiteStatus> {
        self.platform.website(NS, name).and_then(|w| w.status)
    }
}

fn website(name: &str, backend_id: i64) -> Website {
    let mut website = Website::new(
        name,
        WebsiteSpec {
            website_name: name.to_string(),
            html_content: "<h1>hi</h1>".to_string(),
            user_id: "u1".to_string(),
            backend_id,
        },
    );
    website.metadata.namespace = Some(NS.to_string());
    website
}

#[tokio::test]
async fn test_missing_website_is_noop() {
    let h = Harness::new();

    let outcome = h.reconcile("ghost").await.unwrap();

    assert_eq!(outcome, Outcome::Done);
    assert_eq!(h.platform.create_calls(MockOp::CreateConfigMap), 0);
    assert!(h.backend.pushes().is_empty());
}

#[tokio::test]
async fn test_first_pass_creates_children_and_waits() {
    let h = Harness::with_website("demo", 7);

    let outcome = h.reconcile("demo").await.unwrap();

    assert_eq!(outcome, Outcome::RequeueAfter(REQUEUE));

    let cm = h.platform.config_map(NS, "demo").expect("config map created");
    assert_eq!(cm.data.unwrap()["index.html"], "<h1>hi</h1>");
    assert!(h.platform.pod(NS, "demo").is_some());
    assert!(h.platform.service(NS, "demo").is_some());

    // Children are owned by the Website for cascading deletion
    let owners = h.platform.pod(NS, "demo").unwrap().metadata.owner_references.unwrap();
    assert_eq!(owners[0].name, "demo");

    assert!(h.platform.status_writes().is_empty());
    assert!(h.backend.pushes().is_empty());
}

#[tokio::test]
async fn test_pod_not_running_requeues_without_side_effects() {
    let h = Harness::with_website("demo", 7);
    h.platform.set_initial_pod_phase("Pending");
    h.platform.set_initial_node_port(32000);

    for _ in 0..3 {
        let outcome = h.reconcile("demo").await.unwrap();
        assert_eq!(outcome, Outcome::RequeueAfter(REQUEUE));
    }

    assert!(h.status("demo").is_none());
    assert!(h.backend.pushes().is_empty());
}

#[tokio::test]
async fn test_running_without_node_port_is_transient() {
    let h = Harness::with_website("demo", 7);
    h.platform.set_initial_pod_phase("Running");

    let outcome = h.reconcile("demo").await.unwrap();

    assert_eq!(outcome, Outcome::RequeueAfter(REQUEUE));
    assert!(h.status("demo").is_none());
    assert!(h.backend.pushes().is_empty());
}

#[tokio::test]
async fn test_readiness_provisions_locally_and_on_backend() {
    let h = Harness::with_website("demo", 7);

    // Pass 1: objects created, platform still starting
    assert_eq!(
        h.reconcile("demo").await.unwrap(),
        Outcome::RequeueAfter(REQUEUE)
    );

    // Platform catches up
    h.platform.set_pod_phase(NS, "demo", "Running");
    h.platform.assign_node_port(NS, "demo", 32000);

    // Pass 2: re-reads live state of existing children
    assert_eq!(h.reconcile("demo").await.unwrap(), Outcome::Done);

    let status = h.status("demo").unwrap();
    assert_eq!(status.status, Phase::Provisioned);
    assert_eq!(status.pod_ip_address.as_deref(), Some(":32000"));
    assert!(status.error_message.is_none());
    assert!(status.last_reconcile_time.is_some());

    assert_eq!(
        h.backend.pushes(),
        vec![(7, StatusUpdate::provisioned(":32000"))]
    );
}

#[tokio::test]
async fn test_provisioned_is_terminal() {
    let h = Harness::with_website("demo", 7);
    h.platform.set_initial_pod_phase("Running");
    h.platform.set_initial_node_port(30080);

    assert_eq!(h.reconcile("demo").await.unwrap(), Outcome::Done);
    assert_eq!(h.backend.pushes().len(), 1);

    for _ in 0..5 {
        assert_eq!(h.reconcile("demo").await.unwrap(), Outcome::Done);
    }

    // No further backend calls or creations once provisioned
    assert_eq!(h.backend.pushes().len(), 1);
    assert_eq!(h.platform.create_calls(MockOp::CreatePod), 1);
    assert_eq!(h.platform.status_writes().len(), 1);
}

#[tokio::test]
async fn test_repeated_passes_converge_without_failures() {
    let h = Harness::with_website("demo", 7);

    for _ in 0..4 {
        assert_eq!(
            h.reconcile("demo").await.unwrap(),
            Outcome::RequeueAfter(REQUEUE)
        );
    }

    // Every re-entry hit "already exists" and none surfaced as failure
    assert_eq!(h.platform.create_calls(MockOp::CreateConfigMap), 4);
    assert!(h.backend.pushes().is_empty());

    h.platform.set_pod_phase(NS, "demo", "Running");
    h.platform.assign_node_port(NS, "demo", 31234);

    assert_eq!(h.reconcile("demo").await.unwrap(), Outcome::Done);
    assert_eq!(h.status("demo").unwrap().status, Phase::Provisioned);
}

#[tokio::test]
async fn test_config_map_failure_is_reported() {
    let h = Harness::with_website("demo", 7);
    h.platform.fail(MockOp::CreateConfigMap, "quota exceeded");

    let err = h.reconcile("demo").await.unwrap_err();

    assert!(matches!(
        err,
        ReconcileError::Creation {
            kind: ChildKind::ConfigMap,
            ..
        }
    ));

    // Later steps never ran
    assert_eq!(h.platform.create_calls(MockOp::CreatePod), 0);

    let pushes = h.backend.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, 7);
    assert_eq!(pushes[0].1.status, Phase::Failed);
    assert_eq!(
        pushes[0].1.error_message.as_deref(),
        Some("Failed to create ConfigMap: quota exceeded")
    );

    let status = h.status("demo").unwrap();
    assert_eq!(status.status, Phase::Failed);
    assert_eq!(
        status.error_message.as_deref(),
        Some("Failed to create ConfigMap: quota exceeded")
    );
}

#[tokio::test]
async fn test_repeated_identical_failure_is_reported_once() {
    let h = Harness::with_website("demo", 7);
    h.platform.fail(MockOp::CreateConfigMap, "quota exceeded");

    assert!(h.reconcile("demo").await.is_err());
    assert_eq!(h.platform.status_writes().len(), 1);
    assert_eq!(h.backend.pushes().len(), 1);

    // Nothing changed in between: the pass still fails, but writes nothing
    let err = h.reconcile("demo").await.unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Creation {
            kind: ChildKind::ConfigMap,
            ..
        }
    ));
    assert_eq!(h.platform.status_writes().len(), 1);
    assert_eq!(h.backend.pushes().len(), 1);

    // A different failure is news and gets reported
    h.platform.fail(MockOp::CreateConfigMap, "admission webhook denied");
    assert!(h.reconcile("demo").await.is_err());
    assert_eq!(h.platform.status_writes().len(), 2);

    let pushes = h.backend.pushes();
    assert_eq!(pushes.len(), 2);
    assert_eq!(
        pushes[1].1.error_message.as_deref(),
        Some("Failed to create ConfigMap: admission webhook denied")
    );
}

#[tokio::test]
async fn test_service_failure_is_reported() {
    let h = Harness::with_website("demo", 9);
    h.platform.fail(MockOp::CreateService, "admission webhook denied");

    let err = h.reconcile("demo").await.unwrap_err();

    assert!(matches!(
        err,
        ReconcileError::Creation {
            kind: ChildKind::Service,
            ..
        }
    ));
    assert!(h.platform.pod(NS, "demo").is_some());

    let pushes = h.backend.pushes();
    assert_eq!(pushes.len(), 1);
    assert!(pushes[0]
        .1
        .error_message
        .as_deref()
        .unwrap()
        .contains("admission webhook denied"));
}

#[tokio::test]
async fn test_failed_pass_can_recover_on_retry() {
    let h = Harness::with_website("demo", 7);
    h.platform.fail(MockOp::CreatePod, "node pressure");

    assert!(h.reconcile("demo").await.is_err());
    assert_eq!(h.status("demo").unwrap().status, Phase::Failed);

    h.platform.recover(MockOp::CreatePod);
    h.platform.set_initial_pod_phase("Running");
    h.platform.set_initial_node_port(32001);

    assert_eq!(h.reconcile("demo").await.unwrap(), Outcome::Done);

    let status = h.status("demo").unwrap();
    assert_eq!(status.status, Phase::Provisioned);
    assert!(status.error_message.is_none());

    let pushes = h.backend.pushes();
    assert_eq!(pushes.len(), 2);
    assert_eq!(pushes[1], (7, StatusUpdate::provisioned(":32001")));
}

#[tokio::test]
async fn test_status_write_failure_skips_backend_push() {
    let h = Harness::with_website("demo", 7);
    h.platform.set_initial_pod_phase("Running");
    h.platform.set_initial_node_port(32000);
    h.platform.fail(MockOp::UpdateStatus, "conflict");

    let err = h.reconcile("demo").await.unwrap_err();

    assert!(matches!(err, ReconcileError::StatusWrite(_)));
    assert!(h.backend.pushes().is_empty());

    // Retry after the API recovers completes the pass
    h.platform.recover(MockOp::UpdateStatus);
    assert_eq!(h.reconcile("demo").await.unwrap(), Outcome::Done);
    assert_eq!(
        h.backend.pushes(),
        vec![(7, StatusUpdate::provisioned(":32000"))]
    );
}

#[tokio::test]
async fn test_backend_push_failure_keeps_local_status() {
    let h = Harness::with_website("demo", 7);
    h.platform.set_initial_pod_phase("Running");
    h.platform.set_initial_node_port(32000);
    h.backend.fail_push("backend down");

    let outcome = h.reconcile("demo").await.unwrap();

    assert_eq!(outcome, Outcome::Done);
    assert_eq!(h.status("demo").unwrap().status, Phase::Provisioned);
    assert_eq!(h.backend.pushes().len(), 1);
}

#[tokio::test]
async fn test_lookup_failure_of_existing_pod_propagates() {
    let h = Harness::with_website("demo", 7);
    assert!(h.reconcile("demo").await.is_ok());

    h.platform.fail(MockOp::GetPod, "connection reset");
    let err = h.reconcile("demo").await.unwrap_err();

    assert!(matches!(err, ReconcileError::Platform(_)));
    // Not a creation failure; nothing reported
    assert!(h.backend.pushes().is_empty());
}

#[tokio::test]
async fn test_deleted_between_passes() {
    let h = Harness::with_website("demo", 7);
    assert!(h.reconcile("demo").await.is_ok());

    h.platform.delete_website(NS, "demo");

    assert_eq!(h.reconcile("demo").await.unwrap(), Outcome::Done);
    assert!(h.backend.pushes().is_empty());
}
