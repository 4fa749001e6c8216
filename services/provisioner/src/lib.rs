//! CloudSelf Provisioner Library
//!
//! The provisioner is a Kubernetes operator that turns websites stored in the
//! CloudSelf backend into running nginx deployments, then reports where they
//! can be reached.
//!
//! ## Architecture
//!
//! ```text
//! backend (pending records)
//!   └── IngestionPoller ──► Website CR
//!                             └── WebsiteReconciler ──► ConfigMap + Pod + Service
//!                                                   └──► backend (status push)
//! ```
//!
//! ## Modules
//!
//! - `crd`: the `Website` custom resource
//! - `templates`: pure builders for the child objects
//! - `backend`: HTTP client for the backend's provisioner API
//! - `platform`: narrow cluster interface, kube-backed and mock
//! - `engine`: the reconciliation state machine
//! - `poller`: backend ingestion
//! - `controller`: `kube::runtime` wiring

pub mod backend;
pub mod config;
pub mod controller;
pub mod crd;
pub mod engine;
pub mod platform;
pub mod poller;
pub mod templates;

// Re-export commonly used types
pub use backend::{BackendApi, BackendClient, BackendError, BackendRecord, MockBackend, StatusUpdate};
pub use crd::{Phase, Website, WebsiteSpec, WebsiteStatus};
pub use engine::{ReconcileError, WebsiteReconciler};
pub use platform::{KubePlatform, MockPlatform, Platform, PlatformError};
pub use poller::{IngestionPoller, PollReport};
