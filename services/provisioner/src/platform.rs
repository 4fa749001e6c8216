//! Cluster platform interface and implementations.
//!
//! The platform interface is the narrow slice of the Kubernetes API the
//! provisioner touches:
//! - Website objects (read, create, status writes)
//! - Child ConfigMaps, Pods and Services (create, read)
//!
//! `KubePlatform` talks to a real API server. `MockPlatform` keeps objects in
//! memory and lets tests drive pod phases, node-port assignment and failures.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, PodStatus, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::crd::{Website, WebsiteStatus};

/// Platform call failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("{0}")]
    Api(String),
}

impl PlatformError {
    /// Classify a kube client error for an object of `kind` named `name`.
    pub fn from_kube(kind: &str, name: &str, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(response) if response.code == 404 => Self::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(response)
                if response.code == 409 && response.reason == "AlreadyExists" =>
            {
                Self::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            // resourceVersion conflicts share the 409 code
            _ => Self::Api(err.to_string()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Cluster operations used by the engine and the poller.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Fetch a Website; `None` if it does not exist.
    async fn get_website(&self, namespace: &str, name: &str)
        -> Result<Option<Website>, PlatformError>;

    /// Create a Website in its metadata namespace.
    async fn create_website(&self, website: &Website) -> Result<Website, PlatformError>;

    /// Replace the status of a Website.
    async fn update_website_status(
        &self,
        namespace: &str,
        name: &str,
        status: &WebsiteStatus,
    ) -> Result<(), PlatformError>;

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, PlatformError>;

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, PlatformError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, PlatformError>;

    async fn create_service(&self, service: &Service) -> Result<Service, PlatformError>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, PlatformError>;
}

/// Platform backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
    manager: String,
}

impl KubePlatform {
    pub fn new(client: Client, manager: impl Into<String>) -> Self {
        Self {
            client,
            manager: manager.into(),
        }
    }

    async fn create<K>(&self, obj: &K) -> Result<K, PlatformError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
    {
        let kind = K::kind(&()).to_string();
        let name = obj.name_any();
        let namespace = obj
            .namespace()
            .ok_or_else(|| PlatformError::Api(format!("{kind} {name} has no namespace")))?;

        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            field_manager: Some(self.manager.clone()),
            ..PostParams::default()
        };

        api.create(&params, obj)
            .await
            .map_err(|e| PlatformError::from_kube(&kind, &name, e))
    }

    async fn get<K>(&self, namespace: &str, name: &str) -> Result<K, PlatformError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| PlatformError::from_kube(&K::kind(&()), name, e))
    }
}

#[async_trait]
impl Platform for KubePlatform {
    async fn get_website(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Website>, PlatformError> {
        let api: Api<Website> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| PlatformError::from_kube("Website", name, e))
    }

    async fn create_website(&self, website: &Website) -> Result<Website, PlatformError> {
        self.create(website).await
    }

    async fn update_website_status(
        &self,
        namespace: &str,
        name: &str,
        status: &WebsiteStatus,
    ) -> Result<(), PlatformError> {
        let api: Api<Website> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        let params = PatchParams {
            field_manager: Some(self.manager.clone()),
            ..PatchParams::default()
        };

        api.patch_status(name, &params, &Patch::Merge(&patch))
            .await
            .map_err(|e| PlatformError::from_kube("Website", name, e))?;

        debug!(namespace, name, status = %status.status, "Website status written");
        Ok(())
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, PlatformError> {
        self.create(config_map).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, PlatformError> {
        self.create(pod).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, PlatformError> {
        self.get(namespace, name).await
    }

    async fn create_service(&self, service: &Service) -> Result<Service, PlatformError> {
        self.create(service).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, PlatformError> {
        self.get(namespace, name).await
    }
}

/// Operations of the mock platform that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MockOp {
    GetWebsite,
    CreateWebsite,
    UpdateStatus,
    CreateConfigMap,
    CreatePod,
    GetPod,
    CreateService,
    GetService,
}

type Key = (String, String);

/// In-memory platform for testing and development.
#[derive(Default)]
pub struct MockPlatform {
    state: Mutex<MockPlatformState>,
}

#[derive(Default)]
struct MockPlatformState {
    websites: BTreeMap<Key, Website>,
    config_maps: BTreeMap<Key, ConfigMap>,
    pods: BTreeMap<Key, Pod>,
    services: BTreeMap<Key, Service>,

    /// Operations failing for every object.
    failures: BTreeMap<MockOp, String>,

    /// Website names whose creation fails.
    failing_websites: BTreeMap<String, String>,

    /// Website names whose lookup fails.
    unreadable_websites: BTreeSet<String>,

    /// Phase given to newly created pods.
    initial_pod_phase: Option<String>,

    /// Node port given to newly created services.
    initial_node_port: Option<i32>,

    create_calls: BTreeMap<MockOp, usize>,
    status_writes: Vec<(Key, WebsiteStatus)>,
    uid_counter: u64,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `op` fail with `message`.
    pub fn fail(&self, op: MockOp, message: impl Into<String>) {
        self.lock().failures.insert(op, message.into());
    }

    /// Stop failing `op`.
    pub fn recover(&self, op: MockOp) {
        self.lock().failures.remove(&op);
    }

    /// Make creation of the Website `name` fail with `message`.
    pub fn fail_website_create(&self, name: &str, message: impl Into<String>) {
        self.lock()
            .failing_websites
            .insert(name.to_string(), message.into());
    }

    /// Make lookups of the Website `name` fail with a non-404 error.
    pub fn fail_website_lookup(&self, name: &str) {
        self.lock().unreadable_websites.insert(name.to_string());
    }

    /// Phase assigned to pods created from now on (default: none reported).
    pub fn set_initial_pod_phase(&self, phase: &str) {
        self.lock().initial_pod_phase = Some(phase.to_string());
    }

    /// Node port assigned to services created from now on.
    pub fn set_initial_node_port(&self, node_port: i32) {
        self.lock().initial_node_port = Some(node_port);
    }

    /// Set the live phase of an existing pod.
    pub fn set_pod_phase(&self, namespace: &str, name: &str, phase: &str) {
        let mut state = self.lock();
        if let Some(pod) = state.pods.get_mut(&key(namespace, name)) {
            pod.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                ..PodStatus::default()
            });
        }
    }

    /// Assign a node port to the first port of an existing service.
    pub fn assign_node_port(&self, namespace: &str, name: &str, node_port: i32) {
        let mut state = self.lock();
        if let Some(port) = state
            .services
            .get_mut(&key(namespace, name))
            .and_then(|svc| svc.spec.as_mut())
            .and_then(|spec| spec.ports.as_mut())
            .and_then(|ports| ports.first_mut())
        {
            port.node_port = Some(node_port);
        }
    }

    /// Store a Website directly, bypassing failure injection.
    pub fn insert_website(&self, mut website: Website) -> Website {
        let mut state = self.lock();
        state.assign_uid(&mut website);
        let k = key(
            website.metadata.namespace.as_deref().unwrap_or_default(),
            &website.name_any(),
        );
        state.websites.insert(k, website.clone());
        website
    }

    /// Remove a Website, as an external deletion would.
    pub fn delete_website(&self, namespace: &str, name: &str) {
        self.lock().websites.remove(&key(namespace, name));
    }

    pub fn website(&self, namespace: &str, name: &str) -> Option<Website> {
        self.lock().websites.get(&key(namespace, name)).cloned()
    }

    pub fn website_count(&self) -> usize {
        self.lock().websites.len()
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.lock().config_maps.get(&key(namespace, name)).cloned()
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.lock().pods.get(&key(namespace, name)).cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.lock().services.get(&key(namespace, name)).cloned()
    }

    /// Number of create calls attempted for `op`, including rejected ones.
    pub fn create_calls(&self, op: MockOp) -> usize {
        self.lock().create_calls.get(&op).copied().unwrap_or(0)
    }

    /// Every successful status write, in order.
    pub fn status_writes(&self) -> Vec<WebsiteStatus> {
        self.lock()
            .status_writes
            .iter()
            .map(|(_, status)| status.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockPlatformState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MockPlatformState {
    fn check(&self, op: MockOp) -> Result<(), PlatformError> {
        match self.failures.get(&op) {
            Some(message) => Err(PlatformError::Api(message.clone())),
            None => Ok(()),
        }
    }

    fn record_create(&mut self, op: MockOp) -> Result<(), PlatformError> {
        *self.create_calls.entry(op).or_default() += 1;
        self.check(op)
    }

    fn assign_uid(&mut self, website: &mut Website) {
        if website.metadata.uid.is_none() {
            self.uid_counter += 1;
            website.metadata.uid = Some(format!("uid-{:08x}", self.uid_counter));
        }
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn object_key<K: Resource>(kind: &str, obj: &K) -> Result<Key, PlatformError> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| PlatformError::Api(format!("{kind} {name} has no namespace")))?;
    Ok((namespace, name))
}

fn insert_new<T: Clone>(
    map: &mut BTreeMap<Key, T>,
    kind: &str,
    k: Key,
    obj: T,
) -> Result<T, PlatformError> {
    if map.contains_key(&k) {
        return Err(PlatformError::AlreadyExists {
            kind: kind.to_string(),
            name: k.1,
        });
    }
    map.insert(k, obj.clone());
    Ok(obj)
}

fn lookup<T: Clone>(map: &BTreeMap<Key, T>, kind: &str, k: Key) -> Result<T, PlatformError> {
    map.get(&k).cloned().ok_or(PlatformError::NotFound {
        kind: kind.to_string(),
        name: k.1,
    })
}

#[async_trait]
impl Platform for MockPlatform {
    async fn get_website(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Website>, PlatformError> {
        let state = self.lock();
        state.check(MockOp::GetWebsite)?;
        if state.unreadable_websites.contains(name) {
            return Err(PlatformError::Api(format!(
                "[MOCK] lookup of website {name} failed"
            )));
        }
        Ok(state.websites.get(&key(namespace, name)).cloned())
    }

    async fn create_website(&self, website: &Website) -> Result<Website, PlatformError> {
        let mut state = self.lock();
        state.record_create(MockOp::CreateWebsite)?;
        let k = object_key("Website", website)?;
        if let Some(message) = state.failing_websites.get(&k.1) {
            return Err(PlatformError::Api(message.clone()));
        }

        let mut website = website.clone();
        state.assign_uid(&mut website);
        insert_new(&mut state.websites, "Website", k, website)
    }

    async fn update_website_status(
        &self,
        namespace: &str,
        name: &str,
        status: &WebsiteStatus,
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();
        state.check(MockOp::UpdateStatus)?;
        let k = key(namespace, name);
        let website = state
            .websites
            .get_mut(&k)
            .ok_or_else(|| PlatformError::NotFound {
                kind: "Website".to_string(),
                name: name.to_string(),
            })?;
        website.status = Some(status.clone());
        state.status_writes.push((k, status.clone()));
        Ok(())
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, PlatformError> {
        let mut state = self.lock();
        state.record_create(MockOp::CreateConfigMap)?;
        let k = object_key("ConfigMap", config_map)?;
        insert_new(&mut state.config_maps, "ConfigMap", k, config_map.clone())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, PlatformError> {
        let mut state = self.lock();
        state.record_create(MockOp::CreatePod)?;
        let k = object_key("Pod", pod)?;

        let mut pod = pod.clone();
        pod.status = Some(PodStatus {
            phase: state.initial_pod_phase.clone(),
            ..PodStatus::default()
        });
        insert_new(&mut state.pods, "Pod", k, pod)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, PlatformError> {
        let state = self.lock();
        state.check(MockOp::GetPod)?;
        lookup(&state.pods, "Pod", key(namespace, name))
    }

    async fn create_service(&self, service: &Service) -> Result<Service, PlatformError> {
        let mut state = self.lock();
        state.record_create(MockOp::CreateService)?;
        let k = object_key("Service", service)?;

        let mut service = service.clone();
        if let Some(node_port) = state.initial_node_port {
            if let Some(port) = service
                .spec
                .as_mut()
                .and_then(|spec| spec.ports.as_mut())
                .and_then(|ports| ports.first_mut())
            {
                port.node_port = Some(node_port);
            }
        }
        insert_new(&mut state.services, "Service", k, service)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, PlatformError> {
        let state = self.lock();
        state.check(MockOp::GetService)?;
        lookup(&state.services, "Service", key(namespace, name))
    }
}
