//! Child resource templates for a website.
//!
//! Pure builders for the three objects that realize a `Website`:
//! - a ConfigMap holding the HTML document
//! - an nginx Pod serving that ConfigMap read-only
//! - a NodePort Service selecting the Pod
//!
//! All three share the website's name. Namespace and owner references are
//! attached by the caller.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, Pod, PodSpec,
    ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;

/// Name of the controller, used in the `managed-by` label.
pub const MANAGER_NAME: &str = "cloudself-provisioner";

pub const LABEL_APP: &str = "app";
pub const LABEL_WEBSITE: &str = "cloudself.dev/website";
pub const LABEL_MANAGED_BY: &str = "cloudself.dev/managed-by";

pub const APP_NAME: &str = "nginx";
pub const NGINX_IMAGE: &str = "nginx:1.25-alpine";
pub const HTTP_PORT_NAME: &str = "http";
pub const HTTP_PORT: i32 = 80;
pub const DOCUMENT_ROOT: &str = "/usr/share/nginx/html";
pub const CONTENT_VOLUME: &str = "html-content";
pub const CONTENT_KEY: &str = "index.html";

pub const CPU_REQUEST: &str = "100m";
pub const MEMORY_REQUEST: &str = "64Mi";
pub const CPU_LIMIT: &str = "200m";
pub const MEMORY_LIMIT: &str = "128Mi";

/// Labels carried by every child object.
pub fn labels(website_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), APP_NAME.to_string()),
        (LABEL_WEBSITE.to_string(), website_name.to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string()),
    ])
}

/// Label selector (`key=value`) matching objects managed by this controller.
pub fn managed_selector() -> String {
    format!("{LABEL_MANAGED_BY}={MANAGER_NAME}")
}

fn metadata(website_name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(website_name.to_string()),
        labels: Some(labels(website_name)),
        ..ObjectMeta::default()
    }
}

/// ConfigMap holding the HTML document as `index.html`.
pub fn build_config_map(website_name: &str, html: &str) -> ConfigMap {
    ConfigMap {
        metadata: metadata(website_name),
        data: Some(BTreeMap::from([(
            CONTENT_KEY.to_string(),
            html.to_string(),
        )])),
        ..ConfigMap::default()
    }
}

/// nginx Pod serving the website's ConfigMap on port 80.
pub fn build_pod(website_name: &str) -> Pod {
    let resources = ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(CPU_REQUEST.to_string())),
            ("memory".to_string(), Quantity(MEMORY_REQUEST.to_string())),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(CPU_LIMIT.to_string())),
            ("memory".to_string(), Quantity(MEMORY_LIMIT.to_string())),
        ])),
        ..ResourceRequirements::default()
    };

    let container = Container {
        name: APP_NAME.to_string(),
        image: Some(NGINX_IMAGE.to_string()),
        ports: Some(vec![ContainerPort {
            name: Some(HTTP_PORT_NAME.to_string()),
            container_port: HTTP_PORT,
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: CONTENT_VOLUME.to_string(),
            mount_path: DOCUMENT_ROOT.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        }]),
        resources: Some(resources),
        ..Container::default()
    };

    Pod {
        metadata: metadata(website_name),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(vec![Volume {
                name: CONTENT_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: website_name.to_string(),
                    ..ConfigMapVolumeSource::default()
                }),
                ..Volume::default()
            }]),
            restart_policy: Some("Always".to_string()),
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

/// NodePort Service exposing the website's Pod.
///
/// The node port itself is left for the cluster to assign.
pub fn build_service(website_name: &str) -> Service {
    Service {
        metadata: metadata(website_name),
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(BTreeMap::from([
                (LABEL_APP.to_string(), APP_NAME.to_string()),
                (LABEL_WEBSITE.to_string(), website_name.to_string()),
            ])),
            ports: Some(vec![ServicePort {
                name: Some(HTTP_PORT_NAME.to_string()),
                protocol: Some("TCP".to_string()),
                port: HTTP_PORT,
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}
