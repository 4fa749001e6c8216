//! Website custom resource definition.
//!
//! A `Website` is the cluster-resident desired-state record for one hosted
//! site. The spec is seeded from a backend record and never changes; the
//! status is owned by the reconciliation engine.

use std::fmt;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a DNS label.
pub const MAX_NAME_LEN: usize = 63;

/// Maximum size of the served HTML document (100 KiB).
pub const MAX_HTML_BYTES: usize = 100 * 1024;

/// WebsiteSpec defines the desired state of a Website.
#[derive(CustomResource, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "websites.cloudself.dev",
    version = "v1",
    kind = "Website",
    namespaced,
    status = "WebsiteStatus",
    shortname = "ws",
    printcolumn = r#"{"name":"Website Name","type":"string","jsonPath":".spec.websiteName"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.podIpAddress"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WebsiteSpec {
    /// DNS-compliant website name, also used for every child object.
    #[schemars(length(min = 1, max = 63), regex(pattern = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$"))]
    pub website_name: String,

    /// HTML document to serve.
    #[schemars(length(max = 102400))]
    pub html_content: String,

    /// Owning user.
    pub user_id: String,

    /// Id of the backend record this website mirrors.
    #[schemars(range(min = 1))]
    pub backend_id: i64,
}

impl WebsiteSpec {
    /// Check the constraints the CRD schema also enforces server-side.
    pub fn validate(&self) -> Result<(), SpecError> {
        validate_website_name(&self.website_name)?;
        validate_html(&self.html_content)?;
        if self.backend_id < 1 {
            return Err(SpecError::BackendId(self.backend_id));
        }
        Ok(())
    }
}

/// WebsiteStatus defines the observed state of a Website.
///
/// Optional fields serialize as `null` so a merge patch clears stale values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebsiteStatus {
    /// Lifecycle phase.
    #[serde(default)]
    pub status: Phase,

    /// Access descriptor (`:<nodePort>`) once provisioned.
    #[serde(default)]
    pub pod_ip_address: Option<String>,

    /// Failure context when provisioning failed.
    #[serde(default)]
    pub error_message: Option<String>,

    /// Last time the engine wrote this status.
    #[serde(default)]
    pub last_reconcile_time: Option<DateTime<Utc>>,
}

impl WebsiteStatus {
    /// Website reachable through `endpoint`.
    pub fn provisioned(endpoint: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: Phase::Provisioned,
            pod_ip_address: Some(endpoint.into()),
            error_message: None,
            last_reconcile_time: Some(now),
        }
    }

    /// Provisioning failed with `message`.
    pub fn failed(message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: Phase::Failed,
            pod_ip_address: None,
            error_message: Some(message.into()),
            last_reconcile_time: Some(now),
        }
    }

    /// Provisioned with a recorded endpoint.
    pub fn is_provisioned(&self) -> bool {
        self.status == Phase::Provisioned
            && self
                .pod_ip_address
                .as_deref()
                .is_some_and(|endpoint| !endpoint.is_empty())
    }
}

impl Website {
    /// Current phase; an object without status is pending.
    pub fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .map(|status| status.status)
            .unwrap_or_default()
    }
}

/// Website lifecycle phase, shared with the backend wire format.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Pending,
    Provisioned,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Provisioned => "provisioned",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Website spec validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("website name must be 1-63 characters, got {0}")]
    NameLength(usize),

    #[error("website name contains invalid character {0:?}")]
    NameCharacter(char),

    #[error("website name must start and end with an alphanumeric character")]
    NameEdge,

    #[error("html content is {0} bytes, limit is {MAX_HTML_BYTES}")]
    HtmlTooLarge(usize),

    #[error("backend id must be positive, got {0}")]
    BackendId(i64),
}

/// Validate a DNS label: lowercase alphanumerics and hyphens, 1-63 chars,
/// no leading or trailing hyphen.
pub fn validate_website_name(name: &str) -> Result<(), SpecError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(SpecError::NameLength(name.len()));
    }

    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(SpecError::NameCharacter(c));
    }

    if name.starts_with('-') || name.ends_with('-') {
        return Err(SpecError::NameEdge);
    }

    Ok(())
}

/// Validate the HTML size bound.
pub fn validate_html(html: &str) -> Result<(), SpecError> {
    if html.len() > MAX_HTML_BYTES {
        return Err(SpecError::HtmlTooLarge(html.len()));
    }
    Ok(())
}
