//! CloudSelf backend API client.
//!
//! The backend is the system of record for websites. The provisioner:
//! - Fetches records still marked `pending`
//! - Pushes status transitions for one record at a time
//!
//! Each call is exactly one HTTP request bounded by a fixed timeout. Retry
//! policy belongs to the caller.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::crd::Phase;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Backend call failures.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Network failure or timeout.
    #[error("backend transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body was malformed or reported failure.
    #[error("backend protocol error: {0}")]
    Protocol(String),

    /// Backend answered with a non-200 status.
    #[error("backend returned status {code}: {body}")]
    Status { code: u16, body: String },
}

/// Website record as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendRecord {
    pub id: i64,
    pub user_id: String,
    pub website_name: String,
    pub html_content: String,
    pub status: Phase,
    #[serde(default)]
    pub pod_ip_address: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Response wrapper for the pending list.
#[derive(Debug, Deserialize)]
struct PendingResponse {
    success: bool,
    #[serde(default)]
    data: Vec<BackendRecord>,
    #[serde(default)]
    count: Option<usize>,
}

/// Body of a status push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn provisioned(endpoint: impl Into<String>) -> Self {
        Self {
            status: Phase::Provisioned,
            pod_ip_address: Some(endpoint.into()),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Phase::Failed,
            pod_ip_address: None,
            error_message: Some(message.into()),
        }
    }
}

/// Operations the provisioner needs from the backend.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Fetch every record currently marked pending.
    async fn fetch_pending(&self) -> Result<Vec<BackendRecord>, BackendError>;

    /// Push a status update for one record.
    async fn push_status(&self, record_id: i64, update: &StatusUpdate)
        -> Result<(), BackendError>;
}

/// HTTP client for the backend's provisioner API.
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    /// Create a client for `base_url` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status == StatusCode::OK {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, "Backend request failed");
        Err(BackendError::Status {
            code: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl BackendApi for BackendClient {
    async fn fetch_pending(&self) -> Result<Vec<BackendRecord>, BackendError> {
        let url = format!("{}/api/provisioner/websites/pending", self.base_url);
        debug!(url = %url, "Fetching pending websites");

        let response = self.client.get(&url).send().await?;
        let response = Self::error_for_status(response).await?;
        let body = response.bytes().await?;

        let parsed: PendingResponse = serde_json::from_slice(&body)
            .map_err(|e| BackendError::Protocol(format!("failed to decode response: {e}")))?;

        if !parsed.success {
            return Err(BackendError::Protocol(
                "backend reported success=false".to_string(),
            ));
        }

        debug!(
            count = parsed.count.unwrap_or(parsed.data.len()),
            "Fetched pending websites"
        );

        Ok(parsed.data)
    }

    async fn push_status(
        &self,
        record_id: i64,
        update: &StatusUpdate,
    ) -> Result<(), BackendError> {
        let url = format!(
            "{}/api/provisioner/websites/{}/status",
            self.base_url, record_id
        );
        debug!(
            record_id,
            status = %update.status,
            "Pushing website status"
        );

        let response = self.client.put(&url).json(update).send().await?;
        Self::error_for_status(response).await?;

        Ok(())
    }
}

/// In-memory backend for tests and local development.
///
/// Serves a fixed pending list and records every pushed update.
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockBackendState>,
}

#[derive(Default)]
struct MockBackendState {
    pending: Vec<BackendRecord>,
    pushes: Vec<(i64, StatusUpdate)>,
    fetch_count: usize,
    fail_fetch: Option<String>,
    fail_push: Option<String>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend serving `records` as pending.
    pub fn with_pending(records: Vec<BackendRecord>) -> Self {
        let backend = Self::new();
        backend.set_pending(records);
        backend
    }

    pub fn set_pending(&self, records: Vec<BackendRecord>) {
        self.lock().pending = records;
    }

    /// Make subsequent fetches fail with a 503 carrying `body`.
    pub fn fail_fetch(&self, body: impl Into<String>) {
        self.lock().fail_fetch = Some(body.into());
    }

    /// Make subsequent pushes fail with a 503 carrying `body`.
    pub fn fail_push(&self, body: impl Into<String>) {
        self.lock().fail_push = Some(body.into());
    }

    pub fn fetch_count(&self) -> usize {
        self.lock().fetch_count
    }

    /// Every update pushed so far, in order.
    pub fn pushes(&self) -> Vec<(i64, StatusUpdate)> {
        self.lock().pushes.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockBackendState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BackendApi for MockBackend {
    async fn fetch_pending(&self) -> Result<Vec<BackendRecord>, BackendError> {
        let mut state = self.lock();
        state.fetch_count += 1;
        if let Some(body) = &state.fail_fetch {
            return Err(BackendError::Status {
                code: 503,
                body: body.clone(),
            });
        }
        Ok(state.pending.clone())
    }

    async fn push_status(
        &self,
        record_id: i64,
        update: &StatusUpdate,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        // Failed pushes still count as attempted calls
        state.pushes.push((record_id, update.clone()));
        if let Some(body) = &state.fail_push {
            return Err(BackendError::Status {
                code: 503,
                body: body.clone(),
            });
        }
        Ok(())
    }
}
