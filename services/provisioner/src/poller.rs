//! Backend ingestion poller.
//!
//! Turns backend records marked `pending` into `Website` objects. The poller
//! is ticked frequently by its caller but only does real work once per poll
//! interval, which bounds backend traffic regardless of how often ticks fire.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cloudself_reconcile::{FailureStreak, PollGate};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendApi, BackendError, BackendRecord, StatusUpdate};
use crate::crd::{Website, WebsiteSpec};
use crate::platform::Platform;

/// Counts from one real poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Records returned by the backend.
    pub fetched: usize,

    /// Websites created.
    pub created: usize,

    /// Records skipped because a Website already exists or could not be checked.
    pub skipped: usize,

    /// Records reported back to the backend as failed.
    pub failed: usize,
}

/// Creates Websites for pending backend records.
pub struct IngestionPoller {
    platform: Arc<dyn Platform>,
    backend: Arc<dyn BackendApi>,
    namespace: String,
    gate: PollGate,
}

impl IngestionPoller {
    pub fn new(
        platform: Arc<dyn Platform>,
        backend: Arc<dyn BackendApi>,
        namespace: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            platform,
            backend,
            namespace: namespace.into(),
            gate: PollGate::new(interval),
        }
    }

    /// Poll the backend if the interval has elapsed at `now`.
    ///
    /// Returns `Ok(None)` when gated out. A fetch failure is returned as an
    /// error; failures for individual records are isolated and counted.
    pub async fn tick(&mut self, now: Instant) -> Result<Option<PollReport>, BackendError> {
        if !self.gate.try_acquire(now) {
            return Ok(None);
        }

        info!("Polling backend for pending websites");
        let records = self.backend.fetch_pending().await?;
        info!(count = records.len(), "Found pending websites");

        let mut report = PollReport {
            fetched: records.len(),
            ..PollReport::default()
        };

        for record in records {
            match self.ingest(&record).await {
                Ingest::Created => report.created += 1,
                Ingest::Skipped => report.skipped += 1,
                Ingest::Failed => report.failed += 1,
            }
        }

        Ok(Some(report))
    }

    async fn ingest(&self, record: &BackendRecord) -> Ingest {
        let spec = WebsiteSpec {
            website_name: record.website_name.clone(),
            html_content: record.html_content.clone(),
            user_id: record.user_id.clone(),
            backend_id: record.id,
        };

        if let Err(e) = spec.validate() {
            warn!(backend_id = record.id, name = %record.website_name, error = %e, "Rejecting invalid website record");
            self.report_failure(record.id, format!("Invalid website record: {e}"))
                .await;
            return Ingest::Failed;
        }

        match self
            .platform
            .get_website(&self.namespace, &record.website_name)
            .await
        {
            Ok(Some(_)) => {
                debug!(name = %record.website_name, "Website CR already exists");
                return Ingest::Skipped;
            }
            Ok(None) => {}
            Err(e) => {
                // Creating blind could race with an object we failed to see
                error!(name = %record.website_name, error = %e, "Failed to check if Website CR exists");
                return Ingest::Skipped;
            }
        }

        let mut website = Website::new(&record.website_name, spec);
        website.metadata.namespace = Some(self.namespace.clone());

        // Status is left unset; the engine owns every status transition
        info!(name = %record.website_name, backend_id = record.id, "Creating Website CR");
        if let Err(e) = self.platform.create_website(&website).await {
            error!(name = %record.website_name, error = %e, "Failed to create Website CR");
            self.report_failure(record.id, format!("Failed to create CR: {e}"))
                .await;
            return Ingest::Failed;
        }

        Ingest::Created
    }

    async fn report_failure(&self, backend_id: i64, message: String) {
        let update = StatusUpdate::failed(message);
        if let Err(e) = self.backend.push_status(backend_id, &update).await {
            error!(backend_id, error = %e, "Failed to update backend status");
        }
    }
}

enum Ingest {
    Created,
    Skipped,
    Failed,
}

/// Tick the poller every `cadence` until shutdown.
pub async fn run_poll_loop(
    mut poller: IngestionPoller,
    cadence: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        cadence_secs = cadence.as_secs(),
        poll_interval_secs = poller.gate.interval().as_secs(),
        "Starting ingestion poller"
    );

    let mut streak = FailureStreak::default();
    let mut ticker = tokio::time::interval(cadence);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match poller.tick(Instant::now()).await {
                    Ok(Some(report)) => {
                        streak.reset();
                        debug!(
                            fetched = report.fetched,
                            created = report.created,
                            skipped = report.skipped,
                            failed = report.failed,
                            "Poll complete"
                        );
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let consecutive_failures = streak.record_failure();
                        if streak.is_escalated() {
                            error!(error = %e, consecutive_failures, "Backend poll failed repeatedly");
                        } else {
                            warn!(error = %e, consecutive_failures, "Failed to get pending websites from backend");
                        }
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Ingestion poller shutting down");
                    break;
                }
            }
        }
    }
}
