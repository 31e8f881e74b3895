use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{lock, LauncherError, Result};
use crate::jobs::job::{JobPtr, JobStatus, User};
use crate::jobs::notifier::JobStatusNotifier;
use crate::jobs::store::JobStore;

/// Fetches full job details from the job scheduling system, for jobs the
/// store has not seen yet.
pub trait JobDetailsSource: Send + Sync {
    fn get_job_details(&self, job_id: &str) -> Result<JobPtr>;
}

/// Routes status changes reported by the job scheduling system into the
/// notifier.
pub struct JobStatusWatcher {
    store: Arc<JobStore>,
    notifier: Arc<JobStatusNotifier>,
    details: Arc<dyn JobDetailsSource>,
}

impl JobStatusWatcher {
    pub fn new(
        store: Arc<JobStore>,
        notifier: Arc<JobStatusNotifier>,
        details: Arc<dyn JobDetailsSource>,
    ) -> Self {
        Self {
            store,
            notifier,
            details,
        }
    }

    /// Report a new status for `job_id`. Unknown jobs are fetched from the
    /// [`JobDetailsSource`] first. Returns whether the update was applied.
    pub fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        message: impl Into<String>,
        invocation_time: DateTime<Utc>,
    ) -> Result<bool> {
        let job = match self.store.get_job(job_id, &User::all_users()) {
            Some(job) => job,
            None => self.details.get_job_details(job_id)?,
        };

        Ok(self
            .notifier
            .update_job_at(&job, status, message, invocation_time))
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }
}

/// Polls the job scheduling system for status changes.
pub trait JobStatusPoller: Send + Sync + 'static {
    /// Query the job scheduling system and report changes through
    /// [`JobStatusWatcher::update_job_status`].
    fn poll_job_status(&self, watcher: &JobStatusWatcher) -> Result<()>;
}

/// A [`JobStatusWatcher`] driven by a fixed-interval poll.
pub struct TimedJobStatusWatcher<P: JobStatusPoller> {
    watcher: Arc<JobStatusWatcher>,
    poller: Arc<P>,
    interval: Duration,
    cancel: Mutex<Option<CancellationToken>>,
}

impl<P: JobStatusPoller> TimedJobStatusWatcher<P> {
    pub fn new(watcher: Arc<JobStatusWatcher>, poller: P, interval: Duration) -> Self {
        Self {
            watcher,
            poller: Arc::new(poller),
            interval,
            cancel: Mutex::new(None),
        }
    }

    /// Poll once now, then every interval until [`stop`](Self::stop).
    ///
    /// An error from the first poll is returned and no timer is started.
    /// Later poll errors are logged and polling continues.
    pub fn start(&self) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| LauncherError::Runtime(e.to_string()))?;

        self.poller.poll_job_status(&self.watcher)?;

        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.cancel, "status watcher")?.replace(token.clone()) {
            previous.cancel();
        }

        let watcher = Arc::clone(&self.watcher);
        let poller = Arc::clone(&self.poller);
        let period = self.interval;
        handle.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = poller.poll_job_status(&watcher) {
                            tracing::error!(error = %e, "Job status poll failed");
                        }
                    }
                }
            }
            tracing::debug!("Job status watcher stopped");
        });

        tracing::info!(interval_ms = period.as_millis() as u64, "Job status watcher started");
        Ok(())
    }

    pub fn stop(&self) {
        match lock(&self.cancel, "status watcher") {
            Ok(mut cancel) => {
                if let Some(token) = cancel.take() {
                    token.cancel();
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to stop job status watcher"),
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.cancel, "status watcher")
            .map(|cancel| cancel.is_some())
            .unwrap_or(false)
    }

    pub fn watcher(&self) -> &Arc<JobStatusWatcher> {
        &self.watcher
    }
}

impl<P: JobStatusPoller> Drop for TimedJobStatusWatcher<P> {
    fn drop(&mut self) {
        self.stop();
    }
}
