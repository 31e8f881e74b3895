use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::LauncherConfig;
use crate::error::{lock, Result};
use crate::jobs::job::{JobPtr, User};
use crate::jobs::notifier::{JobStatusNotifier, Subscription};
use crate::jobs::store::JobStore;

/// Removes completed jobs from the store once they expire.
///
/// A job expires `job_expiry` after its last status update (or its
/// submission, if it was never updated). Each completed job gets one deadline
/// task on the tokio runtime.
pub struct JobPruner {
    store: Weak<JobStore>,
    expiry: chrono::Duration,
    timers: Mutex<HashMap<String, CancellationToken>>,
    subscription: Mutex<Option<Subscription>>,
}

impl JobPruner {
    /// Create a pruner for `store` and start watching for completed jobs.
    pub fn start(
        store: &Arc<JobStore>,
        notifier: &JobStatusNotifier,
        config: &LauncherConfig,
    ) -> Result<Arc<Self>> {
        let pruner = Arc::new(Self {
            store: Arc::downgrade(store),
            expiry: config.job_expiry_chrono(),
            timers: Mutex::new(HashMap::new()),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&pruner);
        let subscription = notifier.subscribe_all(move |job| {
            if let Some(pruner) = weak.upgrade() {
                pruner.on_job_update(job);
            }
        })?;
        *lock(&pruner.subscription, "pruner subscription")? = Some(subscription);

        Ok(pruner)
    }

    fn on_job_update(self: &Arc<Self>, job: &JobPtr) {
        match job.lock() {
            Ok(details) if details.is_completed() => {
                let expires_at = self.expires_at(details.last_activity());
                drop(details);
                self.schedule(job.id(), expires_at);
            }
            Ok(_) => {}
            Err(e) => tracing::error!(job_id = %job.id(), error = %e, "Failed to read job for pruning"),
        }
    }

    /// Prune the job now if it has expired. A completed job that has not yet
    /// expired gets its deadline re-armed. Returns whether the job was removed.
    pub fn prune_job(self: &Arc<Self>, job_id: &str) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let Some(job) = store.get_job(job_id, &User::all_users()) else {
            self.cancel_timer(job_id);
            return false;
        };

        let details = match job.snapshot() {
            Ok(details) => details,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to read job for pruning");
                return false;
            }
        };

        let expires_at = self.expires_at(details.last_activity());
        if expires_at.is_some_and(|at| at <= Utc::now()) {
            self.cancel_timer(job_id);
            if store.remove_job(job_id).is_some() {
                tracing::info!(job_id = %job_id, status = %details.status, "Pruned expired job");
                return true;
            }
            return false;
        }

        if details.is_completed() {
            self.schedule(job_id, expires_at);
        }
        false
    }

    /// Number of armed expiry deadlines.
    pub fn pending_timers(&self) -> usize {
        lock(&self.timers, "pruner timers")
            .map(|timers| timers.len())
            .unwrap_or(0)
    }

    // None when the expiry is too far out to represent: the job never expires.
    fn expires_at(&self, last_activity: DateTime<Utc>) -> Option<DateTime<Utc>> {
        last_activity.checked_add_signed(self.expiry)
    }

    fn schedule(self: &Arc<Self>, job_id: &str, expires_at: Option<DateTime<Utc>>) {
        let Some(expires_at) = expires_at else {
            return;
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!(job_id = %job_id, "No async runtime available, job will not be pruned automatically");
                return;
            }
        };

        let delay = (expires_at - Utc::now()).to_std().unwrap_or_default();
        let token = CancellationToken::new();
        match lock(&self.timers, "pruner timers") {
            Ok(mut timers) => {
                if let Some(previous) = timers.insert(job_id.to_string(), token.clone()) {
                    previous.cancel();
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to schedule job pruning");
                return;
            }
        }

        tracing::debug!(job_id = %job_id, expires_at = %expires_at, "Scheduled job pruning");

        let pruner = Arc::downgrade(self);
        let job_id = job_id.to_string();
        handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(pruner) = pruner.upgrade() {
                        pruner.expire(&job_id, &token);
                    }
                }
            }
        });
    }

    fn expire(self: &Arc<Self>, job_id: &str, token: &CancellationToken) {
        // Replaced and removed timers are cancelled under this lock, so a live
        // token is still the registered one.
        match lock(&self.timers, "pruner timers") {
            Ok(mut timers) => {
                if token.is_cancelled() {
                    return;
                }
                timers.remove(job_id);
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to expire job");
                return;
            }
        }
        self.prune_job(job_id);
    }

    fn cancel_timer(&self, job_id: &str) {
        if let Ok(mut timers) = lock(&self.timers, "pruner timers") {
            if let Some(token) = timers.remove(job_id) {
                token.cancel();
            }
        }
    }
}

impl Drop for JobPruner {
    fn drop(&mut self) {
        if let Ok(timers) = self.timers.get_mut() {
            for token in timers.values() {
                token.cancel();
            }
        }
    }
}
