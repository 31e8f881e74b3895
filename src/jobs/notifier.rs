use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};

use crate::error::{lock, Result};
use crate::jobs::job::{JobPtr, JobStatus, StatusUpdate};

/// Job ID that subscribes to every job.
pub const ALL_JOBS: &str = "*";

/// Callback invoked with the updated job.
pub type OnJobStatusUpdate = Arc<dyn Fn(&JobPtr) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    all_jobs: BTreeMap<u64, OnJobStatusUpdate>,
    per_job: HashMap<String, BTreeMap<u64, OnJobStatusUpdate>>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Pub/sub hub for job status changes.
///
/// Subscribers run synchronously on the thread that called
/// [`update_job`](Self::update_job), before it returns. The registry lock is
/// released before any callback runs, so callbacks may subscribe or drop
/// handles freely.
#[derive(Default)]
pub struct JobStatusNotifier {
    registry: Arc<Mutex<Registry>>,
}

/// Keeps a status subscription alive. Dropping it unregisters the callback.
#[must_use = "dropping the subscription unregisters the callback"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    job_id: Option<String>,
    id: u64,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("job_id", &self.job_id)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let Ok(mut registry) = registry.lock() else {
            tracing::error!(subscription = self.id, "Status registry poisoned, cannot unsubscribe");
            return;
        };

        match &self.job_id {
            None => {
                registry.all_jobs.remove(&self.id);
            }
            Some(job_id) => {
                if let Some(callbacks) = registry.per_job.get_mut(job_id) {
                    callbacks.remove(&self.id);
                    if callbacks.is_empty() {
                        registry.per_job.remove(job_id);
                    }
                }
            }
        }
    }
}

impl JobStatusNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to updates of every job.
    pub fn subscribe_all(
        &self,
        on_update: impl Fn(&JobPtr) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let mut registry = lock(&self.registry, "status registry")?;
        let id = registry.next_id();
        registry.all_jobs.insert(id, Arc::new(on_update));
        Ok(Subscription {
            registry: Arc::downgrade(&self.registry),
            job_id: None,
            id,
        })
    }

    /// Subscribe to updates of a single job. An empty ID or `"*"` subscribes
    /// to every job.
    pub fn subscribe(
        &self,
        job_id: &str,
        on_update: impl Fn(&JobPtr) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        if job_id.is_empty() || job_id == ALL_JOBS {
            return self.subscribe_all(on_update);
        }

        let mut registry = lock(&self.registry, "status registry")?;
        let id = registry.next_id();
        registry
            .per_job
            .entry(job_id.to_string())
            .or_default()
            .insert(id, Arc::new(on_update));
        Ok(Subscription {
            registry: Arc::downgrade(&self.registry),
            job_id: Some(job_id.to_string()),
            id,
        })
    }

    /// Update a job's status at the current time. See [`update_job_at`](Self::update_job_at).
    pub fn update_job(&self, job: &JobPtr, status: JobStatus, message: impl Into<String>) -> bool {
        self.update_job_at(job, status, message, Utc::now())
    }

    /// Apply a status change and notify subscribers.
    ///
    /// Updates older than the job's last update time, and updates to a job
    /// that already reached a terminal state, are dropped. Returns whether the
    /// update was applied. Failures are logged, never propagated.
    ///
    /// A subscriber may update the job it is being notified about. That update
    /// is queued and applied once every subscriber has seen the current one,
    /// and is reported as applied.
    pub fn update_job_at(
        &self,
        job: &JobPtr,
        status: JobStatus,
        message: impl Into<String>,
        invocation_time: DateTime<Utc>,
    ) -> bool {
        match self.try_update_job(job, status, message.into(), invocation_time) {
            Ok(applied) => applied,
            Err(e) => {
                tracing::error!(job_id = %job.id(), error = %e, "Job status update abandoned");
                false
            }
        }
    }

    fn try_update_job(
        &self,
        job: &JobPtr,
        status: JobStatus,
        message: String,
        invocation_time: DateTime<Utc>,
    ) -> Result<bool> {
        let update = StatusUpdate {
            status,
            message,
            invocation_time,
        };
        let Some(update) = job.defer_nested(update)? else {
            tracing::debug!(job_id = %job.id(), requested = %status, "Deferred nested status update");
            return Ok(true);
        };

        let _serialized = job.lock_updates()?;
        let applied = self.apply_and_notify(job, update)?;
        while let Some(deferred) = job.next_deferred()? {
            self.apply_and_notify(job, deferred)?;
        }
        Ok(applied)
    }

    fn apply_and_notify(&self, job: &JobPtr, update: StatusUpdate) -> Result<bool> {
        let status = update.status;
        {
            let mut details = job.lock()?;
            if details.is_completed() {
                tracing::warn!(
                    job_id = %job.id(),
                    current = %details.status,
                    requested = %status,
                    "Ignoring status update for completed job"
                );
                return Ok(false);
            }
            if details
                .last_update_time
                .is_some_and(|last| update.invocation_time < last)
            {
                tracing::debug!(
                    job_id = %job.id(),
                    requested = %status,
                    "Ignoring stale status update"
                );
                return Ok(false);
            }

            details.status = status;
            details.status_message = update.message;
            details.last_update_time = Some(update.invocation_time);
        }

        tracing::debug!(job_id = %job.id(), status = %status, "Job status updated");

        let (job_callbacks, all_callbacks) = {
            let registry = lock(&self.registry, "status registry")?;
            let job_callbacks: Vec<OnJobStatusUpdate> = registry
                .per_job
                .get(job.id())
                .map(|callbacks| callbacks.values().cloned().collect())
                .unwrap_or_default();
            let all_callbacks: Vec<OnJobStatusUpdate> =
                registry.all_jobs.values().cloned().collect();
            (job_callbacks, all_callbacks)
        };

        for callback in job_callbacks.iter().chain(all_callbacks.iter()) {
            callback(job);
        }

        Ok(true)
    }

    /// Number of live per-job subscriptions for `job_id`.
    pub fn subscriber_count(&self, job_id: &str) -> usize {
        lock(&self.registry, "status registry")
            .map(|registry| registry.per_job.get(job_id).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    /// Whether a per-job channel currently exists for `job_id`.
    pub fn has_channel(&self, job_id: &str) -> bool {
        lock(&self.registry, "status registry")
            .map(|registry| registry.per_job.contains_key(job_id))
            .unwrap_or(false)
    }

    pub fn all_jobs_subscriber_count(&self) -> usize {
        lock(&self.registry, "status registry")
            .map(|registry| registry.all_jobs.len())
            .unwrap_or(0)
    }
}
