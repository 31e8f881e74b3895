use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::config::LauncherConfig;
use crate::error::{lock, read, write, Result};
use crate::jobs::job::{JobPtr, User};
use crate::jobs::notifier::{JobStatusNotifier, Subscription};
use crate::jobs::pruner::JobPruner;

/// Backend extension points of the job store.
///
/// Every method has a no-op default. Hooks are always called after the store
/// has released its map lock, so they may call back into the store.
pub trait JobStoreHooks: Send + Sync {
    /// Jobs persisted by a previous run, loaded once during
    /// [`JobStore::initialize`].
    fn load_jobs(&self) -> Result<Vec<JobPtr>> {
        Ok(Vec::new())
    }

    fn on_initialize(&self) -> Result<()> {
        Ok(())
    }

    fn on_job_added(&self, _job: &JobPtr) {}

    /// Called once a job has been erased, e.g. to delete its output files.
    fn on_job_removed(&self, _job: &JobPtr) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl JobStoreHooks for NoopHooks {}

// Kept alive for as long as the store is initialized.
struct StoreRuntime {
    _subscription: Subscription,
    pruner: Arc<JobPruner>,
}

/// Canonical set of jobs known to the launcher, ordered by job ID.
pub struct JobStore {
    jobs: RwLock<BTreeMap<String, JobPtr>>,
    hooks: Box<dyn JobStoreHooks>,
    runtime: Mutex<Option<StoreRuntime>>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore").field("jobs", &self.len()).finish()
    }
}

impl JobStore {
    pub fn new() -> Self {
        Self::with_hooks(NoopHooks)
    }

    pub fn with_hooks(hooks: impl JobStoreHooks + 'static) -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            hooks: Box::new(hooks),
            runtime: Mutex::new(None),
        }
    }

    /// Load persisted jobs and start following status updates.
    ///
    /// Any job that receives a status update through `notifier` and is not
    /// yet stored gets added. Completed jobs are pruned once they have not
    /// been updated for `config.job_expiry`; expired loaded jobs are pruned
    /// immediately.
    pub fn initialize(
        self: &Arc<Self>,
        notifier: &JobStatusNotifier,
        config: &LauncherConfig,
    ) -> Result<()> {
        self.hooks.on_initialize()?;

        let loaded = self.hooks.load_jobs()?;
        {
            let mut jobs = write(&self.jobs, "job store")?;
            for job in &loaded {
                jobs.entry(job.id().to_string())
                    .or_insert_with(|| Arc::clone(job));
            }
        }

        let store = Arc::downgrade(self);
        let subscription = notifier.subscribe_all(move |job| {
            if let Some(store) = store.upgrade() {
                store.add_job(Arc::clone(job));
            }
        })?;

        let pruner = JobPruner::start(self, notifier, config)?;
        let pruned = loaded
            .iter()
            .filter(|job| pruner.prune_job(job.id()))
            .count();

        *lock(&self.runtime, "job store runtime")? = Some(StoreRuntime {
            _subscription: subscription,
            pruner,
        });

        tracing::info!(
            loaded = loaded.len(),
            pruned,
            "Job store initialized"
        );
        Ok(())
    }

    /// The pruner started by [`initialize`](Self::initialize), if any.
    pub fn pruner(&self) -> Option<Arc<JobPruner>> {
        lock(&self.runtime, "job store runtime")
            .ok()?
            .as_ref()
            .map(|runtime| Arc::clone(&runtime.pruner))
    }

    /// Add a job. Returns false if a job with the same ID is already stored.
    pub fn add_job(&self, job: JobPtr) -> bool {
        let inserted = match write(&self.jobs, "job store") {
            Ok(mut jobs) => {
                if jobs.contains_key(job.id()) {
                    false
                } else {
                    jobs.insert(job.id().to_string(), Arc::clone(&job));
                    true
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job.id(), error = %e, "Failed to add job");
                return false;
            }
        };

        if inserted {
            tracing::debug!(job_id = %job.id(), user = %job.user(), "Job added");
            self.hooks.on_job_added(&job);
        }
        inserted
    }

    /// Look a job up by ID, visible only to its owner or to all users.
    pub fn get_job(&self, job_id: &str, user: &User) -> Option<JobPtr> {
        match read(&self.jobs, "job store") {
            Ok(jobs) => jobs
                .get(job_id)
                .filter(|job| user.can_access(job.user()))
                .cloned(),
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to look up job");
                None
            }
        }
    }

    /// Every job visible to `user`, in ascending job ID order.
    pub fn get_jobs(&self, user: &User) -> Vec<JobPtr> {
        match read(&self.jobs, "job store") {
            Ok(jobs) => jobs
                .values()
                .filter(|job| user.can_access(job.user()))
                .cloned()
                .collect(),
            Err(e) => {
                tracing::error!(user = %user, error = %e, "Failed to list jobs");
                Vec::new()
            }
        }
    }

    /// Remove a job, returning it if it was stored.
    pub fn remove_job(&self, job_id: &str) -> Option<JobPtr> {
        let removed = match write(&self.jobs, "job store") {
            Ok(mut jobs) => jobs.remove(job_id),
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to remove job");
                return None;
            }
        };

        if let Some(job) = &removed {
            tracing::debug!(job_id = %job_id, "Job removed");
            self.hooks.on_job_removed(job);
        }
        removed
    }

    pub fn len(&self) -> usize {
        read(&self.jobs, "job store")
            .map(|jobs| jobs.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
