//! Job tracking: the shared job entity, the job store, status notification,
//! pruning of expired jobs and status watchers.

pub mod job;
pub mod notifier;
pub mod pruner;
pub mod store;
pub mod watcher;

pub use job::{Job, JobBuilder, JobDetails, JobPtr, JobStatus, User, ALL_USERS};
pub use notifier::{JobStatusNotifier, OnJobStatusUpdate, Subscription, ALL_JOBS};
pub use pruner::JobPruner;
pub use store::{JobStore, JobStoreHooks, NoopHooks};
pub use watcher::{JobDetailsSource, JobStatusPoller, JobStatusWatcher, TimedJobStatusWatcher};
