
use std::sync::Arc;
use std::time::Duration;

use launcher_core::config::LauncherConfig;
use launcher_core::jobs::{JobPruner, JobStatus, JobStatusNotifier, JobStore, User};
use test_harness::{fresh_job, test_job};

// Expiry deadlines are computed from the wall clock, so these tests run in
// real time rather than on a paused runtime.
fn short_expiry() -> LauncherConfig {
    LauncherConfig::default().with_job_expiry(Duration::from_millis(100))
}

#[tokio::test]
async fn test_completed_job_is_pruned_after_expiry() {
    let store = Arc::new(JobStore::new());
    let notifier = JobStatusNotifier::new();
    store.initialize(&notifier, &short_expiry()).unwrap();

    let job = fresh_job("1", "alice", JobStatus::Running);
    store.add_job(Arc::clone(&job));
    notifier.update_job(&job, JobStatus::Finished, "exit 0");

    let pruner = store.pruner().unwrap();
    assert_eq!(pruner.pending_timers(), 1);
    assert!(store.get_job("1", &User::all_users()).is_some());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store.get_job("1", &User::all_users()).is_none());
    assert_eq!(pruner.pending_timers(), 0);
}

#[tokio::test]
async fn test_running_job_is_not_scheduled() {
    let store = Arc::new(JobStore::new());
    let notifier = JobStatusNotifier::new();
    store.initialize(&notifier, &short_expiry()).unwrap();

    let job = fresh_job("1", "alice", JobStatus::Pending);
    store.add_job(Arc::clone(&job));
    notifier.update_job(&job, JobStatus::Running, "");

    assert_eq!(store.pruner().unwrap().pending_timers(), 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.get_job("1", &User::all_users()).is_some());
}

#[tokio::test]
async fn test_prune_job_rearms_unexpired_completed_job() {
    let store = Arc::new(JobStore::new());
    let notifier = JobStatusNotifier::new();
    let config = LauncherConfig::default();
    let pruner = JobPruner::start(&store, &notifier, &config).unwrap();

    let job = fresh_job("1", "alice", JobStatus::Finished);
    store.add_job(job);

    assert!(!pruner.prune_job("1"));
    assert_eq!(pruner.pending_timers(), 1);
    assert!(store.get_job("1", &User::all_users()).is_some());
}

#[test]
fn test_prune_job_removes_expired_job_without_runtime() {
    let store = Arc::new(JobStore::new());
    let notifier = JobStatusNotifier::new();
    let pruner = JobPruner::start(&store, &notifier, &LauncherConfig::default()).unwrap();

    // Submitted long before the 24 hour expiry.
    store.add_job(test_job("1", "alice", JobStatus::Failed));

    assert!(pruner.prune_job("1"));
    assert!(store.is_empty());
    assert!(!pruner.prune_job("1"));
}

#[test]
fn test_completion_without_runtime_is_not_scheduled() {
    let store = Arc::new(JobStore::new());
    let notifier = JobStatusNotifier::new();
    let pruner = JobPruner::start(&store, &notifier, &short_expiry()).unwrap();

    let job = fresh_job("1", "alice", JobStatus::Running);
    store.add_job(Arc::clone(&job));
    notifier.update_job(&job, JobStatus::Killed, "");

    assert_eq!(pruner.pending_timers(), 0);
    assert!(store.get_job("1", &User::all_users()).is_some());
}

#[tokio::test]
async fn test_dropping_pruner_cancels_deadlines() {
    let store = Arc::new(JobStore::new());
    let notifier = JobStatusNotifier::new();
    let pruner = JobPruner::start(&store, &notifier, &short_expiry()).unwrap();

    let job = fresh_job("1", "alice", JobStatus::Running);
    store.add_job(Arc::clone(&job));
    notifier.update_job(&job, JobStatus::Canceled, "");
    assert_eq!(pruner.pending_timers(), 1);

    drop(pruner);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(store.get_job("1", &User::all_users()).is_some());
}
