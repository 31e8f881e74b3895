
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{DateTime, Utc};
use launcher_core::jobs::{Job, JobPtr, JobStatus, JobStatusNotifier, User, ALL_JOBS};
use test_harness::{at, base_time, test_job};

type Seen = Arc<Mutex<Vec<(String, JobStatus, String, Option<DateTime<Utc>>)>>>;

fn recorder(seen: &Seen) -> impl Fn(&JobPtr) + Send + Sync + 'static {
    let seen = Arc::clone(seen);
    move |job: &JobPtr| {
        let details = job.lock().unwrap();
        seen.lock().unwrap().push((
            job.id().to_string(),
            details.status,
            details.status_message.clone(),
            details.last_update_time,
        ));
    }
}

#[test]
fn test_subscribe_to_one_job() {
    let notifier = JobStatusNotifier::new();
    let job1 = test_job("1", "alice", JobStatus::Pending);
    let job2 = test_job("2", "alice", JobStatus::Pending);
    let seen: Seen = Arc::default();

    let _handle = notifier.subscribe("1", recorder(&seen)).unwrap();

    let ut = at(30);
    assert!(notifier.update_job_at(&job1, JobStatus::Running, "", ut));
    assert!(notifier.update_job_at(&job2, JobStatus::Running, "", ut));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0],
        ("1".to_string(), JobStatus::Running, String::new(), Some(ut))
    );
}

#[test]
fn test_older_update_is_rejected() {
    let notifier = JobStatusNotifier::new();
    let sd3 = base_time();
    let ld3 = at(60);
    let ut = at(120);
    let job3 = Job::builder()
        .id("3")
        .user(User::new("bob"))
        .status(JobStatus::Running)
        .submission_time(sd3)
        .last_update_time(ld3)
        .build();
    let seen: Seen = Arc::default();
    let _handle = notifier.subscribe("3", recorder(&seen)).unwrap();

    assert!(!notifier.update_job_at(&job3, JobStatus::Pending, "requeued", sd3));
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(job3.status().unwrap(), JobStatus::Running);
    assert_eq!(job3.snapshot().unwrap().last_update_time, Some(ld3));

    assert!(notifier.update_job_at(&job3, JobStatus::Finished, "done", ut));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0],
        ("3".to_string(), JobStatus::Finished, "done".to_string(), Some(ut))
    );
}

#[test]
fn test_update_at_same_time_is_applied() {
    let notifier = JobStatusNotifier::new();
    let job = test_job("1", "alice", JobStatus::Pending);
    let seen: Seen = Arc::default();
    let _handle = notifier.subscribe("1", recorder(&seen)).unwrap();

    let t = at(5);
    assert!(notifier.update_job_at(&job, JobStatus::Running, "", t));
    assert!(notifier.update_job_at(&job, JobStatus::Running, "", t));
    assert!(notifier.update_job_at(&job, JobStatus::Suspended, "paused", t));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[2].1, JobStatus::Suspended);
    assert_eq!(seen[2].2, "paused");
}

#[test]
fn test_subscribe_all_jobs() {
    let notifier = JobStatusNotifier::new();
    let jobs: Vec<JobPtr> = ["1", "2", "3", "4"]
        .iter()
        .map(|id| test_job(id, "carol", JobStatus::Running))
        .collect();
    let seen: Seen = Arc::default();
    let _handle = notifier.subscribe_all(recorder(&seen)).unwrap();

    let ut1 = at(10);
    notifier.update_job_at(&jobs[1], JobStatus::Canceled, "", ut1);
    notifier.update_job_at(&jobs[2], JobStatus::Finished, "", ut1);
    notifier.update_job_at(&jobs[3], JobStatus::Pending, "", ut1);
    notifier.update_job_at(&jobs[0], JobStatus::Running, "", ut1);

    let seen = seen.lock().unwrap();
    let observed: Vec<(String, JobStatus)> = seen
        .iter()
        .map(|(id, status, _, time)| {
            assert_eq!(*time, Some(ut1));
            (id.clone(), *status)
        })
        .collect();
    assert_eq!(
        observed,
        vec![
            ("2".to_string(), JobStatus::Canceled),
            ("3".to_string(), JobStatus::Finished),
            ("4".to_string(), JobStatus::Pending),
            ("1".to_string(), JobStatus::Running),
        ]
    );
}

#[test]
fn test_empty_and_wildcard_ids_subscribe_to_all() {
    let notifier = JobStatusNotifier::new();
    let job = test_job("7", "dave", JobStatus::Pending);
    let seen: Seen = Arc::default();

    let _empty = notifier.subscribe("", recorder(&seen)).unwrap();
    let _star = notifier.subscribe(ALL_JOBS, recorder(&seen)).unwrap();
    assert_eq!(notifier.all_jobs_subscriber_count(), 2);
    assert!(!notifier.has_channel(""));
    assert!(!notifier.has_channel(ALL_JOBS));

    notifier.update_job(&job, JobStatus::Running, "");
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn test_per_job_subscribers_run_before_wildcard() {
    let notifier = JobStatusNotifier::new();
    let job = test_job("1", "alice", JobStatus::Pending);
    let order = Arc::new(Mutex::new(Vec::new()));

    let all_order = Arc::clone(&order);
    let _all = notifier
        .subscribe_all(move |_| all_order.lock().unwrap().push("all"))
        .unwrap();
    let one_order = Arc::clone(&order);
    let _one = notifier
        .subscribe("1", move |_| one_order.lock().unwrap().push("one"))
        .unwrap();

    notifier.update_job(&job, JobStatus::Running, "");
    assert_eq!(*order.lock().unwrap(), vec!["one", "all"]);
}

#[test]
fn test_dropping_handle_unsubscribes() {
    let notifier = JobStatusNotifier::new();
    let job = test_job("1", "alice", JobStatus::Pending);
    let seen: Seen = Arc::default();

    let first = notifier.subscribe("1", recorder(&seen)).unwrap();
    let second = notifier.subscribe("1", recorder(&seen)).unwrap();
    assert_eq!(notifier.subscriber_count("1"), 2);

    drop(first);
    assert_eq!(notifier.subscriber_count("1"), 1);
    notifier.update_job_at(&job, JobStatus::Running, "", at(1));
    assert_eq!(seen.lock().unwrap().len(), 1);

    drop(second);
    assert!(!notifier.has_channel("1"));
    notifier.update_job_at(&job, JobStatus::Suspended, "", at(2));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn test_handle_outliving_notifier_is_harmless() {
    let notifier = JobStatusNotifier::new();
    let handle = notifier.subscribe("1", |_| {}).unwrap();
    drop(notifier);
    drop(handle);
}

#[test]
fn test_completed_job_rejects_further_updates() {
    let notifier = JobStatusNotifier::new();
    let job = test_job("1", "alice", JobStatus::Running);
    let seen: Seen = Arc::default();
    let _handle = notifier.subscribe("1", recorder(&seen)).unwrap();

    assert!(notifier.update_job_at(&job, JobStatus::Finished, "exit 0", at(10)));
    assert!(!notifier.update_job_at(&job, JobStatus::Running, "", at(20)));
    assert!(!notifier.update_job_at(&job, JobStatus::Failed, "", at(30)));

    assert!(job.is_completed().unwrap());
    assert_eq!(job.status().unwrap(), JobStatus::Finished);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn test_callback_may_subscribe_and_read_job() {
    let notifier = Arc::new(JobStatusNotifier::new());
    let job = test_job("1", "alice", JobStatus::Pending);
    let late_handles = Arc::new(Mutex::new(Vec::new()));

    let inner_notifier = Arc::clone(&notifier);
    let handles = Arc::clone(&late_handles);
    let _handle = notifier
        .subscribe("1", move |job| {
            assert_eq!(job.status().unwrap(), JobStatus::Running);
            let handle = inner_notifier.subscribe(job.id(), |_| {}).unwrap();
            handles.lock().unwrap().push(handle);
        })
        .unwrap();

    notifier.update_job(&job, JobStatus::Running, "");
    assert_eq!(notifier.subscriber_count("1"), 2);
}

#[test]
fn test_updates_for_one_job_are_observed_in_order() {
    let notifier = Arc::new(JobStatusNotifier::new());
    let job = test_job("1", "alice", JobStatus::Pending);
    let seen: Seen = Arc::default();
    let _handle = notifier.subscribe("1", recorder(&seen)).unwrap();

    let t1 = at(1);
    let t2 = at(2);
    let first = {
        let notifier = Arc::clone(&notifier);
        let job = JobPtr::clone(&job);
        thread::spawn(move || notifier.update_job_at(&job, JobStatus::Running, "", t1))
    };
    first.join().unwrap();
    let second = {
        let notifier = Arc::clone(&notifier);
        let job = JobPtr::clone(&job);
        thread::spawn(move || notifier.update_job_at(&job, JobStatus::Finished, "", t2))
    };
    second.join().unwrap();

    let statuses: Vec<JobStatus> = seen.lock().unwrap().iter().map(|s| s.1).collect();
    assert_eq!(statuses, vec![JobStatus::Running, JobStatus::Finished]);
}

#[test]
fn test_concurrent_updates_never_interleave() {
    let notifier = Arc::new(JobStatusNotifier::new());
    let job = test_job("1", "alice", JobStatus::Running);
    let in_callback = Arc::new(Mutex::new(0usize));
    let max_seen = Arc::new(Mutex::new(0usize));

    let depth = Arc::clone(&in_callback);
    let max = Arc::clone(&max_seen);
    let _handle = notifier
        .subscribe("1", move |_| {
            {
                let mut depth = depth.lock().unwrap();
                *depth += 1;
                let mut max = max.lock().unwrap();
                *max = (*max).max(*depth);
            }
            thread::sleep(std::time::Duration::from_millis(2));
            *depth.lock().unwrap() -= 1;
        })
        .unwrap();

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let notifier = Arc::clone(&notifier);
            let job = JobPtr::clone(&job);
            thread::spawn(move || {
                let status = if i % 2 == 0 {
                    JobStatus::Running
                } else {
                    JobStatus::Suspended
                };
                notifier.update_job(&job, status, format!("update {}", i));
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(*max_seen.lock().unwrap(), 1);
}

#[test]
fn test_subscriber_may_update_the_job_it_watches() {
    let notifier = Arc::new(JobStatusNotifier::new());
    let job = test_job("1", "alice", JobStatus::Pending);
    let other = test_job("2", "alice", JobStatus::Running);
    let seen: Seen = Arc::default();

    // A backend that fails jobs reported running without a process.
    let backend = Arc::downgrade(&notifier);
    let side_job = JobPtr::clone(&other);
    let _backend = notifier
        .subscribe("1", move |job| {
            let missing_pid = job
                .lock()
                .map(|details| details.status == JobStatus::Running && details.pid.is_none())
                .unwrap();
            if let (true, Some(notifier)) = (missing_pid, backend.upgrade()) {
                assert!(notifier.update_job(job, JobStatus::Failed, "no pid"));
                assert!(notifier.update_job(&side_job, JobStatus::Killed, ""));
            }
        })
        .unwrap();
    let _late = notifier.subscribe("1", recorder(&seen)).unwrap();
    let _all = notifier.subscribe_all(recorder(&seen)).unwrap();

    assert!(notifier.update_job(&job, JobStatus::Running, ""));

    assert_eq!(job.status().unwrap(), JobStatus::Failed);
    assert_eq!(job.snapshot().unwrap().status_message, "no pid");
    // Another job is updated right away, from inside the callback.
    assert_eq!(other.status().unwrap(), JobStatus::Killed);

    let observed: Vec<(String, JobStatus)> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|s| (s.0.clone(), s.1))
        .collect();
    assert_eq!(
        observed,
        vec![
            ("2".to_string(), JobStatus::Killed),
            ("1".to_string(), JobStatus::Running),
            ("1".to_string(), JobStatus::Running),
            ("1".to_string(), JobStatus::Failed),
            ("1".to_string(), JobStatus::Failed),
        ]
    );
}
