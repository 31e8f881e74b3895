use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{lock, LauncherError, Result};

/// Username that stands for every user (administrative access).
pub const ALL_USERS: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum JobStatus {
    Pending,
    Running,
    Suspended,
    Canceled,
    Killed,
    Finished,
    Failed,
}

impl JobStatus {
    /// Terminal states: no transition out of them is accepted.
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            JobStatus::Canceled | JobStatus::Killed | JobStatus::Finished | JobStatus::Failed
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "Pending"),
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Suspended => write!(f, "Suspended"),
            JobStatus::Canceled => write!(f, "Canceled"),
            JobStatus::Killed => write!(f, "Killed"),
            JobStatus::Finished => write!(f, "Finished"),
            JobStatus::Failed => write!(f, "Failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = LauncherError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Pending" => Ok(JobStatus::Pending),
            "Running" => Ok(JobStatus::Running),
            "Suspended" => Ok(JobStatus::Suspended),
            "Canceled" => Ok(JobStatus::Canceled),
            "Killed" => Ok(JobStatus::Killed),
            "Finished" => Ok(JobStatus::Finished),
            "Failed" => Ok(JobStatus::Failed),
            other => Err(LauncherError::Internal(format!(
                "Invalid job status: {}",
                other
            ))),
        }
    }
}

/// The owner of a job, or the [`ALL_USERS`] wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct User {
    name: String,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn all_users() -> Self {
        Self::new(ALL_USERS)
    }

    pub fn is_all_users(&self) -> bool {
        self.name == ALL_USERS
    }

    pub fn username(&self) -> &str {
        &self.name
    }

    /// Whether a request made as `self` may see a job owned by `owner`.
    pub fn can_access(&self, owner: &User) -> bool {
        self.is_all_users() || self == owner
    }
}

impl std::fmt::Display for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Mutable fields of a job. Only reachable through [`Job::lock`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetails {
    pub name: String,
    pub host: String,
    pub status: JobStatus,
    pub status_message: String,
    pub submission_time: DateTime<Utc>,
    pub last_update_time: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub stdout_file: Option<String>,
    pub stderr_file: Option<String>,
}

impl JobDetails {
    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    /// The timestamp pruning counts from.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_update_time.unwrap_or(self.submission_time)
    }
}

/// One unit of work in the job scheduling system.
///
/// The store, status subscriptions and stream sessions all share the same
/// instance through [`JobPtr`]. `id` and `user` never change; everything else
/// lives behind the job's own lock.
#[derive(Debug)]
pub struct Job {
    id: String,
    user: User,
    details: Mutex<JobDetails>,
    // Held by the notifier across mutate-then-notify so updates for one job
    // never interleave. Subscribers may still take `details`.
    update_lock: Mutex<()>,
    updates: Mutex<UpdateQueue>,
}

/// A status change waiting to be applied to a job.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StatusUpdate {
    pub status: JobStatus,
    pub message: String,
    pub invocation_time: DateTime<Utc>,
}

// The thread holding `update_lock`, and the updates it issued from inside its
// own notify pass.
#[derive(Debug, Default)]
struct UpdateQueue {
    owner: Option<ThreadId>,
    deferred: VecDeque<StatusUpdate>,
}

/// Exclusive right to update a job, held for a whole notify pass.
pub(crate) struct UpdateGuard<'a> {
    job: &'a Job,
    _lock: MutexGuard<'a, ()>,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut queue) = self.job.updates.lock() {
            queue.owner = None;
            if !queue.deferred.is_empty() {
                tracing::warn!(
                    job_id = %self.job.id,
                    dropped = queue.deferred.len(),
                    "Discarding deferred status updates"
                );
                queue.deferred.clear();
            }
        }
    }
}

pub type JobPtr = Arc<Job>;

impl Job {
    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, JobDetails>> {
        lock(&self.details, "job")
    }

    /// A consistent copy of the mutable fields.
    pub fn snapshot(&self) -> Result<JobDetails> {
        Ok(self.lock()?.clone())
    }

    pub fn status(&self) -> Result<JobStatus> {
        Ok(self.lock()?.status)
    }

    pub fn is_completed(&self) -> Result<bool> {
        Ok(self.lock()?.is_completed())
    }

    /// Queue `update` if the calling thread is already inside this job's
    /// notify pass. Hands the update back otherwise.
    pub(crate) fn defer_nested(&self, update: StatusUpdate) -> Result<Option<StatusUpdate>> {
        let mut queue = lock(&self.updates, "job update queue")?;
        if queue.owner == Some(thread::current().id()) {
            queue.deferred.push_back(update);
            return Ok(None);
        }
        Ok(Some(update))
    }

    pub(crate) fn lock_updates(&self) -> Result<UpdateGuard<'_>> {
        let guard = UpdateGuard {
            job: self,
            _lock: lock(&self.update_lock, "job update")?,
        };
        lock(&self.updates, "job update queue")?.owner = Some(thread::current().id());
        Ok(guard)
    }

    /// The next update deferred by the current notify pass.
    pub(crate) fn next_deferred(&self) -> Result<Option<StatusUpdate>> {
        Ok(lock(&self.updates, "job update queue")?.deferred.pop_front())
    }
}

#[derive(Debug, Default)]
pub struct JobBuilder {
    id: Option<String>,
    user: Option<User>,
    name: String,
    host: String,
    status: Option<JobStatus>,
    status_message: String,
    submission_time: Option<DateTime<Utc>>,
    last_update_time: Option<DateTime<Utc>>,
    pid: Option<u32>,
    stdout_file: Option<String>,
    stderr_file: Option<String>,
}

impl JobBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn status_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = message.into();
        self
    }

    pub fn submission_time(mut self, time: DateTime<Utc>) -> Self {
        self.submission_time = Some(time);
        self
    }

    pub fn last_update_time(mut self, time: DateTime<Utc>) -> Self {
        self.last_update_time = Some(time);
        self
    }

    pub fn pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn stdout_file(mut self, path: impl Into<String>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    pub fn stderr_file(mut self, path: impl Into<String>) -> Self {
        self.stderr_file = Some(path.into());
        self
    }

    pub fn build(self) -> JobPtr {
        Arc::new(Job {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            user: self.user.unwrap_or_else(User::all_users),
            details: Mutex::new(JobDetails {
                name: self.name,
                host: self.host,
                status: self.status.unwrap_or(JobStatus::Pending),
                status_message: self.status_message,
                submission_time: self.submission_time.unwrap_or_else(Utc::now),
                last_update_time: self.last_update_time,
                pid: self.pid,
                exit_code: None,
                stdout_file: self.stdout_file,
                stderr_file: self.stderr_file,
            }),
            update_lock: Mutex::new(()),
            updates: Mutex::new(UpdateQueue::default()),
        })
    }
}
