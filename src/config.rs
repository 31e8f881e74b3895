use std::time::Duration;

const DEFAULT_JOB_EXPIRY_HOURS: u64 = 24;
const DEFAULT_RESOURCE_POLL_SECS: u64 = 5;
const DEFAULT_STATUS_POLL_SECS: u64 = 3;

/// Runtime settings for the launcher core.
///
/// Values normally come from the plugin's option loading; the core only
/// consumes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherConfig {
    /// How long a completed job stays in the store after its last update.
    pub job_expiry: Duration,
    /// How often timed resource streams sample utilization.
    pub resource_poll_interval: Duration,
    /// How often timed status watchers poll the job scheduling system.
    pub status_poll_interval: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            job_expiry: Duration::from_secs(DEFAULT_JOB_EXPIRY_HOURS * 60 * 60),
            resource_poll_interval: Duration::from_secs(DEFAULT_RESOURCE_POLL_SECS),
            status_poll_interval: Duration::from_secs(DEFAULT_STATUS_POLL_SECS),
        }
    }
}

impl LauncherConfig {
    pub fn job_expiry_hours(hours: u64) -> Self {
        Self::default().with_job_expiry(Duration::from_secs(hours * 60 * 60))
    }

    pub fn with_job_expiry(mut self, expiry: Duration) -> Self {
        self.job_expiry = expiry;
        self
    }

    pub fn with_resource_poll_interval(mut self, interval: Duration) -> Self {
        self.resource_poll_interval = interval;
        self
    }

    pub fn with_status_poll_interval(mut self, interval: Duration) -> Self {
        self.status_poll_interval = interval;
        self
    }

    /// Job expiry as a chrono duration, for arithmetic against job timestamps.
    pub fn job_expiry_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.job_expiry).unwrap_or(chrono::Duration::MAX)
    }
}
