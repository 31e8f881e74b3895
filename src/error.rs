use thiserror::Error;

use crate::stream::response::ErrorKind;

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Job {job_id} could not be found{}.", user_suffix(.user))]
    JobNotFound {
        job_id: String,
        user: Option<String>,
    },

    #[error("Job {0} is not running")]
    JobNotRunning(String),

    #[error("Job output not found: {0}")]
    JobOutputNotFound(String),

    #[error("Failed to create stream: {0}")]
    StreamCreation(String),

    #[error("Failed to initialize stream: {0}")]
    StreamInit(String),

    #[error("Stream failed: {0}")]
    StreamRuntime(String),

    #[error("Lock poisoned: {0}")]
    Lock(&'static str),

    #[error("Async runtime unavailable: {0}")]
    Runtime(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn user_suffix(user: &Option<String>) -> String {
    match user {
        Some(name) => format!(" for user {}", name),
        None => String::new(),
    }
}

impl LauncherError {
    /// The error code reported to the requester for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LauncherError::JobNotFound { .. } => ErrorKind::JobNotFound,
            LauncherError::JobNotRunning(_) => ErrorKind::JobNotRunning,
            LauncherError::JobOutputNotFound(_) => ErrorKind::JobOutputNotFound,
            _ => ErrorKind::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, LauncherError>;

/// Acquire a mutex, turning poisoning into [`LauncherError::Lock`].
pub(crate) fn lock<'a, T>(
    mutex: &'a std::sync::Mutex<T>,
    what: &'static str,
) -> Result<std::sync::MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| LauncherError::Lock(what))
}

pub(crate) fn read<'a, T>(
    lock: &'a std::sync::RwLock<T>,
    what: &'static str,
) -> Result<std::sync::RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| LauncherError::Lock(what))
}

pub(crate) fn write<'a, T>(
    lock: &'a std::sync::RwLock<T>,
    what: &'static str,
) -> Result<std::sync::RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| LauncherError::Lock(what))
}
