use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::error::{lock, LauncherError, Result};
use crate::jobs::{JobPtr, JobStatusNotifier, JobStore, User};
use crate::stream::communicator::Communicator;
use crate::stream::kind::{OutputStream, ResourceStream, StreamKind};
use crate::stream::response::{ErrorKind, ErrorResponse, OutputType};
use crate::stream::session::StreamSession;
use crate::stream::source::JobSource;

/// A request to start, re-join or cancel a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest<F> {
    pub request_id: u64,
    pub job_id: String,
    pub user: User,
    pub is_cancel: bool,
    pub filter: F,
}

impl<F: Default> StreamRequest<F> {
    pub fn new(request_id: u64, job_id: impl Into<String>, user: User) -> Self {
        Self {
            request_id,
            job_id: job_id.into(),
            user,
            is_cancel: false,
            filter: F::default(),
        }
    }

    pub fn cancel(request_id: u64, job_id: impl Into<String>, user: User) -> Self {
        Self {
            is_cancel: true,
            ..Self::new(request_id, job_id, user)
        }
    }
}

impl<F> StreamRequest<F> {
    pub fn with_filter(mut self, filter: F) -> Self {
        self.filter = filter;
        self
    }
}

pub type ResourceStreamRequest = StreamRequest<()>;
pub type OutputStreamRequest = StreamRequest<OutputType>;

/// Routes stream requests to one [`StreamSession`] per job.
pub struct StreamManager<K: StreamKind> {
    store: Arc<JobStore>,
    notifier: Arc<JobStatusNotifier>,
    source: Arc<dyn JobSource>,
    communicator: Arc<dyn Communicator>,
    sessions: Mutex<HashMap<String, Arc<StreamSession<K>>>>,
    weak_self: Weak<Self>,
}

pub type ResourceStreamManager = StreamManager<ResourceStream>;
pub type OutputStreamManager = StreamManager<OutputStream>;

impl<K: StreamKind> StreamManager<K> {
    pub fn new(
        store: Arc<JobStore>,
        notifier: Arc<JobStatusNotifier>,
        source: Arc<dyn JobSource>,
        communicator: Arc<dyn Communicator>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            store,
            notifier,
            source,
            communicator,
            sessions: Mutex::new(HashMap::new()),
            weak_self: Weak::clone(weak_self),
        })
    }

    /// Start, join or cancel a stream. Failures that concern only this request
    /// are answered with a one-shot error response; lock failures are logged.
    pub fn handle_stream_request(&self, request: StreamRequest<K::Filter>) {
        let request_id = request.request_id;
        let job_id = request.job_id.clone();
        if let Err(e) = self.try_handle_stream_request(request) {
            tracing::error!(
                job_id = %job_id,
                request_id,
                kind = K::NAME,
                error = %e,
                "Stream request abandoned"
            );
        }
    }

    fn try_handle_stream_request(&self, request: StreamRequest<K::Filter>) -> Result<()> {
        let Some(job) = self.store.get_job(&request.job_id, &request.user) else {
            let error = LauncherError::JobNotFound {
                job_id: request.job_id.clone(),
                user: (!request.user.is_all_users()).then(|| request.user.username().to_string()),
            };
            self.send_error(request.request_id, error.kind(), &error);
            return Ok(());
        };

        // The new session goes into the table before its producer exists, so
        // concurrent requests for the job join it instead of creating another.
        let created = {
            let mut sessions = lock(&self.sessions, "stream sessions")?;

            if let Some(session) = sessions.get(job.id()).cloned() {
                if request.is_cancel {
                    let remaining = session.remove_request(request.request_id)?;
                    if remaining == 0 {
                        sessions.remove(job.id());
                        drop(sessions);
                        session.close();
                        tracing::info!(job_id = %job.id(), kind = K::NAME, "Stream session released by last requester");
                    }
                } else {
                    session.add_request(request.request_id, request.filter);
                }
                return Ok(());
            }

            if request.is_cancel {
                return Ok(());
            }

            let session = StreamSession::new(
                Arc::clone(&job),
                Weak::clone(&self.weak_self),
                Arc::clone(&self.communicator),
            );
            session.add_request(request.request_id, request.filter);
            sessions.insert(job.id().to_string(), Arc::clone(&session));
            tracing::info!(job_id = %job.id(), kind = K::NAME, request_id = request.request_id, "Stream session created");
            session
        };

        // Everything below runs outside the table lock. The job source and the
        // producer may report through their sink, and a report may end the
        // stream and take the session back out of the table.
        if let Err(e) = self.start_session(&created, &job) {
            tracing::warn!(job_id = %job.id(), kind = K::NAME, error = %e, "Failed to create stream");
            let kind = match e.kind() {
                ErrorKind::Unknown => K::CREATION_ERROR,
                kind => kind,
            };
            created.reject(kind, &e);
        }

        // A status update or a report may have ended the stream while it was
        // being set up.
        if created.is_complete() {
            self.discard(job.id(), &created);
        }
        Ok(())
    }

    fn start_session(&self, session: &Arc<StreamSession<K>>, job: &JobPtr) -> Result<()> {
        let producer = K::create_producer(self.source.as_ref(), job, session.sink())?;
        if !session.set_producer(producer)? {
            // Every requester cancelled while the producer was being created.
            return Ok(());
        }
        session.watch(&self.notifier)?;
        session.on_job_update(job);
        Ok(())
    }

    fn send_error(&self, request_id: u64, kind: ErrorKind, error: &LauncherError) {
        self.communicator
            .send_response(ErrorResponse::new(request_id, kind, error.to_string()).into());
    }

    /// Forget `session` if it is still the active one for `job_id`.
    pub(crate) fn discard(&self, job_id: &str, session: &StreamSession<K>) {
        match lock(&self.sessions, "stream sessions") {
            Ok(mut sessions) => {
                let current = sessions
                    .get(job_id)
                    .is_some_and(|active| std::ptr::eq(Arc::as_ptr(active), session));
                if current {
                    sessions.remove(job_id);
                }
            }
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "Failed to discard stream session"),
        }
    }

    /// The active session for `job_id`, if any.
    pub fn session(&self, job_id: &str) -> Option<Arc<StreamSession<K>>> {
        lock(&self.sessions, "stream sessions")
            .ok()?
            .get(job_id)
            .cloned()
    }

    pub fn active_sessions(&self) -> usize {
        lock(&self.sessions, "stream sessions")
            .map(|sessions| sessions.len())
            .unwrap_or(0)
    }
}
