use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use crate::error::{lock, LauncherError, Result};
use crate::jobs::{JobPtr, JobStatusNotifier, Subscription};
use crate::stream::communicator::Communicator;
use crate::stream::kind::StreamKind;
use crate::stream::manager::StreamManager;
use crate::stream::response::{ErrorKind, ErrorResponse, Response, StreamSequenceId};
use crate::stream::source::{StreamProducer, StreamSink};

struct ProducerSlot {
    producer: Option<Box<dyn StreamProducer>>,
    initialized: bool,
    closed: bool,
}

// Why a completed session ended, replayed to requests that join afterwards.
enum Failure {
    Rejected { kind: ErrorKind, message: String },
    Stream(LauncherError),
}

struct RequestState<F> {
    next_sequence: u64,
    filter: F,
}

impl<F> RequestState<F> {
    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }
}

struct SessionState<K: StreamKind> {
    requests: BTreeMap<u64, RequestState<K::Filter>>,
    complete: bool,
    failure: Option<Failure>,
    last_data: Option<K::Data>,
}

impl<K: StreamKind> SessionState<K> {
    // Sequence numbers are taken only for requests that receive the broadcast.
    fn allocate(&mut self, wants: impl Fn(&K::Filter) -> bool) -> Vec<StreamSequenceId> {
        self.requests
            .iter_mut()
            .filter(|(_, request)| wants(&request.filter))
            .map(|(id, request)| StreamSequenceId::new(*id, request.next_sequence()))
            .collect()
    }
}

/// One producer for one job, fanned out to every request watching it.
///
/// Lock order: the producer slot before the request state. The producer may
/// report from inside its factory, [`StreamProducer::initialize`] or
/// [`StreamProducer::finish`]. None of these run under the manager's table
/// lock, so a report that ends the stream can always leave the table.
pub struct StreamSession<K: StreamKind> {
    job: JobPtr,
    manager: Weak<StreamManager<K>>,
    communicator: Arc<dyn Communicator>,
    producer: Mutex<ProducerSlot>,
    state: Mutex<SessionState<K>>,
    subscription: Mutex<Option<Subscription>>,
}

impl<K: StreamKind> std::fmt::Debug for StreamSession<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("kind", &K::NAME)
            .field("job_id", &self.job.id())
            .field("requests", &self.request_count())
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl<K: StreamKind> StreamSession<K> {
    pub(crate) fn new(
        job: JobPtr,
        manager: Weak<StreamManager<K>>,
        communicator: Arc<dyn Communicator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            job,
            manager,
            communicator,
            producer: Mutex::new(ProducerSlot {
                producer: None,
                initialized: false,
                closed: false,
            }),
            state: Mutex::new(SessionState {
                requests: BTreeMap::new(),
                complete: false,
                failure: None,
                last_data: None,
            }),
            subscription: Mutex::new(None),
        })
    }

    /// A sink the producer of this session reports through.
    pub fn sink(self: &Arc<Self>) -> StreamSink<K> {
        StreamSink::new(Arc::downgrade(self))
    }

    /// Install the producer. Returns false, dropping the producer, if the
    /// session was closed while the producer was being created.
    pub(crate) fn set_producer(&self, producer: Box<dyn StreamProducer>) -> Result<bool> {
        let mut slot = lock(&self.producer, "stream producer")?;
        if slot.closed {
            return Ok(false);
        }
        slot.producer = Some(producer);
        Ok(true)
    }

    /// Follow status updates of the session's job.
    pub(crate) fn watch(self: &Arc<Self>, notifier: &JobStatusNotifier) -> Result<()> {
        let session = Arc::downgrade(self);
        let subscription = notifier.subscribe(self.job.id(), move |job| {
            if let Some(session) = session.upgrade() {
                session.on_job_update(job);
            }
        })?;
        *lock(&self.subscription, "stream subscription")? = Some(subscription);
        Ok(())
    }

    pub fn job(&self) -> &JobPtr {
        &self.job
    }

    /// Register a requester. A late joiner immediately gets the cached data
    /// and, if the stream already ended, the terminal signal.
    pub fn add_request(&self, request_id: u64, filter: K::Filter) {
        if let Err(e) = self.try_add_request(request_id, filter) {
            tracing::error!(job_id = %self.job.id(), request_id, error = %e, "Failed to add stream request");
        }
    }

    fn try_add_request(&self, request_id: u64, filter: K::Filter) -> Result<()> {
        let mut state = lock(&self.state, "stream session")?;
        if state.requests.contains_key(&request_id) {
            tracing::debug!(job_id = %self.job.id(), request_id, kind = K::NAME, "Duplicate stream request");
            return Ok(());
        }

        let mut request = RequestState {
            next_sequence: 1,
            filter,
        };

        if let Some(data) = &state.last_data {
            if K::accepts(&request.filter, data) {
                let target = [StreamSequenceId::new(request_id, request.next_sequence())];
                self.send(K::data_responses(&target, data));
            }
        }
        if state.complete {
            let target = [StreamSequenceId::new(request_id, request.next_sequence())];
            let replay = match &state.failure {
                None => K::complete_responses(&target),
                Some(Failure::Stream(error)) => K::error_responses(&target, error),
                Some(Failure::Rejected { kind, message }) => {
                    vec![ErrorResponse::new(request_id, *kind, message.clone()).into()]
                }
            };
            self.send(replay);
        }

        state.requests.insert(request_id, request);
        Ok(())
    }

    /// Deregister a requester. Returns the number of requests left.
    pub fn remove_request(&self, request_id: u64) -> Result<usize> {
        let mut state = lock(&self.state, "stream session")?;
        state.requests.remove(&request_id);
        Ok(state.requests.len())
    }

    pub fn report_data(&self, data: K::Data) {
        if let Err(e) = self.try_report_data(data) {
            tracing::error!(job_id = %self.job.id(), kind = K::NAME, error = %e, "Failed to report stream data");
        }
    }

    fn try_report_data(&self, data: K::Data) -> Result<()> {
        let mut state = lock(&self.state, "stream session")?;
        if state.complete {
            return Ok(());
        }

        let targets = state.allocate(|filter| K::accepts(filter, &data));
        self.send(K::data_responses(&targets, &data));
        if K::CACHES_LAST_DATA {
            state.last_data = Some(data);
        }
        Ok(())
    }

    /// End the stream because the producer failed. Every requester is told
    /// once; later reports are ignored.
    pub fn report_error(&self, error: LauncherError) {
        let ended = match lock(&self.state, "stream session") {
            Ok(mut state) if !state.complete => {
                state.complete = true;
                tracing::error!(job_id = %self.job.id(), kind = K::NAME, error = %error, "Stream failed");
                let targets = state.allocate(|_| true);
                self.send(K::error_responses(&targets, &error));
                state.failure = Some(Failure::Stream(error));
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::error!(job_id = %self.job.id(), error = %e, "Failed to report stream error");
                false
            }
        };

        if ended {
            self.discard();
        }
    }

    /// End the stream because its producer could not be created. Each request
    /// gets a one-shot error response instead of a stream broadcast.
    pub(crate) fn reject(&self, kind: ErrorKind, error: &LauncherError) {
        let ended = match lock(&self.state, "stream session") {
            Ok(mut state) if !state.complete => {
                state.complete = true;
                let message = error.to_string();
                for request_id in state.requests.keys() {
                    self.communicator.send_response(
                        ErrorResponse::new(*request_id, kind, message.clone()).into(),
                    );
                }
                state.failure = Some(Failure::Rejected { kind, message });
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::error!(job_id = %self.job.id(), error = %e, "Failed to reject stream requests");
                false
            }
        };

        if ended {
            self.discard();
        }
    }

    /// End the stream normally. Idempotent.
    pub fn set_stream_complete(&self) {
        let ended = match lock(&self.state, "stream session") {
            Ok(mut state) if !state.complete => {
                state.complete = true;
                let targets = state.allocate(|_| true);
                self.send(K::complete_responses(&targets));
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::error!(job_id = %self.job.id(), error = %e, "Failed to complete stream");
                false
            }
        };

        if ended {
            tracing::info!(job_id = %self.job.id(), kind = K::NAME, "Stream completed");
            self.discard();
        }
    }

    /// Bring the session in line with the job's current status: start the
    /// producer once the job is ready, end the stream once the job is done.
    pub fn on_job_update(&self, job: &JobPtr) {
        let (status, completed) = match job.lock() {
            Ok(details) => (details.status, details.is_completed()),
            Err(e) => {
                tracing::error!(job_id = %job.id(), error = %e, "Failed to read job status for stream");
                return;
            }
        };

        if K::should_start(status) {
            if let Err(e) = self.ensure_initialized() {
                self.report_error(e);
                return;
            }
        }

        if completed {
            self.finish_producer();
            self.set_stream_complete();
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        let mut slot = lock(&self.producer, "stream producer")?;
        if slot.initialized || slot.closed || lock(&self.state, "stream session")?.complete {
            return Ok(());
        }
        let Some(producer) = slot.producer.as_mut() else {
            return Ok(());
        };

        producer
            .initialize()
            .map_err(|e| LauncherError::StreamInit(e.to_string()))?;
        slot.initialized = true;
        tracing::info!(job_id = %self.job.id(), kind = K::NAME, "Stream producer started");
        Ok(())
    }

    fn finish_producer(&self) {
        match lock(&self.producer, "stream producer") {
            Ok(mut slot) => {
                if slot.initialized {
                    if let Some(producer) = slot.producer.as_mut() {
                        producer.finish();
                    }
                }
            }
            Err(e) => tracing::error!(job_id = %self.job.id(), error = %e, "Failed to finish stream producer"),
        }
    }

    // Removing the session from its manager's table drops the last long-lived
    // reference; the producer goes with it.
    fn discard(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.discard(self.job.id(), self);
        }
    }

    /// Release the producer and stop following the job.
    pub(crate) fn close(&self) {
        let producer = lock(&self.producer, "stream producer")
            .map(|mut slot| {
                slot.closed = true;
                slot.producer.take()
            })
            .unwrap_or_else(|e| {
                tracing::error!(job_id = %self.job.id(), error = %e, "Failed to release stream producer");
                None
            });
        drop(producer);

        let subscription = lock(&self.subscription, "stream subscription")
            .map(|mut subscription| subscription.take())
            .unwrap_or(None);
        drop(subscription);

        tracing::debug!(job_id = %self.job.id(), kind = K::NAME, "Stream session closed");
    }

    fn send(&self, responses: Vec<Response>) {
        for response in responses {
            self.communicator.send_response(response);
        }
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.state, "stream session")
            .map(|state| state.complete)
            .unwrap_or(true)
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.producer, "stream producer")
            .map(|slot| slot.initialized)
            .unwrap_or(false)
    }

    /// Whether the last requester left and the producer has been released.
    pub fn is_closed(&self) -> bool {
        lock(&self.producer, "stream producer")
            .map(|slot| slot.closed)
            .unwrap_or(true)
    }

    pub fn request_count(&self) -> usize {
        lock(&self.state, "stream session")
            .map(|state| state.requests.len())
            .unwrap_or(0)
    }

    pub fn has_request(&self, request_id: u64) -> bool {
        lock(&self.state, "stream session")
            .map(|state| state.requests.contains_key(&request_id))
            .unwrap_or(false)
    }
}
