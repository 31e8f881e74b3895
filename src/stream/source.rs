use std::sync::Weak;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{LauncherError, Result};
use crate::jobs::JobPtr;
use crate::stream::kind::{OutputStream, ResourceStream, StreamKind};
use crate::stream::response::{OutputType, ResourceUtilData};
use crate::stream::session::StreamSession;

/// The backend half of a stream: produces data for one job.
///
/// A producer reports through the [`StreamSink`] it was created with. It is
/// released (dropped) when its session is torn down.
pub trait StreamProducer: Send {
    /// Start producing. Called at most once, when the job is ready.
    fn initialize(&mut self) -> Result<()>;

    /// The job reached a terminal state. Report anything still pending
    /// before the stream completes.
    fn finish(&mut self) {}
}

/// Backend factory for stream producers.
pub trait JobSource: Send + Sync {
    fn create_resource_stream(
        &self,
        job: &JobPtr,
        _sink: StreamSink<ResourceStream>,
    ) -> Result<Box<dyn StreamProducer>> {
        Err(LauncherError::StreamCreation(format!(
            "Resource utilization streaming is not supported for job {}",
            job.id()
        )))
    }

    fn create_output_stream(
        &self,
        _output_type: OutputType,
        job: &JobPtr,
        _sink: StreamSink<OutputStream>,
    ) -> Result<Box<dyn StreamProducer>> {
        Err(LauncherError::JobOutputNotFound(format!(
            "Output streaming is not supported for job {}",
            job.id()
        )))
    }
}

/// A producer's handle to its session. Reports are dropped once the session
/// is gone.
pub struct StreamSink<K: StreamKind> {
    session: Weak<StreamSession<K>>,
}

impl<K: StreamKind> Clone for StreamSink<K> {
    fn clone(&self) -> Self {
        Self {
            session: Weak::clone(&self.session),
        }
    }
}

impl<K: StreamKind> std::fmt::Debug for StreamSink<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSink")
            .field("kind", &K::NAME)
            .field("active", &self.is_active())
            .finish()
    }
}

impl<K: StreamKind> StreamSink<K> {
    pub(crate) fn new(session: Weak<StreamSession<K>>) -> Self {
        Self { session }
    }

    /// A sink that is not attached to any session.
    pub fn detached() -> Self {
        Self {
            session: Weak::new(),
        }
    }

    pub fn report_data(&self, data: K::Data) {
        if let Some(session) = self.session.upgrade() {
            session.report_data(data);
        }
    }

    pub fn report_error(&self, error: LauncherError) {
        if let Some(session) = self.session.upgrade() {
            session.report_error(error);
        }
    }

    pub fn set_stream_complete(&self) {
        if let Some(session) = self.session.upgrade() {
            session.set_stream_complete();
        }
    }

    /// Whether reports still reach a session that has not completed.
    pub fn is_active(&self) -> bool {
        self.session
            .upgrade()
            .is_some_and(|session| !session.is_complete())
    }
}

/// Samples resource utilization of a running job.
pub trait ResourcePoller: Send + 'static {
    fn poll(&mut self) -> Result<ResourceUtilData>;
}

/// A resource producer that samples its [`ResourcePoller`] on a fixed
/// interval, starting immediately. The first failed sample ends the stream.
pub struct TimedResourceStream<P: ResourcePoller> {
    poller: Option<P>,
    interval: Duration,
    sink: StreamSink<ResourceStream>,
    cancel: CancellationToken,
}

impl<P: ResourcePoller> TimedResourceStream<P> {
    pub fn new(poller: P, interval: Duration, sink: StreamSink<ResourceStream>) -> Self {
        Self {
            poller: Some(poller),
            interval,
            sink,
            cancel: CancellationToken::new(),
        }
    }
}

impl<P: ResourcePoller> StreamProducer for TimedResourceStream<P> {
    fn initialize(&mut self) -> Result<()> {
        let Some(mut poller) = self.poller.take() else {
            return Ok(());
        };
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| LauncherError::Runtime(e.to_string()))?;

        let sink = self.sink.clone();
        let cancel = self.cancel.clone();
        let period = self.interval;
        handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if !sink.is_active() {
                            break;
                        }
                        match poller.poll() {
                            Ok(data) => sink.report_data(data),
                            Err(e) => {
                                sink.report_error(e);
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

impl<P: ResourcePoller> Drop for TimedResourceStream<P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
