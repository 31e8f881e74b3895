use crate::error::{LauncherError, Result};
use crate::jobs::{JobPtr, JobStatus};
use crate::stream::response::{
    ErrorKind, ErrorResponse, OutputChunk, OutputResponse, OutputType, ResourceUtilData,
    ResourceUtilResponse, Response, StreamSequenceId,
};
use crate::stream::source::{JobSource, StreamProducer, StreamSink};

/// What varies between stream kinds: the payload, how requests filter it,
/// when the producer starts and how broadcasts are framed.
pub trait StreamKind: Sized + Send + Sync + 'static {
    type Data: Clone + Send + Sync + 'static;
    /// Per-request selection of the data a requester wants.
    type Filter: Clone + Default + Send + Sync + 'static;

    const NAME: &'static str;

    /// Whether the last data is kept and replayed to late joiners.
    const CACHES_LAST_DATA: bool;

    /// Error code for a producer the job source could not create.
    const CREATION_ERROR: ErrorKind;

    /// Whether a job in `status` is ready for its producer to start.
    fn should_start(status: JobStatus) -> bool;

    fn accepts(_filter: &Self::Filter, _data: &Self::Data) -> bool {
        true
    }

    fn create_producer(
        source: &dyn JobSource,
        job: &JobPtr,
        sink: StreamSink<Self>,
    ) -> Result<Box<dyn StreamProducer>>;

    fn data_responses(targets: &[StreamSequenceId], data: &Self::Data) -> Vec<Response>;

    fn complete_responses(targets: &[StreamSequenceId]) -> Vec<Response>;

    fn error_responses(targets: &[StreamSequenceId], error: &LauncherError) -> Vec<Response>;
}

/// Resource utilization of a running job.
#[derive(Debug)]
pub enum ResourceStream {}

impl StreamKind for ResourceStream {
    type Data = ResourceUtilData;
    type Filter = ();

    const NAME: &'static str = "resource";
    const CACHES_LAST_DATA: bool = true;
    const CREATION_ERROR: ErrorKind = ErrorKind::Unknown;

    // Sampling needs a live process.
    fn should_start(status: JobStatus) -> bool {
        status == JobStatus::Running
    }

    fn create_producer(
        source: &dyn JobSource,
        job: &JobPtr,
        sink: StreamSink<Self>,
    ) -> Result<Box<dyn StreamProducer>> {
        source.create_resource_stream(job, sink)
    }

    fn data_responses(targets: &[StreamSequenceId], data: &ResourceUtilData) -> Vec<Response> {
        if targets.is_empty() {
            return Vec::new();
        }
        vec![ResourceUtilResponse::new(targets.to_vec(), *data, false).into()]
    }

    fn complete_responses(targets: &[StreamSequenceId]) -> Vec<Response> {
        if targets.is_empty() {
            return Vec::new();
        }
        vec![ResourceUtilResponse::new(targets.to_vec(), ResourceUtilData::default(), true).into()]
    }

    // Requesters only see the stream end; the cause is logged by the session.
    fn error_responses(targets: &[StreamSequenceId], _error: &LauncherError) -> Vec<Response> {
        Self::complete_responses(targets)
    }
}

/// Standard output and error of a job.
#[derive(Debug)]
pub enum OutputStream {}

impl StreamKind for OutputStream {
    type Data = OutputChunk;
    type Filter = OutputType;

    const NAME: &'static str = "output";
    const CACHES_LAST_DATA: bool = false;
    const CREATION_ERROR: ErrorKind = ErrorKind::JobOutputNotFound;

    // Output of a job that already ended can still be read back.
    fn should_start(status: JobStatus) -> bool {
        status != JobStatus::Pending
    }

    fn accepts(filter: &OutputType, chunk: &OutputChunk) -> bool {
        *filter == OutputType::Both || *filter == chunk.output_type
    }

    fn create_producer(
        source: &dyn JobSource,
        job: &JobPtr,
        sink: StreamSink<Self>,
    ) -> Result<Box<dyn StreamProducer>> {
        source.create_output_stream(OutputType::Both, job, sink)
    }

    fn data_responses(targets: &[StreamSequenceId], chunk: &OutputChunk) -> Vec<Response> {
        targets
            .iter()
            .map(|target| OutputResponse::output(*target, chunk.clone()).into())
            .collect()
    }

    fn complete_responses(targets: &[StreamSequenceId]) -> Vec<Response> {
        targets
            .iter()
            .map(|target| OutputResponse::complete(*target).into())
            .collect()
    }

    fn error_responses(targets: &[StreamSequenceId], error: &LauncherError) -> Vec<Response> {
        targets
            .iter()
            .map(|target| {
                ErrorResponse::new(
                    target.request_id,
                    ErrorKind::JobOutputNotFound,
                    error.to_string(),
                )
                .into()
            })
            .collect()
    }
}
