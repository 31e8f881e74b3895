//! Job data streams: one producer per job and stream kind, multiplexed to
//! every request watching that job.

pub mod communicator;
pub mod kind;
pub mod manager;
pub mod response;
pub mod session;
pub mod source;

pub use communicator::{ChannelCommunicator, Communicator, WriterCommunicator};
pub use kind::{OutputStream, ResourceStream, StreamKind};
pub use manager::{
    OutputStreamManager, OutputStreamRequest, ResourceStreamManager, ResourceStreamRequest,
    StreamManager, StreamRequest,
};
pub use response::{
    ErrorKind, ErrorResponse, OutputChunk, OutputResponse, OutputType, ResourceUtilData,
    ResourceUtilResponse, Response, StreamSequenceId,
};
pub use session::StreamSession;
pub use source::{JobSource, ResourcePoller, StreamProducer, StreamSink, TimedResourceStream};
