use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::Result;

static NEXT_RESPONSE_ID: AtomicU64 = AtomicU64::new(0);

fn next_response_id() -> u64 {
    NEXT_RESPONSE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Wire-level message type of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Error = -1,
    JobOutput = 5,
    JobResourceUtil = 6,
}

impl Serialize for ResponseType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i32(*self as i32)
    }
}

/// Error codes reported to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unknown = 0,
    RequestNotSupported = 1,
    InvalidRequest = 2,
    JobNotFound = 3,
    JobNotRunning = 6,
    JobOutputNotFound = 7,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

/// The sequence number of one broadcast, as seen by one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamSequenceId {
    #[serde(rename = "requestId")]
    pub request_id: u64,
    #[serde(rename = "seqId")]
    pub sequence_id: u64,
}

impl StreamSequenceId {
    pub fn new(request_id: u64, sequence_id: u64) -> Self {
        Self {
            request_id,
            sequence_id,
        }
    }
}

/// One resource utilization sample. Absent metrics are not reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtilData {
    #[serde(rename = "cpuPercent", skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(rename = "cpuTime", skip_serializing_if = "Option::is_none")]
    pub cpu_seconds: Option<f64>,
    #[serde(rename = "virtualMemory", skip_serializing_if = "Option::is_none")]
    pub virtual_mem: Option<f64>,
    #[serde(rename = "residentMemory", skip_serializing_if = "Option::is_none")]
    pub resident_mem: Option<f64>,
}

impl ResourceUtilData {
    pub fn has_data(&self) -> bool {
        self.cpu_percent.is_some()
            || self.cpu_seconds.is_some()
            || self.virtual_mem.is_some()
            || self.resident_mem.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputType {
    #[serde(rename = "stdout")]
    Stdout,
    #[serde(rename = "stderr")]
    Stderr,
    #[default]
    #[serde(rename = "mixed")]
    Both,
}

/// A piece of job output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub output: String,
    #[serde(rename = "outputType")]
    pub output_type: OutputType,
}

impl OutputChunk {
    pub fn new(output: impl Into<String>, output_type: OutputType) -> Self {
        Self {
            output: output.into(),
            output_type,
        }
    }

    pub fn stdout(output: impl Into<String>) -> Self {
        Self::new(output, OutputType::Stdout)
    }

    pub fn stderr(output: impl Into<String>) -> Self {
        Self::new(output, OutputType::Stderr)
    }
}

/// Resource utilization sent to every request of a session at once.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUtilResponse {
    message_type: ResponseType,
    request_id: u64,
    pub response_id: u64,
    pub sequences: Vec<StreamSequenceId>,
    #[serde(flatten)]
    pub data: ResourceUtilData,
    pub complete: bool,
}

impl ResourceUtilResponse {
    pub fn new(sequences: Vec<StreamSequenceId>, data: ResourceUtilData, complete: bool) -> Self {
        Self {
            message_type: ResponseType::JobResourceUtil,
            request_id: 0,
            response_id: next_response_id(),
            sequences,
            data,
            complete,
        }
    }
}

/// Output for a single request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputResponse {
    message_type: ResponseType,
    pub request_id: u64,
    pub response_id: u64,
    #[serde(rename = "seqId")]
    pub sequence_id: u64,
    pub complete: bool,
    #[serde(flatten)]
    pub chunk: Option<OutputChunk>,
}

impl OutputResponse {
    pub fn output(sequence: StreamSequenceId, chunk: OutputChunk) -> Self {
        Self::build(sequence, Some(chunk), false)
    }

    pub fn complete(sequence: StreamSequenceId) -> Self {
        Self::build(sequence, None, true)
    }

    fn build(sequence: StreamSequenceId, chunk: Option<OutputChunk>, complete: bool) -> Self {
        Self {
            message_type: ResponseType::JobOutput,
            request_id: sequence.request_id,
            response_id: next_response_id(),
            sequence_id: sequence.sequence_id,
            complete,
            chunk: chunk.filter(|chunk| !chunk.output.is_empty()),
        }
    }
}

/// A one-shot error for a single request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    message_type: ResponseType,
    pub request_id: u64,
    response_id: u64,
    #[serde(rename = "errorCode")]
    pub kind: ErrorKind,
    #[serde(rename = "errorMessage")]
    pub message: String,
}

impl ErrorResponse {
    pub fn new(request_id: u64, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message_type: ResponseType::Error,
            request_id,
            response_id: 0,
            kind,
            message: message.into(),
        }
    }
}

/// Every message the stream core hands to a [`Communicator`](super::Communicator).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    ResourceUtil(ResourceUtilResponse),
    Output(OutputResponse),
    Error(ErrorResponse),
}

impl Response {
    /// Request IDs this response is addressed to.
    pub fn request_ids(&self) -> Vec<u64> {
        match self {
            Response::ResourceUtil(r) => r.sequences.iter().map(|s| s.request_id).collect(),
            Response::Output(r) => vec![r.request_id],
            Response::Error(r) => vec![r.request_id],
        }
    }

    pub fn is_complete(&self) -> bool {
        match self {
            Response::ResourceUtil(r) => r.complete,
            Response::Output(r) => r.complete,
            Response::Error(_) => true,
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

impl From<ResourceUtilResponse> for Response {
    fn from(response: ResourceUtilResponse) -> Self {
        Response::ResourceUtil(response)
    }
}

impl From<OutputResponse> for Response {
    fn from(response: OutputResponse) -> Self {
        Response::Output(response)
    }
}

impl From<ErrorResponse> for Response {
    fn from(response: ErrorResponse) -> Self {
        Response::Error(response)
    }
}
