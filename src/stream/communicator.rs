use std::io::Write;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::{lock, LauncherError, Result};
use crate::stream::response::Response;

/// Delivers responses to the watchers on the other side of the transport.
///
/// Must be callable from any thread. Each response is handed over whole, so
/// implementations never interleave two messages.
pub trait Communicator: Send + Sync {
    fn send_response(&self, response: Response);
}

/// Hands responses to a transport task through an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelCommunicator {
    tx: mpsc::UnboundedSender<Response>,
}

impl ChannelCommunicator {
    pub fn new(tx: mpsc::UnboundedSender<Response>) -> Self {
        Self { tx }
    }

    /// A communicator plus the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Response>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl Communicator for ChannelCommunicator {
    fn send_response(&self, response: Response) {
        if self.tx.send(response).is_err() {
            tracing::debug!("Response receiver dropped, discarding response");
        }
    }
}

/// Writes each response as one line of JSON.
pub struct WriterCommunicator<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterCommunicator<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|_| LauncherError::Lock("response writer"))
    }

    fn write_response(&self, response: &Response) -> Result<()> {
        let mut line = serde_json::to_vec(response)?;
        line.push(b'\n');

        let mut writer = lock(&self.writer, "response writer")?;
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> Communicator for WriterCommunicator<W> {
    fn send_response(&self, response: Response) {
        if let Err(e) = self.write_response(&response) {
            tracing::error!(error = %e, "Failed to write response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::response::{ErrorKind, ErrorResponse, OutputChunk, OutputResponse, StreamSequenceId};

    #[test]
    fn writer_communicator_writes_json_lines() {
        let communicator = WriterCommunicator::new(Vec::new());
        communicator.send_response(ErrorResponse::new(1, ErrorKind::Unknown, "boom").into());
        communicator.send_response(
            OutputResponse::output(StreamSequenceId::new(2, 1), OutputChunk::stdout("hi")).into(),
        );

        let bytes = communicator.into_inner().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["errorMessage"], "boom");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["output"], "hi");
    }

    #[test]
    fn channel_communicator_forwards() {
        let (communicator, mut rx) = ChannelCommunicator::channel();
        communicator.send_response(ErrorResponse::new(3, ErrorKind::JobNotFound, "gone").into());

        let response = rx.try_recv().unwrap();
        assert_eq!(response.request_ids(), vec![3]);
    }

    #[test]
    fn channel_communicator_ignores_closed_receiver() {
        let (communicator, rx) = ChannelCommunicator::channel();
        drop(rx);
        communicator.send_response(ErrorResponse::new(3, ErrorKind::Unknown, "late").into());
    }
}
