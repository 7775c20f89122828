//! Where decoded records go
//!
//! Each session connects its own [`SinkClient`] through the shared [`Pipeline`], publishes one
//! [`StructuredRecord`] per event, and closes the client when it shuts down. Transport, batching
//! and acknowledgement are up to the implementor.
//!
//! [`channel`] gives an in-memory pipeline, backed by a `std::sync::mpsc` channel.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use crate::decoder::StructuredRecord;

/// Sink module errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// No client could be connected
    ConnectFailed(String),
    /// The client has been closed, or its receiving end is gone
    Closed,
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::ConnectFailed(reason) => write!(f, "unable to connect to the sink: {}", reason),
            SinkError::Closed => write!(f, "sink is closed"),
        }
    }
}

impl std::error::Error for SinkError {}

/// A connection to the downstream sink
///
/// `publish` is called from the ETW dispatch thread. It must not block for long, since that
/// stalls the whole session.
pub trait SinkClient: Send + Sync {
    fn publish(&self, record: StructuredRecord) -> Result<(), SinkError>;

    /// Further `publish` calls fail with [`SinkError::Closed`]
    fn close(&self);
}

/// Hands out sink clients
pub trait Pipeline: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn SinkClient>, SinkError>;
}

/// An in-memory [`Pipeline`]
#[derive(Debug, Clone)]
pub struct ChannelPipeline {
    sender: mpsc::Sender<StructuredRecord>,
}

/// A client of a [`ChannelPipeline`]
#[derive(Debug)]
pub struct ChannelClient {
    sender: mpsc::Sender<StructuredRecord>,
    closed: AtomicBool,
}

/// Create an in-memory pipeline, and the receiving end of every record it is given
pub fn channel() -> (ChannelPipeline, mpsc::Receiver<StructuredRecord>) {
    let (sender, receiver) = mpsc::channel();
    (ChannelPipeline { sender }, receiver)
}

impl Pipeline for ChannelPipeline {
    fn connect(&self) -> Result<Arc<dyn SinkClient>, SinkError> {
        Ok(Arc::new(ChannelClient {
            sender: self.sender.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

impl SinkClient for ChannelClient {
    fn publish(&self, record: StructuredRecord) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        self.sender.send(record).map_err(|_| SinkError::Closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::decoder::test::sample_record;

    #[test]
    fn test_publish_then_close() {
        let (pipeline, receiver) = channel();
        let client = pipeline.connect().unwrap();

        client.publish(sample_record()).unwrap();
        assert_eq!(receiver.try_recv().unwrap().event_id, sample_record().event_id);

        client.close();
        assert_eq!(client.publish(sample_record()), Err(SinkError::Closed));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_clients_are_independent() {
        let (pipeline, receiver) = channel();
        let first = pipeline.connect().unwrap();
        let second = pipeline.connect().unwrap();

        first.close();
        second.publish(sample_record()).unwrap();
        assert!(receiver.try_recv().is_ok());
    }

    #[test]
    fn test_receiver_gone() {
        let (pipeline, receiver) = channel();
        let client = pipeline.connect().unwrap();
        drop(receiver);

        assert_eq!(client.publish(sample_record()), Err(SinkError::Closed));
    }
}
