use std::fmt;

use parking_lot::Mutex;

use super::Message;
use crate::error::{Result, SyncError};

/// Wire side of the bus. Reconnect loops, broker sessions and acks belong to
/// implementations of this trait, never to [`super::PubSubBus`] itself.
pub trait BusTransport: Send + Sync {
    /// Establish the link. Called by [`super::PubSubBus::connect`] before the
    /// offline queue drains.
    fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Put one message on the wire.
    fn send(&self, message: &Message) -> Result<()>;

    /// When true the bus hands every sent message straight back to its own
    /// subscribers, standing in for a broker echo.
    fn loopback(&self) -> bool {
        false
    }
}

/// In-process transport: nothing leaves the process, every publish is
/// delivered to local subscribers.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoopbackTransport;

impl BusTransport for LoopbackTransport {
    fn send(&self, _message: &Message) -> Result<()> {
        Ok(())
    }

    fn loopback(&self) -> bool {
        true
    }
}

/// Captures everything sent so callers can assert on wire traffic.
pub struct RecordingTransport {
    loopback: bool,
    refuse_connect: Mutex<bool>,
    sent: Mutex<Vec<Message>>,
}

impl fmt::Debug for RecordingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingTransport")
            .field("loopback", &self.loopback)
            .field("sent", &self.sent.lock().len())
            .finish()
    }
}

impl RecordingTransport {
    /// Recorder that optionally echoes messages back to the bus.
    pub fn new(loopback: bool) -> Self {
        Self {
            loopback,
            refuse_connect: Mutex::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Make `connect` fail until called again with `false`.
    pub fn refuse_connections(&self, refuse: bool) {
        *self.refuse_connect.lock() = refuse;
    }

    /// Every message sent so far.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Topics of every message sent so far.
    pub fn sent_topics(&self) -> Vec<String> {
        self.sent.lock().iter().map(|m| m.topic.clone()).collect()
    }
}

impl BusTransport for RecordingTransport {
    fn connect(&self) -> Result<()> {
        if *self.refuse_connect.lock() {
            return Err(SyncError::Internal("transport refused connection".into()));
        }
        Ok(())
    }

    fn send(&self, message: &Message) -> Result<()> {
        self.sent.lock().push(message.clone());
        Ok(())
    }

    fn loopback(&self) -> bool {
        self.loopback
    }
}
