//! Topic-addressed publish/subscribe bus.
//!
//! Subscriptions are keyed by their raw pattern string and callbacks run
//! synchronously inside whichever call delivers the message (`publish` on a
//! loopback transport, or [`PubSubBus::receive`] for inbound traffic).
//! Publishing before [`PubSubBus::connect`] queues messages; connecting drains
//! the queue in FIFO order ahead of any new publish.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::Result;

pub mod topic;
pub mod transport;

pub use topic::{MAX_TOPIC_LEN, topic_matches, validate_pattern, validate_topic};
pub use transport::{BusTransport, LoopbackTransport, RecordingTransport};

/// Reserved topic carrying liveness heartbeats.
pub const STATUS_TOPIC: &str = "status";

/// One published message: a concrete topic and a JSON payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Concrete topic, never a wildcard pattern.
    pub topic: String,
    /// JSON body.
    pub payload: Value,
}

impl Message {
    /// Message on `topic` carrying `payload`.
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// Subscriber callback. Runs synchronously on the delivering thread.
pub type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Link state as seen by the publish path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Publishes are queued.
    Disconnected,
    /// The queue is being drained; new publishes still queue behind it.
    Connecting,
    /// Publishes go straight to the transport.
    Connected,
}

struct Outbox {
    state: ConnectionState,
    pending: VecDeque<Message>,
}

/// Publish/subscribe bus over a pluggable [`BusTransport`].
///
/// Liveness is tracked apart from the subscription table, so no
/// `unsubscribe` call can switch it off.
pub struct PubSubBus {
    transport: Arc<dyn BusTransport>,
    outbox: Mutex<Outbox>,
    subscriptions: RwLock<HashMap<String, Vec<Callback>>>,
    alive: AtomicBool,
}

impl fmt::Debug for PubSubBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outbox = self.outbox.lock();
        f.debug_struct("PubSubBus")
            .field("state", &outbox.state)
            .field("pending", &outbox.pending.len())
            .field("patterns", &self.subscriptions.read().len())
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .finish()
    }
}

impl PubSubBus {
    /// Disconnected bus over `transport`; call [`PubSubBus::connect`] to
    /// start sending.
    pub fn new(transport: Arc<dyn BusTransport>) -> Self {
        Self {
            transport,
            outbox: Mutex::new(Outbox {
                state: ConnectionState::Disconnected,
                pending: VecDeque::new(),
            }),
            subscriptions: RwLock::new(HashMap::new()),
            alive: AtomicBool::new(false),
        }
    }

    /// Bus wired to an in-process loopback transport.
    pub fn loopback() -> Self {
        Self::new(Arc::new(LoopbackTransport))
    }

    /// Current link state.
    pub fn state(&self) -> ConnectionState {
        self.outbox.lock().state
    }

    /// Messages waiting for a connection.
    pub fn pending_len(&self) -> usize {
        self.outbox.lock().pending.len()
    }

    /// Register `callback` under `pattern`. A trailing `#` segment matches the
    /// prefix itself and everything below it.
    pub fn subscribe<F>(&self, pattern: &str, callback: F) -> Result<()>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        validate_pattern(pattern)?;
        self.subscriptions
            .write()
            .entry(pattern.to_string())
            .or_default()
            .push(Arc::new(callback));
        debug!(pattern, "subscribed");
        Ok(())
    }

    /// Drop every callback registered under `pattern`.
    pub fn unsubscribe(&self, pattern: &str) -> bool {
        self.subscriptions.write().remove(pattern).is_some()
    }

    /// Send `payload` on `topic`, or queue it while disconnected.
    pub fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        validate_topic(topic)?;
        let message = Message::new(topic, payload);

        {
            let mut outbox = self.outbox.lock();
            if outbox.state != ConnectionState::Connected {
                outbox.pending.push_back(message);
                debug!(topic, queued = outbox.pending.len(), "bus not connected; queued publish");
                return Ok(());
            }
        }

        self.deliver(&message)
    }

    /// [`PubSubBus::publish`] for any serialisable payload.
    pub fn publish_json<T: Serialize>(&self, topic: &str, payload: &T) -> Result<()> {
        self.publish(topic, serde_json::to_value(payload)?)
    }

    /// Transition to `Connected`, flushing queued messages first.
    ///
    /// Publishes racing with the drain are queued behind it, so enqueue order
    /// is preserved end to end.
    pub fn connect(&self) -> Result<()> {
        {
            let mut outbox = self.outbox.lock();
            match outbox.state {
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                ConnectionState::Disconnected => outbox.state = ConnectionState::Connecting,
            }
        }

        if let Err(err) = self.transport.connect() {
            self.outbox.lock().state = ConnectionState::Disconnected;
            warn!(error = %err, "bus transport failed to connect");
            return Err(err);
        }

        let mut flushed = 0usize;
        loop {
            let next = {
                let mut outbox = self.outbox.lock();
                match outbox.pending.pop_front() {
                    Some(message) => message,
                    None => {
                        outbox.state = ConnectionState::Connected;
                        break;
                    }
                }
            };

            if let Err(err) = self.deliver(&next) {
                let mut outbox = self.outbox.lock();
                outbox.pending.push_front(next);
                outbox.state = ConnectionState::Disconnected;
                return Err(err);
            }
            flushed += 1;
        }

        info!(flushed, "bus connected");
        Ok(())
    }

    /// Called by transport adapters when the link drops; later publishes queue.
    pub fn disconnect(&self) {
        self.outbox.lock().state = ConnectionState::Disconnected;
    }

    /// Deliver an inbound message to every matching subscriber.
    pub fn receive(&self, message: &Message) {
        if message.topic == STATUS_TOPIC && is_heartbeat(&message.payload) {
            self.alive.store(true, Ordering::SeqCst);
        }

        let callbacks: Vec<Callback> = {
            let subscriptions = self.subscriptions.read();
            subscriptions
                .iter()
                .filter(|(pattern, _)| topic_matches(pattern, &message.topic))
                .flat_map(|(_, callbacks)| callbacks.iter().cloned())
                .collect()
        };

        for callback in callbacks {
            callback(message);
        }
    }

    /// Publish `{"alive": true, "worker": ..}` on [`STATUS_TOPIC`].
    pub fn send_heartbeat(&self, worker_id: &str) -> Result<()> {
        self.publish(STATUS_TOPIC, json!({ "alive": true, "worker": worker_id }))
    }

    /// True once a heartbeat has been received since the last
    /// [`PubSubBus::mark_dead`].
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Reset liveness; only a later heartbeat sets it again.
    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn deliver(&self, message: &Message) -> Result<()> {
        self.transport.send(message)?;
        if self.transport.loopback() {
            self.receive(message);
        }
        Ok(())
    }
}

fn is_heartbeat(payload: &Value) -> bool {
    payload.get("alive") == Some(&Value::Bool(true))
}
