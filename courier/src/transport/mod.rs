//! Broker transports.
//!
//! The engine only talks to brokers through [`Transport`]. Implementations:
//! - [`MemoryTransport`]: in-process transient broker
//! - [`AmqpTransport`]: RabbitMQ via lapin
//! - [`FailoverTransport`]: wraps another transport and can retarget it at runtime

pub mod amqp;
pub mod failover;
pub mod memory;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::{MqError, MqResult};

pub use amqp::{AmqpTransport, TempQueueFilter};
pub use failover::FailoverTransport;
pub use memory::MemoryTransport;

/// Transport-level metadata carried alongside a message body.
pub type Headers = BTreeMap<String, String>;

pub const HEADER_MESSAGE_ID: &str = "message-id";
pub const HEADER_MESSAGE_TYPE: &str = "message-type";
pub const HEADER_CONTENT_TYPE: &str = "content-type";

/// A serialised message as handed to or received from a broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMessage {
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl RawMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            headers: Headers::new(),
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A received message awaiting ack or reject.
#[derive(Clone)]
pub struct Delivery {
    /// Queue the message was taken from
    pub queue: String,
    /// Broker-assigned delivery tag
    pub tag: u64,
    pub message: RawMessage,
    /// Transport that produced this delivery, when it differs from the one
    /// currently active (set by [`FailoverTransport`]).
    pub(crate) origin: Option<Arc<dyn Transport>>,
    /// Broker channel the tag belongs to. Tags are only valid on that channel.
    pub(crate) session: u64,
}

impl Delivery {
    pub fn new(queue: impl Into<String>, tag: u64, message: RawMessage) -> Self {
        Self {
            queue: queue.into(),
            tag,
            message,
            origin: None,
            session: 0,
        }
    }

    pub(crate) fn with_session(mut self, session: u64) -> Self {
        self.session = session;
        self
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("tag", &self.tag)
            .field("session", &self.session)
            .field("body_length", &self.message.body.len())
            .field("origin", &self.origin.as_ref().map(|t| t.name().to_string()))
            .finish()
    }
}

/// A queue known to the broker and how long it has been idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub idle: Duration,
}

/// Primitive broker operations the engine is built on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Enqueue a message.
    async fn publish(&self, queue: &str, message: RawMessage) -> MqResult<()>;

    /// Take the next message, waiting at most `timeout`. `Duration::ZERO` polls once.
    async fn receive(&self, queue: &str, timeout: Duration) -> MqResult<Option<Delivery>>;

    /// Finalize a delivery.
    async fn ack(&self, delivery: &Delivery) -> MqResult<()>;

    /// Return a delivery to the broker, either back onto its queue or discarded.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> MqResult<()>;

    /// Declare a temporary queue.
    async fn create_temp_queue(&self, queue: &str) -> MqResult<()>;

    /// Remove every message from a queue, returning how many were removed.
    async fn purge(&self, queue: &str) -> MqResult<u64>;

    /// Queues this transport can enumerate.
    async fn list_queues(&self) -> MqResult<Vec<QueueInfo>>;

    async fn delete_queue(&self, queue: &str) -> MqResult<()>;

    /// Delete `queue` if it has been idle for longer than `idle` at the moment
    /// of deletion. Returns whether the queue was deleted.
    async fn delete_queue_if_idle(&self, queue: &str, idle: Duration) -> MqResult<bool>;

    /// Release the broker connection.
    async fn close(&self) -> MqResult<()>;
}

/// Opens transports for broker endpoints.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, endpoint: &Url) -> MqResult<Arc<dyn Transport>>;
}

/// Connects `amqp://`/`amqps://` endpoints with lapin and `memory://{name}` to
/// in-process brokers.
///
/// In-process brokers are kept by name, so connecting to the same
/// `memory://` endpoint twice yields the same broker.
#[derive(Default)]
pub struct DefaultTransportFactory {
    memory_brokers: Mutex<HashMap<String, Arc<MemoryTransport>>>,
    poll_interval: Option<Duration>,
    temp_queue_filter: Option<TempQueueFilter>,
}

impl DefaultTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Polling interval used by transports without a blocking receive.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }

    /// How broker transports recognise temporary queue names.
    pub fn with_temp_queue_filter(mut self, filter: TempQueueFilter) -> Self {
        self.temp_queue_filter = Some(filter);
        self
    }

    /// The in-process broker registered under `name`, created on first use.
    pub fn memory_broker(&self, name: &str) -> MqResult<Arc<MemoryTransport>> {
        let mut brokers = self
            .memory_brokers
            .lock()
            .map_err(|_| MqError::Transport("memory broker registry poisoned".to_string()))?;

        Ok(Arc::clone(brokers.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MemoryTransport::with_name(format!("memory://{}", name)))
        })))
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn connect(&self, endpoint: &Url) -> MqResult<Arc<dyn Transport>> {
        match endpoint.scheme() {
            "memory" => {
                let name = endpoint.host_str().unwrap_or("default");
                let broker: Arc<dyn Transport> = self.memory_broker(name)?;
                Ok(broker)
            }
            "amqp" | "amqps" => {
                let mut transport = AmqpTransport::new(endpoint.as_str());
                if let Some(poll_interval) = self.poll_interval {
                    transport = transport.with_poll_interval(poll_interval);
                }
                if let Some(filter) = &self.temp_queue_filter {
                    transport = transport.with_temp_queue_filter(Arc::clone(filter));
                }
                transport.connect().await?;
                Ok(Arc::new(transport))
            }
            other => Err(MqError::Configuration(format!(
                "unsupported broker scheme '{}'",
                other
            ))),
        }
    }
}
