//! Producer/consumer façade over a [`Transport`].
//!
//! The client resolves queue names, serialises envelopes, stamps transport
//! headers and applies publish/receive filters. It is shared by producers and by
//! the handler pipeline.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::names::QueueNames;
use super::types::{Message, MessageError, QueueMessage};
use crate::error::{MqError, MqResult};
use crate::transport::{
    Delivery, Headers, RawMessage, Transport, HEADER_CONTENT_TYPE, HEADER_MESSAGE_ID,
    HEADER_MESSAGE_TYPE,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Mutates transport headers before a message is sent.
pub type PublishFilter = Arc<dyn Fn(&str, &mut Headers) + Send + Sync>;

/// Observes transport headers of a received message.
pub type ReceiveFilter = Arc<dyn Fn(&str, &Headers) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ClientFilters {
    pub publish: Option<PublishFilter>,
    pub receive: Option<ReceiveFilter>,
}

/// A decoded message together with its pending delivery.
#[derive(Debug)]
pub struct Received<T> {
    pub message: Message<T>,
    pub delivery: Delivery,
    /// Message type stamped by the publisher, if any
    pub type_name: Option<String>,
}

impl<T> Received<T> {
    pub fn queue(&self) -> &str {
        &self.delivery.queue
    }
}

pub struct MessageQueueClient {
    transport: Arc<dyn Transport>,
    names: Arc<QueueNames>,
    filters: ClientFilters,
    poll_interval: Duration,
    temp_queues: Mutex<Vec<String>>,
}

impl MessageQueueClient {
    pub fn new(transport: Arc<dyn Transport>, names: Arc<QueueNames>) -> Self {
        Self {
            transport,
            names,
            filters: ClientFilters::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            temp_queues: Mutex::new(Vec::new()),
        }
    }

    pub fn with_filters(mut self, filters: ClientFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Longest single wait on the transport; blocking gets re-poll at this interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn names(&self) -> &Arc<QueueNames> {
        &self.names
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Publish a body as a new message to its type's in queue.
    pub async fn publish<T: QueueMessage>(&self, body: T) -> MqResult<()> {
        self.publish_message(Message::new(body)).await
    }

    /// Publish a message to its type's in queue, or the priority queue when
    /// `priority > 0`.
    pub async fn publish_message<T: QueueMessage>(&self, message: Message<T>) -> MqResult<()> {
        let names = self.names.for_type(T::TYPE_NAME);
        let queue = if message.is_priority() {
            &names.priority_q
        } else {
            &names.in_q
        };
        self.send(queue, Some(T::TYPE_NAME), &message).await
    }

    /// Publish a message to an explicit queue.
    pub async fn publish_to<T: QueueMessage>(&self, queue: &str, message: &Message<T>) -> MqResult<()> {
        self.send(queue, Some(T::TYPE_NAME), message).await
    }

    /// Publish an untyped message to an explicit queue, stamping `type_name`.
    pub async fn publish_untyped(
        &self,
        queue: &str,
        type_name: &str,
        message: &Message<Value>,
    ) -> MqResult<()> {
        self.send(queue, Some(type_name), message).await
    }

    async fn send<T: Serialize>(
        &self,
        queue: &str,
        type_name: Option<&str>,
        message: &Message<T>,
    ) -> MqResult<()> {
        let mut raw = RawMessage::new(message.to_bytes()?);
        raw.headers
            .insert(HEADER_MESSAGE_ID.to_string(), message.id.to_string());
        raw.headers
            .insert(HEADER_CONTENT_TYPE.to_string(), "application/json".to_string());
        if let Some(type_name) = type_name {
            raw.headers
                .insert(HEADER_MESSAGE_TYPE.to_string(), type_name.to_string());
        }

        if let Some(filter) = &self.filters.publish {
            filter(queue, &mut raw.headers);
        }

        let body_length = raw.body.len();
        self.transport.publish(queue, raw).await?;

        debug!(
            queue = queue,
            message_id = %message.id,
            body_length = body_length,
            "mq_message_published"
        );
        Ok(())
    }

    /// Take the next message from `queue`, waiting at most `wait`.
    pub async fn receive<T: DeserializeOwned>(
        &self,
        queue: &str,
        wait: Duration,
    ) -> MqResult<Option<Received<T>>> {
        let delivery = match self.transport.receive(queue, wait).await? {
            Some(delivery) => delivery,
            None => return Ok(None),
        };

        if let Some(filter) = &self.filters.receive {
            filter(queue, &delivery.message.headers);
        }

        match Message::<T>::from_bytes(&delivery.message.body) {
            Ok(message) => {
                let type_name = delivery
                    .message
                    .header(HEADER_MESSAGE_TYPE)
                    .map(str::to_string);
                Ok(Some(Received {
                    message,
                    delivery,
                    type_name,
                }))
            }
            Err(e) => {
                warn!(
                    queue = queue,
                    error = %e,
                    body_preview = %String::from_utf8_lossy(
                        &delivery.message.body[..delivery.message.body.len().min(200)]
                    ),
                    "mq_message_decode_failed"
                );
                // Undecodable messages would fail forever; drop them.
                self.transport.reject(&delivery, false).await?;
                Err(e)
            }
        }
    }

    /// Take the next message without waiting.
    pub async fn try_get<T: DeserializeOwned>(&self, queue: &str) -> MqResult<Option<Received<T>>> {
        self.receive(queue, Duration::ZERO).await
    }

    /// Block until a message arrives on `queue`.
    ///
    /// With a timeout, fails with [`MqError::Timeout`] once it elapses. Without
    /// one, waits indefinitely.
    pub async fn get<T: DeserializeOwned>(
        &self,
        queue: &str,
        timeout: Option<Duration>,
    ) -> MqResult<Received<T>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    remaining.min(self.poll_interval)
                }
                None => self.poll_interval,
            };

            if let Some(received) = self.receive(queue, wait).await? {
                return Ok(received);
            }

            if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
                if Instant::now() >= deadline {
                    return Err(MqError::Timeout(timeout, queue.to_string()));
                }
            }
        }
    }

    /// Finalize a delivery.
    pub async fn ack<T>(&self, received: &Received<T>) -> MqResult<()> {
        self.transport.ack(&received.delivery).await
    }

    /// Reject a message.
    ///
    /// With `requeue` the message is republished, `retry_attempts` untouched, to
    /// its type's in (or priority) queue. Otherwise `error` is attached and the
    /// message goes to the type's dead-letter queue. Either way the original
    /// delivery is acked.
    pub async fn nak<T: Serialize>(
        &self,
        mut received: Received<T>,
        requeue: bool,
        error: Option<MessageError>,
    ) -> MqResult<()> {
        let type_name = received.type_name.clone().ok_or_else(|| {
            MqError::Configuration(format!(
                "cannot nak message {} without a message type",
                received.message.id
            ))
        })?;
        let names = self.names.for_type(&type_name);

        let queue = if requeue {
            if received.message.is_priority() {
                &names.priority_q
            } else {
                &names.in_q
            }
        } else {
            if error.is_some() {
                received.message.error = error;
            }
            &names.dlq
        };

        self.send(queue, Some(type_name.as_str()), &received.message).await?;
        self.transport.ack(&received.delivery).await
    }

    /// Create a temporary queue owned by this client session.
    pub async fn get_temp_queue_name(&self) -> MqResult<String> {
        let name = self.names.temp_queue_name();
        self.transport.create_temp_queue(&name).await?;
        if let Ok(mut temp_queues) = self.temp_queues.lock() {
            temp_queues.push(name.clone());
        }
        debug!(queue = %name, "mq_temp_queue_created");
        Ok(name)
    }

    /// Delete temporary queues idle for longer than `idle`, returning how many
    /// were removed. Application queues are never touched.
    ///
    /// Idleness is re-checked by the transport at deletion time, so a queue
    /// that received a message after it was listed is kept.
    pub async fn expire_temp_queues(&self, idle: Duration) -> MqResult<usize> {
        let mut expired = 0;
        for queue in self.transport.list_queues().await? {
            if self.names.is_temp_queue(&queue.name)
                && queue.idle > idle
                && self.transport.delete_queue_if_idle(&queue.name, idle).await?
            {
                expired += 1;
            }
        }

        if expired > 0 {
            info!(expired = expired, idle_secs = idle.as_secs(), "mq_temp_queues_expired");
        }
        Ok(expired)
    }

    /// Remove every message from `queue`.
    pub async fn purge(&self, queue: &str) -> MqResult<u64> {
        self.transport.purge(queue).await
    }

    /// Delete the temporary queues this session created.
    pub async fn close(&self) -> MqResult<()> {
        let temp_queues = match self.temp_queues.lock() {
            Ok(mut temp_queues) => std::mem::take(&mut *temp_queues),
            Err(_) => Vec::new(),
        };
        for queue in temp_queues {
            self.transport.delete_queue(&queue).await?;
        }
        Ok(())
    }
}
