//! RabbitMQ transport using lapin.
//!
//! Messages are published through the default exchange with the queue name as
//! routing key. Receiving uses `basic.get` polling so every call honours its
//! timeout. Queues are declared durable on first use; temporary queues are
//! declared non-durable and tracked locally so idle ones can be swept.
//!
//! Delivery tags are scoped to the channel that produced them. Each channel
//! opened by the transport is a new session, and deliveries from an earlier
//! session are refused on ack or reject; the broker redelivers them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
        QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{Delivery, Headers, QueueInfo, RawMessage, Transport, HEADER_CONTENT_TYPE, HEADER_MESSAGE_ID};
use crate::error::{MqError, MqResult};
use crate::queue::QueueNames;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Decides whether a queue name is temporary, and so declared non-durable.
pub type TempQueueFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
struct Session {
    id: u64,
    channel: Channel,
}

/// RabbitMQ transport with lazy connection management.
///
/// The transport keeps one connection and channel, reconnecting on the next
/// operation after either is lost.
pub struct AmqpTransport {
    url: String,
    connection: RwLock<Option<Connection>>,
    session: RwLock<Option<Session>>,
    sessions: AtomicU64,
    declared: Mutex<HashSet<String>>,
    temp_queues: Mutex<HashMap<String, Instant>>,
    is_temp_queue: TempQueueFilter,
    poll_interval: Duration,
}

impl AmqpTransport {
    /// Temporary queues are recognised by the default `mq:tmp:` naming; use
    /// [`with_temp_queue_filter`](Self::with_temp_queue_filter) for other
    /// conventions.
    pub fn new(url: impl Into<String>) -> Self {
        let names = QueueNames::new();
        Self {
            url: url.into(),
            connection: RwLock::new(None),
            session: RwLock::new(None),
            sessions: AtomicU64::new(0),
            declared: Mutex::new(HashSet::new()),
            temp_queues: Mutex::new(HashMap::new()),
            is_temp_queue: Arc::new(move |queue: &str| names.is_temp_queue(queue)),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Temporary queues created by other clients (reply_to targets) must be
    /// declared with the same non-durable settings they were created with.
    pub fn with_temp_queue_filter(mut self, filter: TempQueueFilter) -> Self {
        self.is_temp_queue = filter;
        self
    }

    /// Open the connection eagerly.
    pub async fn connect(&self) -> MqResult<()> {
        self.ensure_connected().await.map(|_| ())
    }

    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> MqResult<Session> {
        {
            let session = self.session.read().await;
            if let Some(s) = session.as_ref() {
                if s.channel.status().connected() {
                    return Ok(s.clone());
                }
            }
        }

        let mut connection = self.connection.write().await;
        let mut session = self.session.write().await;

        // Double-check after acquiring write lock
        if let Some(s) = session.as_ref() {
            if s.channel.status().connected() {
                return Ok(s.clone());
            }
        }

        info!(url_length = self.url.len(), "rabbitmq_connecting");

        let conn = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| MqError::Connection(format!("failed to connect to RabbitMQ: {}", e)))?;

        let ch = conn.create_channel().await?;
        let id = self.sessions.fetch_add(1, Ordering::AcqRel) + 1;

        info!(session = id, "rabbitmq_connected");

        // Declarations belonged to the old channel's broker session.
        self.declared.lock().await.clear();

        let opened = Session { id, channel: ch };
        *connection = Some(conn);
        *session = Some(opened.clone());

        Ok(opened)
    }

    /// The channel `delivery` was received on, if it is still the open one.
    async fn delivery_channel(&self, delivery: &Delivery) -> MqResult<Channel> {
        let session = self.ensure_connected().await?;
        check_session(delivery, session.id)?;
        Ok(session.channel)
    }

    async fn declare(&self, channel: &Channel, queue: &str, durable: bool) -> MqResult<()> {
        let mut declared = self.declared.lock().await;
        if declared.contains(queue) {
            return Ok(());
        }

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        debug!(queue = queue, durable = durable, "rabbitmq_queue_declared");
        declared.insert(queue.to_string());
        Ok(())
    }

    async fn touch_temp(&self, queue: &str) {
        if let Some(last) = self.temp_queues.lock().await.get_mut(queue) {
            *last = Instant::now();
        }
    }

    async fn is_durable(&self, queue: &str) -> bool {
        !(self.temp_queues.lock().await.contains_key(queue) || (self.is_temp_queue)(queue))
    }

    async fn declare_for(&self, channel: &Channel, queue: &str) -> MqResult<()> {
        let durable = self.is_durable(queue).await;
        self.declare(channel, queue, durable).await
    }
}

fn check_session(delivery: &Delivery, current: u64) -> MqResult<()> {
    if delivery.session != current {
        return Err(MqError::Connection(format!(
            "delivery tag {} on {} belongs to closed channel session {} (current {})",
            delivery.tag, delivery.queue, delivery.session, current
        )));
    }
    Ok(())
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.as_str().into(), AMQPValue::LongString(value.as_str().into()));
    }
    table
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

#[async_trait]
impl Transport for AmqpTransport {
    fn name(&self) -> &str {
        "amqp"
    }

    async fn publish(&self, queue: &str, message: RawMessage) -> MqResult<()> {
        let Session { channel, .. } = self.ensure_connected().await?;
        self.declare_for(&channel, queue).await?;

        let mut properties = BasicProperties::default()
            .with_delivery_mode(2) // Persistent
            .with_headers(to_field_table(&message.headers));
        if let Some(content_type) = message.header(HEADER_CONTENT_TYPE) {
            properties = properties.with_content_type(content_type.into());
        }
        if let Some(message_id) = message.header(HEADER_MESSAGE_ID) {
            properties = properties.with_message_id(message_id.into());
        }

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?
            .await?;

        self.touch_temp(queue).await;

        debug!(
            queue = queue,
            body_length = message.body.len(),
            "rabbitmq_published"
        );
        Ok(())
    }

    async fn receive(&self, queue: &str, timeout: Duration) -> MqResult<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            let Session { id, channel } = self.ensure_connected().await?;
            self.declare_for(&channel, queue).await?;

            let got = channel
                .basic_get(queue, BasicGetOptions { no_ack: false })
                .await?;

            if let Some(got) = got {
                let delivery = got.delivery;
                let headers = delivery
                    .properties
                    .headers()
                    .as_ref()
                    .map(from_field_table)
                    .unwrap_or_default();

                self.touch_temp(queue).await;

                return Ok(Some(
                    Delivery::new(
                        queue,
                        delivery.delivery_tag,
                        RawMessage {
                            headers,
                            body: delivery.data,
                        },
                    )
                    .with_session(id),
                ));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> MqResult<()> {
        let channel = self.delivery_channel(delivery).await?;
        channel
            .basic_ack(delivery.tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> MqResult<()> {
        let channel = self.delivery_channel(delivery).await?;
        channel
            .basic_nack(
                delivery.tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn create_temp_queue(&self, queue: &str) -> MqResult<()> {
        let Session { channel, .. } = self.ensure_connected().await?;
        self.temp_queues
            .lock()
            .await
            .insert(queue.to_string(), Instant::now());
        self.declare(&channel, queue, false).await
    }

    async fn purge(&self, queue: &str) -> MqResult<u64> {
        let Session { channel, .. } = self.ensure_connected().await?;
        let count = channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await?;
        Ok(u64::from(count))
    }

    /// RabbitMQ cannot enumerate queues over AMQP, so only temporary queues
    /// declared through this transport are listed.
    async fn list_queues(&self) -> MqResult<Vec<QueueInfo>> {
        Ok(self
            .temp_queues
            .lock()
            .await
            .iter()
            .map(|(name, last)| QueueInfo {
                name: name.clone(),
                idle: last.elapsed(),
            })
            .collect())
    }

    async fn delete_queue(&self, queue: &str) -> MqResult<()> {
        let Session { channel, .. } = self.ensure_connected().await?;
        channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?;
        self.temp_queues.lock().await.remove(queue);
        self.declared.lock().await.remove(queue);
        Ok(())
    }

    /// Idleness is tracked locally, so another process may still have
    /// published to the queue. The broker-side `if_empty` guard keeps those
    /// messages and the queue stays until a later sweep. A refused delete
    /// closes the channel; unacked deliveries on it are redelivered.
    async fn delete_queue_if_idle(&self, queue: &str, idle: Duration) -> MqResult<bool> {
        let idle_now = |temp_queues: &HashMap<String, Instant>| {
            temp_queues
                .get(queue)
                .map_or(false, |last| last.elapsed() > idle)
        };
        if !idle_now(&*self.temp_queues.lock().await) {
            return Ok(false);
        }

        let Session { channel, .. } = self.ensure_connected().await?;

        // A publish landing after this check leaves the queue non-empty, and
        // `if_empty` refuses the delete.
        let mut temp_queues = self.temp_queues.lock().await;
        if !idle_now(&*temp_queues) {
            return Ok(false);
        }

        let deleted = channel
            .queue_delete(
                queue,
                QueueDeleteOptions {
                    if_empty: true,
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = deleted {
            debug!(queue = queue, error = %e, "rabbitmq_queue_delete_skipped");
            return Ok(false);
        }

        temp_queues.remove(queue);
        drop(temp_queues);
        self.declared.lock().await.remove(queue);
        Ok(true)
    }

    /// Close the connection gracefully.
    async fn close(&self) -> MqResult<()> {
        let mut connection = self.connection.write().await;
        let mut session = self.session.write().await;

        if let Some(Session { channel: ch, .. }) = session.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_transport_closed");
        Ok(())
    }
}
