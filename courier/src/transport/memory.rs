//! In-process transient broker.
//!
//! Queues are plain FIFO lists created on first use. Received messages stay in an
//! unacked table until they are acked or rejected, so a lost worker can hand them
//! back with [`MemoryTransport::recover`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use super::{Delivery, QueueInfo, RawMessage, Transport};
use crate::error::{MqError, MqResult};

struct QueueState {
    items: VecDeque<RawMessage>,
    last_activity: Instant,
}

impl QueueState {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

struct Unacked {
    queue: String,
    message: RawMessage,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
}

pub struct MemoryTransport {
    name: String,
    state: Mutex<BrokerState>,
    published: Notify,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_name("memory")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(BrokerState::default()),
            published: Notify::new(),
            next_tag: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MqResult<MutexGuard<'_, BrokerState>> {
        self.state
            .lock()
            .map_err(|_| MqError::Transport(format!("{} state poisoned", self.name)))
    }

    fn ensure_open(&self) -> MqResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::Connection(format!("{} is closed", self.name)));
        }
        Ok(())
    }

    fn try_take(&self, queue: &str) -> MqResult<Option<Delivery>> {
        let mut state = self.lock()?;
        let message = match state.queues.get_mut(queue) {
            Some(q) => {
                let message = q.items.pop_front();
                if message.is_some() {
                    q.touch();
                }
                message
            }
            None => None,
        };

        Ok(message.map(|message| {
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            state.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_string(),
                    message: message.clone(),
                },
            );
            Delivery::new(queue, tag, message)
        }))
    }

    /// Number of ready messages on `queue`.
    pub fn len(&self, queue: &str) -> usize {
        self.lock()
            .map(|state| state.queues.get(queue).map_or(0, |q| q.items.len()))
            .unwrap_or(0)
    }

    /// Number of received messages not yet acked or rejected.
    pub fn unacked_count(&self) -> usize {
        self.lock().map(|state| state.unacked.len()).unwrap_or(0)
    }

    /// Put every unacked message back at the head of its queue.
    pub fn recover(&self) -> MqResult<usize> {
        let mut state = self.lock()?;
        let unacked: Vec<Unacked> = state.unacked.drain().map(|(_, u)| u).collect();
        let count = unacked.len();
        for entry in unacked {
            let q = state
                .queues
                .entry(entry.queue)
                .or_insert_with(QueueState::new);
            q.items.push_front(entry.message);
            q.touch();
        }
        drop(state);

        if count > 0 {
            self.published.notify_waiters();
        }
        Ok(count)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, queue: &str, message: RawMessage) -> MqResult<()> {
        self.ensure_open()?;
        {
            let mut state = self.lock()?;
            let q = state
                .queues
                .entry(queue.to_string())
                .or_insert_with(QueueState::new);
            q.items.push_back(message);
            q.touch();
        }
        self.published.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str, timeout: Duration) -> MqResult<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.ensure_open()?;

            // Register interest before checking so a publish in between is not missed.
            let published = self.published.notified();
            tokio::pin!(published);
            published.as_mut().enable();

            if let Some(delivery) = self.try_take(queue)? {
                return Ok(Some(delivery));
            }

            if tokio::time::timeout_at(deadline, published).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> MqResult<()> {
        let mut state = self.lock()?;
        match state.unacked.remove(&delivery.tag) {
            Some(_) => Ok(()),
            None => Err(MqError::Transport(format!(
                "unknown delivery tag {} on {}",
                delivery.tag, self.name
            ))),
        }
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> MqResult<()> {
        let entry = {
            let mut state = self.lock()?;
            let entry = state.unacked.remove(&delivery.tag).ok_or_else(|| {
                MqError::Transport(format!(
                    "unknown delivery tag {} on {}",
                    delivery.tag, self.name
                ))
            })?;

            if requeue {
                let q = state
                    .queues
                    .entry(entry.queue.clone())
                    .or_insert_with(QueueState::new);
                q.items.push_front(entry.message.clone());
                q.touch();
            }
            entry
        };

        if requeue {
            self.published.notify_waiters();
        } else {
            debug!(queue = %entry.queue, tag = delivery.tag, "memory_message_discarded");
        }
        Ok(())
    }

    async fn create_temp_queue(&self, queue: &str) -> MqResult<()> {
        self.ensure_open()?;
        let mut state = self.lock()?;
        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(QueueState::new)
            .touch();
        Ok(())
    }

    async fn purge(&self, queue: &str) -> MqResult<u64> {
        let mut state = self.lock()?;
        Ok(state.queues.get_mut(queue).map_or(0, |q| {
            let count = q.items.len() as u64;
            q.items.clear();
            count
        }))
    }

    async fn list_queues(&self) -> MqResult<Vec<QueueInfo>> {
        let state = self.lock()?;
        Ok(state
            .queues
            .iter()
            .map(|(name, q)| QueueInfo {
                name: name.clone(),
                idle: q.last_activity.elapsed(),
            })
            .collect())
    }

    async fn delete_queue(&self, queue: &str) -> MqResult<()> {
        self.lock()?.queues.remove(queue);
        Ok(())
    }

    async fn delete_queue_if_idle(&self, queue: &str, idle: Duration) -> MqResult<bool> {
        let mut state = self.lock()?;
        let expired = state
            .queues
            .get(queue)
            .map_or(false, |q| q.last_activity.elapsed() > idle);
        if expired {
            state.queues.remove(queue);
        }
        Ok(expired)
    }

    async fn close(&self) -> MqResult<()> {
        self.closed.store(true, Ordering::Release);
        self.published.notify_waiters();
        Ok(())
    }
}
