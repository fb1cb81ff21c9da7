//! Message queue server: hosts handlers and supervises their workers.
//!
//! ## Lifecycle
//!
//! ```text
//!            start()              (workers spawned)
//! Stopped ───────────▶ Starting ─────────────────▶ Started
//!    ▲                                                │ stop()
//!    └──────────────── Stopping ◀─────────────────────┘
//!                    (workers joined)
//!
//! dispose(): any state → Disposed (terminal)
//! ```
//!
//! Each `Stopped → Started` transition spawns one generation of workers. A
//! generation is fully joined before the server reports `Stopped`, so two
//! generations never overlap.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Write as _};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{MqConfig, MIN_POLL_INTERVAL_MS};
use crate::error::{MqError, MqResult};
use crate::handler::{
    log_registration, ExceptionHandler, Failure, FailureAction, GetMessageFilter, HandlerOptions,
    HandlerResult, MessageHandler, PipelineHooks, ResponseFilter, StatsSnapshot,
};
use crate::queue::{
    ClientFilters, Message, MessageQueueClient, PublishFilter, QueueMessage, QueueNameSet,
    QueueNames, ReceiveFilter, Received,
};
use crate::transport::{DefaultTransportFactory, FailoverTransport, Headers, Transport};

/// Observable server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerStatus {
    Disposed = 0,
    Stopped = 1,
    Starting = 2,
    Started = 3,
    Stopping = 4,
}

impl ServerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServerStatus::Stopped,
            2 => ServerStatus::Starting,
            3 => ServerStatus::Started,
            4 => ServerStatus::Stopping,
            _ => ServerStatus::Disposed,
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Worker and retry settings fixed when the server is built.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub retry_count: u32,
    pub worker_threads: usize,
    pub poll_interval: Duration,
    /// Backoff bounds after a transport failure (min, max).
    pub restart_backoff: (Duration, Duration),
    pub temp_queue_idle: Duration,
    /// Run a temp-queue sweep this often while started.
    pub temp_queue_sweep: Option<Duration>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            retry_count: 1,
            worker_threads: 1,
            poll_interval: Duration::from_millis(250),
            restart_backoff: (Duration::from_millis(100), Duration::from_secs(5)),
            temp_queue_idle: Duration::from_secs(3600),
            temp_queue_sweep: None,
        }
    }
}

impl ServerSettings {
    pub fn from_config(config: &MqConfig) -> Self {
        Self {
            retry_count: config.retry_count,
            worker_threads: config.worker_threads.max(1),
            poll_interval: config.poll_interval(),
            restart_backoff: config.restart_backoff(),
            temp_queue_idle: config.temp_queue_idle(),
            temp_queue_sweep: config.temp_queue_sweep(),
        }
    }
}

struct Generation {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct ServerInner {
    state: AtomicU8,
    state_changed: Notify,
    transport: Arc<dyn Transport>,
    failover: Option<Arc<FailoverTransport>>,
    names: Arc<QueueNames>,
    settings: ServerSettings,
    hooks: Arc<PipelineHooks>,
    filters: ClientFilters,
    exception_handlers: HashMap<&'static str, ExceptionHandler>,
    default_exception_handler: Option<ExceptionHandler>,
    handlers: RwLock<BTreeMap<&'static str, Arc<MessageHandler>>>,
    generation: Mutex<Option<Generation>>,
    bg_thread_count: AtomicU64,
    live_workers: Arc<AtomicUsize>,
}

impl ServerInner {
    fn status(&self) -> ServerStatus {
        ServerStatus::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ServerStatus, to: ServerStatus) -> Result<(), ServerStatus> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ServerStatus::from_u8)
    }

    fn settle(&self, to: ServerStatus) {
        self.state.store(to as u8, Ordering::Release);
        self.state_changed.notify_waiters();
    }

    async fn join_generation(&self) {
        let generation = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(generation) = generation else {
            return;
        };

        // Receivers only go away when their task has already exited.
        let _ = generation.shutdown.send(true);
        for task in generation.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "mq_worker_join_failed");
            }
        }
    }
}

/// Hosts message handlers and runs their workers against a [`Transport`].
///
/// Cloning is cheap; clones control the same server.
#[derive(Clone)]
pub struct MqServer {
    inner: Arc<ServerInner>,
}

impl MqServer {
    pub fn builder(transport: Arc<dyn Transport>) -> MqServerBuilder {
        MqServerBuilder::new(transport)
    }

    /// Connect to `config.url` behind a failover transport and build a server
    /// from the remaining settings.
    pub async fn connect(config: &MqConfig) -> MqResult<Self> {
        Ok(MqServerBuilder::connect(config).await?.build())
    }

    pub fn status(&self) -> ServerStatus {
        self.inner.status()
    }

    /// Number of worker generations started so far.
    pub fn bg_thread_count(&self) -> u64 {
        self.inner.bg_thread_count.load(Ordering::Acquire)
    }

    /// Workers currently running their receive loop.
    pub fn live_worker_count(&self) -> usize {
        self.inner.live_workers.load(Ordering::Acquire)
    }

    pub fn names(&self) -> &Arc<QueueNames> {
        &self.inner.names
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.inner.settings
    }

    /// Register a handler for `T` that may reply with `R`.
    ///
    /// Re-registering a type replaces the previous handler (and its stats). A
    /// running server picks up registrations on its next start.
    pub fn register_handler<T, R, F, Fut>(&self, callback: F) -> MqResult<()>
    where
        T: QueueMessage,
        R: QueueMessage,
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        self.register_handler_with(HandlerOptions::default(), callback)
    }

    pub fn register_handler_with<T, R, F, Fut>(
        &self,
        options: HandlerOptions,
        callback: F,
    ) -> MqResult<()>
    where
        T: QueueMessage,
        R: QueueMessage,
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        self.register(MessageHandler::new(callback).with_options(options))
    }

    /// Register a handler for `T` that never replies.
    pub fn register_one_way<T, F, Fut>(&self, callback: F) -> MqResult<()>
    where
        T: QueueMessage,
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Failure>> + Send + 'static,
    {
        self.register_one_way_with(HandlerOptions::default(), callback)
    }

    pub fn register_one_way_with<T, F, Fut>(
        &self,
        options: HandlerOptions,
        callback: F,
    ) -> MqResult<()>
    where
        T: QueueMessage,
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Failure>> + Send + 'static,
    {
        self.register(MessageHandler::one_way(callback).with_options(options))
    }

    fn register(&self, handler: MessageHandler) -> MqResult<()> {
        if self.status() == ServerStatus::Disposed {
            return Err(MqError::ObjectDisposed);
        }

        let inner = &self.inner;
        let exception_handler = inner
            .exception_handlers
            .get(handler.type_name())
            .or(inner.default_exception_handler.as_ref())
            .cloned();
        let handler = handler
            .with_retry_count(inner.settings.retry_count)
            .with_exception_handler(exception_handler)
            .with_hooks(Arc::clone(&inner.hooks));

        let worker_threads = worker_threads_for(&handler, &inner.settings);
        log_registration(&handler, worker_threads);

        let mut handlers = inner.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.insert(handler.type_name(), Arc::new(handler));
        Ok(())
    }

    /// Type names with a registered handler.
    pub fn handler_types(&self) -> Vec<&'static str> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// A client sharing this server's transport, queue names and filters.
    pub fn create_message_queue_client(&self) -> MessageQueueClient {
        MessageQueueClient::new(
            Arc::clone(&self.inner.transport),
            Arc::clone(&self.inner.names),
        )
        .with_filters(self.inner.filters.clone())
        .with_poll_interval(self.inner.settings.poll_interval)
    }

    /// Start one worker generation.
    ///
    /// Concurrent callers race on a single `Stopped → Starting` transition; the
    /// losers wait for the winner and return once the server is started.
    pub async fn start(&self) -> MqResult<()> {
        loop {
            let changed = self.inner.state_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self
                .inner
                .transition(ServerStatus::Stopped, ServerStatus::Starting)
            {
                Ok(()) => break,
                Err(ServerStatus::Disposed) => return Err(MqError::ObjectDisposed),
                Err(ServerStatus::Started) => return Ok(()),
                Err(_) => changed.await,
            }
        }

        // No await between the transition and settling, so a dropped caller
        // cannot leave the server in `Starting`.
        let generation = self.spawn_generation();
        let workers = generation.tasks.len();
        *self
            .inner
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(generation);

        let generations = self.inner.bg_thread_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.settle(ServerStatus::Started);

        info!(
            tasks = workers,
            generation = generations,
            "mq_server_started"
        );
        Ok(())
    }

    /// Signal every worker of the current generation and wait for them to exit.
    ///
    /// Stopping a stopped server is a no-op.
    pub async fn stop(&self) -> MqResult<()> {
        loop {
            let changed = self.inner.state_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self
                .inner
                .transition(ServerStatus::Started, ServerStatus::Stopping)
            {
                Ok(()) => break,
                Err(ServerStatus::Disposed) => return Err(MqError::ObjectDisposed),
                Err(ServerStatus::Stopped) => return Ok(()),
                Err(_) => changed.await,
            }
        }

        // Joining runs in its own task so the server still settles if the
        // caller stops waiting.
        let inner = Arc::clone(&self.inner);
        let settle = tokio::spawn(async move {
            inner.join_generation().await;
            inner.settle(ServerStatus::Stopped);
            info!("mq_server_stopped");
        });
        if let Err(e) = settle.await {
            error!(error = %e, "mq_server_stop_failed");
            self.inner.settle(ServerStatus::Stopped);
        }
        Ok(())
    }

    /// Stop the server and release the transport. Irreversible; repeat calls
    /// are no-ops.
    pub async fn dispose(&self) -> MqResult<()> {
        loop {
            let changed = self.inner.state_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self.status() {
                ServerStatus::Disposed => return Ok(()),
                ServerStatus::Started => {
                    // Lost races surface as ObjectDisposed; the loop re-reads state.
                    if let Err(e) = self.stop().await {
                        debug!(error = %e, "mq_server_dispose_stop_skipped");
                    }
                }
                ServerStatus::Stopped => {
                    if self
                        .inner
                        .transition(ServerStatus::Stopped, ServerStatus::Disposed)
                        .is_ok()
                    {
                        break;
                    }
                }
                ServerStatus::Starting | ServerStatus::Stopping => changed.await,
            }
        }
        self.inner.state_changed.notify_waiters();

        if let Err(e) = self.inner.transport.close().await {
            warn!(error = %e, "mq_transport_close_error");
        }
        info!("mq_server_disposed");
        Ok(())
    }

    /// Retarget the server to another broker without restarting workers.
    pub async fn failover_to(&self, endpoint: &str) -> MqResult<()> {
        let failover = self.inner.failover.as_ref().ok_or_else(|| {
            MqError::Configuration("server was not built with a failover transport".to_string())
        })?;
        failover.failover_to(endpoint).await
    }

    /// Delete temporary queues idle for longer than `idle`.
    pub async fn expire_temp_queues(&self, idle: Duration) -> MqResult<usize> {
        self.create_message_queue_client()
            .expire_temp_queues(idle)
            .await
    }

    /// Per-handler counters, ordered by type name.
    pub fn handler_stats(&self) -> Vec<StatsSnapshot> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|handler| handler.stats())
            .collect()
    }

    /// Counters summed over every handler.
    pub fn stats(&self) -> StatsSnapshot {
        let mut total = StatsSnapshot {
            name: "All Handlers".to_string(),
            ..Default::default()
        };
        for stats in self.handler_stats() {
            total.add(&stats);
        }
        total
    }

    pub fn stats_description(&self) -> String {
        let mut description = String::new();
        let _ = writeln!(description, "STATS:");
        let _ = writeln!(description, "  status: {}", self.status());
        let _ = writeln!(description, "  transport: {}", self.inner.transport.name());
        let _ = writeln!(description, "  generations: {}", self.bg_thread_count());
        let _ = writeln!(description, "  live workers: {}", self.live_worker_count());
        let _ = writeln!(description, "  {}", self.stats());
        for stats in self.handler_stats() {
            let _ = writeln!(description, "    {}", stats);
        }
        description
    }

    fn spawn_generation(&self) -> Generation {
        let inner = &self.inner;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let client = Arc::new(self.create_message_queue_client());
        let handlers: Vec<Arc<MessageHandler>> = inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut tasks = Vec::new();
        for handler in handlers {
            let names = inner.names.for_type(handler.type_name());
            for worker_id in 0..worker_threads_for(&handler, &inner.settings) {
                let worker = Worker {
                    id: worker_id,
                    handler: Arc::clone(&handler),
                    client: Arc::clone(&client),
                    names: Arc::clone(&names),
                    poll_interval: inner.settings.poll_interval,
                    restart_backoff: inner.settings.restart_backoff,
                    shutdown: shutdown_rx.clone(),
                    live: LiveWorker::enter(Arc::clone(&inner.live_workers)),
                };
                tasks.push(tokio::spawn(worker.run()));
            }
        }

        if let Some(interval) = inner.settings.temp_queue_sweep {
            tasks.push(tokio::spawn(sweep_temp_queues(
                Arc::clone(&client),
                interval,
                inner.settings.temp_queue_idle,
                shutdown_rx,
            )));
        }

        Generation { shutdown, tasks }
    }
}

impl fmt::Debug for MqServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqServer")
            .field("status", &self.status())
            .field("transport", &self.inner.transport.name())
            .field("names", &self.inner.names)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

fn worker_threads_for(handler: &MessageHandler, settings: &ServerSettings) -> usize {
    handler
        .options()
        .worker_threads
        .unwrap_or(settings.worker_threads)
        .max(1)
}

/// Counts a worker as live from spawn until its task finishes.
struct LiveWorker(Arc<AtomicUsize>);

impl LiveWorker {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Worker {
    id: usize,
    handler: Arc<MessageHandler>,
    client: Arc<MessageQueueClient>,
    names: Arc<QueueNameSet>,
    poll_interval: Duration,
    restart_backoff: (Duration, Duration),
    shutdown: watch::Receiver<bool>,
    live: LiveWorker,
}

impl Worker {
    async fn run(self) {
        let Worker {
            id,
            handler,
            client,
            names,
            poll_interval,
            restart_backoff,
            mut shutdown,
            live: _live,
        } = self;
        let type_name = handler.type_name();
        debug!(type_name = type_name, worker_id = id, "mq_worker_started");

        let mut consecutive_failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            // Shutdown may interrupt the wait for a message, never its processing.
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = next_message(&client, &names, poll_interval) => next,
            };

            let result = match next {
                Ok(Some(received)) => handler.process(&client, received).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => consecutive_failures = 0,
                Err(e) if e.is_transport_error() => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let delay = backoff_delay(restart_backoff, consecutive_failures);
                    warn!(
                        type_name = type_name,
                        worker_id = id,
                        error = %e,
                        attempt = consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        "mq_worker_transport_error"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(
                        type_name = type_name,
                        worker_id = id,
                        error = %e,
                        "mq_worker_message_error"
                    );
                }
            }
        }

        debug!(type_name = type_name, worker_id = id, "mq_worker_stopped");
    }
}

/// Priority messages first, then block on the in queue for one poll interval.
async fn next_message(
    client: &MessageQueueClient,
    names: &QueueNameSet,
    wait: Duration,
) -> MqResult<Option<Received<Value>>> {
    if let Some(received) = client.try_get(&names.priority_q).await? {
        return Ok(Some(received));
    }
    client.receive(&names.in_q, wait).await
}

/// Exponential backoff capped at `max`, with jitter over the upper half.
fn backoff_delay((min, max): (Duration, Duration), attempt: u32) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = (max.as_millis() as u64).max(min_ms);
    let exp = min_ms
        .saturating_mul(1u64 << attempt.saturating_sub(1).min(20))
        .min(max_ms);
    if exp == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(exp / 2..=exp))
}

async fn sweep_temp_queues(
    client: Arc<MessageQueueClient>,
    interval: Duration,
    idle: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = client.expire_temp_queues(idle).await {
                    warn!(error = %e, "mq_temp_queue_sweep_failed");
                }
            }
        }
    }
}

/// Builds an [`MqServer`]. Hooks and settings are fixed once built.
pub struct MqServerBuilder {
    transport: Arc<dyn Transport>,
    failover: Option<Arc<FailoverTransport>>,
    names: QueueNames,
    settings: ServerSettings,
    hooks: PipelineHooks,
    filters: ClientFilters,
    exception_handlers: HashMap<&'static str, ExceptionHandler>,
    default_exception_handler: Option<ExceptionHandler>,
}

impl MqServerBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            failover: None,
            names: QueueNames::new(),
            settings: ServerSettings::default(),
            hooks: PipelineHooks::default(),
            filters: ClientFilters::default(),
            exception_handlers: HashMap::new(),
            default_exception_handler: None,
        }
    }

    /// Build on a failover transport so the server can be retargeted at runtime.
    pub fn with_failover(failover: Arc<FailoverTransport>) -> Self {
        let transport: Arc<dyn Transport> = failover.clone();
        let mut builder = Self::new(transport);
        builder.failover = Some(failover);
        builder
    }

    /// Connect to `config.url` and apply every setting from `config`.
    pub async fn connect(config: &MqConfig) -> MqResult<Self> {
        let names = QueueNames::new().with_prefix(config.queue_prefix.clone());
        let factory = Arc::new(
            DefaultTransportFactory::new()
                .with_poll_interval(config.poll_interval())
                .with_temp_queue_filter(Arc::new(move |queue: &str| names.is_temp_queue(queue))),
        );
        let failover = Arc::new(FailoverTransport::connect(&config.url, factory).await?);
        Ok(Self::with_failover(failover).config(config))
    }

    /// Apply settings, queue prefix and publishing switches from `config`.
    pub fn config(mut self, config: &MqConfig) -> Self {
        self.settings = ServerSettings::from_config(config);
        self.names = QueueNames::new().with_prefix(config.queue_prefix.clone());
        self.hooks.disable_publishing_responses = config.disable_responses;
        self.hooks.disable_publishing_to_outq = config.disable_outq;
        self
    }

    pub fn queue_names(mut self, names: QueueNames) -> Self {
        self.names = names;
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.settings.retry_count = retry_count;
        self
    }

    pub fn worker_threads(mut self, worker_threads: usize) -> Self {
        self.settings.worker_threads = worker_threads.max(1);
        self
    }

    /// Raised to at least [`MIN_POLL_INTERVAL_MS`].
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.settings.poll_interval =
            poll_interval.max(Duration::from_millis(MIN_POLL_INTERVAL_MS));
        self
    }

    pub fn restart_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.settings.restart_backoff = (min, max.max(min));
        self
    }

    pub fn temp_queue_sweep(mut self, interval: Duration, idle: Duration) -> Self {
        self.settings.temp_queue_sweep = Some(interval);
        self.settings.temp_queue_idle = idle;
        self
    }

    pub fn disable_publishing_responses(mut self, disabled: bool) -> Self {
        self.hooks.disable_publishing_responses = disabled;
        self
    }

    pub fn disable_publishing_to_outq(mut self, disabled: bool) -> Self {
        self.hooks.disable_publishing_to_outq = disabled;
        self
    }

    pub fn publish_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, &mut Headers) + Send + Sync + 'static,
    {
        let filter: PublishFilter = Arc::new(filter);
        self.filters.publish = Some(filter);
        self
    }

    pub fn receive_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, &Headers) + Send + Sync + 'static,
    {
        let filter: ReceiveFilter = Arc::new(filter);
        self.filters.receive = Some(filter);
        self
    }

    pub fn get_message_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, &Message<Value>) + Send + Sync + 'static,
    {
        let filter: GetMessageFilter = Arc::new(filter);
        self.hooks.get_message_filter = Some(filter);
        self
    }

    pub fn response_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, &mut Message<Value>) + Send + Sync + 'static,
    {
        let filter: ResponseFilter = Arc::new(filter);
        self.hooks.response_filter = Some(filter);
        self
    }

    /// Replace the retry policy for messages of type `T`.
    pub fn exception_handler<T, F>(mut self, handler: F) -> Self
    where
        T: QueueMessage,
        F: Fn(&MessageHandler, &Message<Value>, &Failure) -> FailureAction + Send + Sync + 'static,
    {
        self.exception_handlers.insert(T::TYPE_NAME, Arc::new(handler));
        self
    }

    /// Replace the retry policy for every type without its own exception handler.
    pub fn default_exception_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&MessageHandler, &Message<Value>, &Failure) -> FailureAction + Send + Sync + 'static,
    {
        self.default_exception_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> MqServer {
        info!(
            transport = self.transport.name(),
            prefix = self.names.prefix(),
            retry_count = self.settings.retry_count,
            worker_threads = self.settings.worker_threads,
            "mq_server_created"
        );

        MqServer {
            inner: Arc::new(ServerInner {
                state: AtomicU8::new(ServerStatus::Stopped as u8),
                state_changed: Notify::new(),
                transport: self.transport,
                failover: self.failover,
                names: Arc::new(self.names),
                settings: self.settings,
                hooks: Arc::new(self.hooks),
                filters: self.filters,
                exception_handlers: self.exception_handlers,
                default_exception_handler: self.default_exception_handler,
                handlers: RwLock::new(BTreeMap::new()),
                generation: Mutex::new(None),
                bg_thread_count: AtomicU64::new(0),
                live_workers: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }
}
